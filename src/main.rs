mod cli;

use crate::cli::app::{App, Cli};
use anyhow::bail;
use bootseq::BootStatus;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let app = App::new(Cli::parse());
    let status = app.run().await?;
    if status != BootStatus::Success {
        bail!("boot finished with status {status:?}");
    }
    Ok(())
}
