use super::services::{FaultPlan, collaborators};
use anyhow::{Context, Result, anyhow, bail};
use bootseq::{
    BootConfig, BootOrchestrator, BootProgressCalculator, BootStatus, CircuitBreakerRegistry,
    DiagnosticExport, ErrorCategory,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

#[derive(Parser, Debug)]
#[command(name = "bootseq")]
#[command(about = "Runs a simulated staged application boot and prints its telemetry")]
pub struct Cli {
    /// JSON boot configuration; defaults apply to anything left out
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Make a service fail, as NAME or NAME:CATEGORY (default category: permanent)
    #[arg(long = "fail", value_name = "NAME[:CATEGORY]")]
    pub failures: Vec<String>,

    /// Add latency to a service, as NAME=MILLIS
    #[arg(long = "slow", value_name = "NAME=MILLIS")]
    pub slow: Vec<String>,

    /// Declare a dependency cycle between localization and theme
    #[arg(long)]
    pub cycle: bool,

    /// Cancel the boot after this many milliseconds
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,

    /// Override the services stage deadline
    #[arg(long)]
    pub stage1_deadline_ms: Option<u64>,

    /// Write the full diagnostic export here instead of printing the session
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Suppress progress lines
    #[arg(long)]
    pub quiet: bool,
}

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    pub async fn run(&self) -> Result<BootStatus> {
        let mut config = match &self.cli.config {
            Some(path) => BootConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BootConfig::new(),
        };
        if let Some(ms) = self.cli.stage1_deadline_ms {
            config = config.stage1_deadline(Duration::from_millis(ms));
        }

        let faults = self.fault_plan()?;
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        let shutdown = CancellationToken::new();
        let parts = collaborators(&config, &breakers, &faults, self.cli.cycle, &shutdown);

        let mut builder = BootOrchestrator::builder()
            .config(config)
            .services(parts.services);
        for task in parts.bootstrap {
            builder = builder.bootstrap_task(task);
        }
        for task in parts.ready {
            builder = builder.ready_task(task);
        }
        let orchestrator = builder.build()?;

        let token = CancellationToken::new();
        self.spawn_cancellers(&token);
        let printer = (!self.cli.quiet).then(|| spawn_progress_printer(&orchestrator));

        let session = orchestrator.run(token).await?;
        if let Some(printer) = printer {
            printer.abort();
        }
        if !self.cli.quiet {
            let last = orchestrator.latest_progress();
            eprintln!("[{:>3}%] {}", last.overall_percent, last.status_message);
        }

        if let Some(ticks) = parts.message_bus.stop_heartbeat().await {
            event!(Level::DEBUG, ticks, "message bus heartbeat stopped");
        }
        shutdown.cancel();

        match &self.cli.export {
            Some(path) => {
                let export = DiagnosticExport::new(session.clone(), breakers.snapshot());
                export
                    .write_to_file(path)
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("diagnostics written to {}", path.display());
            }
            None => println!("{}", serde_json::to_string_pretty(&session)?),
        }

        Ok(session.status)
    }

    fn spawn_cancellers(&self, token: &CancellationToken) {
        if let Some(ms) = self.cli.cancel_after_ms {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(ms)).await;
                event!(Level::WARN, after_ms = ms, "cancelling boot");
                token.cancel();
            });
        }

        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    fn fault_plan(&self) -> Result<FaultPlan> {
        let mut plan = FaultPlan::new();

        for entry in &self.cli.failures {
            let (name, category) = match entry.split_once(':') {
                Some((name, category)) => (name, parse_category(category)?),
                None => (entry.as_str(), ErrorCategory::Permanent),
            };
            plan.entry(name.to_string()).or_default().failure = Some(category);
        }

        for entry in &self.cli.slow {
            let (name, millis) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected NAME=MILLIS, got '{entry}'"))?;
            let millis: u64 = millis
                .parse()
                .with_context(|| format!("invalid latency in '{entry}'"))?;
            plan.entry(name.to_string()).or_default().extra_latency = Duration::from_millis(millis);
        }

        Ok(plan)
    }
}

fn parse_category(raw: &str) -> Result<ErrorCategory> {
    let category = match raw.to_ascii_lowercase().as_str() {
        "transient" => ErrorCategory::Transient,
        "configuration" | "config" => ErrorCategory::Configuration,
        "permission" => ErrorCategory::Permission,
        "storage" => ErrorCategory::Storage,
        "resource" => ErrorCategory::Resource,
        "programming" => ErrorCategory::Programming,
        "permanent" => ErrorCategory::Permanent,
        other => bail!("unknown error category '{other}'"),
    };
    Ok(category)
}

fn spawn_progress_printer(orchestrator: &BootOrchestrator) -> tokio::task::JoinHandle<()> {
    let mut progress = orchestrator.subscribe_progress();
    let started = Instant::now();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let update = progress.borrow_and_update().clone();
            let remaining = BootProgressCalculator::estimate_time_remaining(
                update.overall_percent,
                started.elapsed(),
            );
            eprintln!(
                "[{:>3}%] Stage {} ({}) {:>3}% {} {}",
                update.overall_percent,
                update.stage_number,
                update.stage_name,
                update.stage_percent,
                update.status_message,
                BootProgressCalculator::format_time_remaining(remaining)
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_plan_parsing() {
        let cli = Cli::parse_from([
            "bootseq",
            "--fail",
            "database:transient",
            "--fail",
            "theme",
            "--slow",
            "database=500",
        ]);
        let plan = App::new(cli).fault_plan().unwrap();

        let database = &plan["database"];
        assert_eq!(database.failure, Some(ErrorCategory::Transient));
        assert_eq!(database.extra_latency, Duration::from_millis(500));
        assert_eq!(plan["theme"].failure, Some(ErrorCategory::Permanent));
    }

    #[test]
    fn test_bad_slow_spec_is_rejected() {
        let cli = Cli::parse_from(["bootseq", "--slow", "database"]);
        assert!(App::new(cli).fault_plan().is_err());
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        assert!(parse_category("cosmic").is_err());
        assert_eq!(parse_category("Storage").unwrap(), ErrorCategory::Storage);
    }
}
