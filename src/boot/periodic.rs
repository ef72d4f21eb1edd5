use crate::core::{BootError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Background polling loop owned by a collaborator.
///
/// The loop ends when its token is cancelled or `stop` is called. Dropping
/// the handle aborts the task.
pub struct PeriodicTask {
    name: String,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<u64>>,
}

impl PeriodicTask {
    /// Runs `tick` every `interval` (first run after one interval).
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        token: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_name = name.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {
                        tick().await;
                        ticks += 1;
                    }
                }
            }
            event!(Level::DEBUG, task = %task_name, ticks, "periodic task stopped");
            ticks
        });

        Self {
            name,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Signals the loop to stop and waits for it. Returns the tick count.
    pub async fn stop(mut self) -> Result<u64> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        match self.join_handle.take() {
            Some(join_handle) => join_handle.await.map_err(|err| {
                BootError::Io(format!("periodic task '{}' join: {}", self.name, err))
            }),
            None => Ok(0),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
