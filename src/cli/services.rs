use async_trait::async_trait;
use bootseq::{
    BootConfig, CircuitBreakerRegistry, ErrorCategory, ExponentialBackoff, InitError, PeriodicTask,
    ResiliencePolicy, ServiceDescriptor, ServiceInitializer,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Fault injection knobs for one simulated collaborator.
#[derive(Debug, Clone, Default)]
pub struct Fault {
    pub failure: Option<ErrorCategory>,
    pub extra_latency: Duration,
}

pub type FaultPlan = HashMap<String, Fault>;

/// Stand-in collaborator that sleeps, then succeeds or fails as configured.
/// Network-facing ones go through a resilience policy.
pub struct SimulatedService {
    name: String,
    latency: Duration,
    failure: Option<ErrorCategory>,
    policy: Option<ResiliencePolicy>,
}

impl SimulatedService {
    fn new(name: &str, latency_ms: u64, fault: Option<&Fault>) -> Self {
        let fault = fault.cloned().unwrap_or_default();
        Self {
            name: name.to_string(),
            latency: Duration::from_millis(latency_ms) + fault.extra_latency,
            failure: fault.failure,
            policy: None,
        }
    }

    fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    async fn attempt(&self, token: &CancellationToken, attempt: u32) -> Result<(), InitError> {
        tokio::select! {
            _ = token.cancelled() => {
                return Err(InitError::cancelled(format!("{} init interrupted", self.name)));
            }
            _ = sleep(self.latency) => {}
        }

        match self.failure {
            Some(category) => Err(InitError::new(
                category,
                format!("simulated {category} failure (attempt {attempt})"),
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServiceInitializer for SimulatedService {
    async fn initialize(&self, token: CancellationToken) -> Result<(), InitError> {
        match &self.policy {
            Some(policy) => policy
                .call(&token, |attempt| self.attempt(&token, attempt))
                .await
                .map_err(InitError::from),
            None => self.attempt(&token, 1).await,
        }
    }
}

/// Message bus whose init leaves a heartbeat poller running for the rest of
/// the process.
pub struct MessageBus {
    inner: SimulatedService,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<PeriodicTask>>,
}

impl MessageBus {
    fn new(inner: SimulatedService, shutdown: CancellationToken) -> Self {
        Self {
            inner,
            shutdown,
            heartbeat: Mutex::new(None),
        }
    }

    /// Stops the heartbeat if the bus came up. Returns the tick count.
    pub async fn stop_heartbeat(&self) -> Option<u64> {
        let task = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        task.stop().await.ok()
    }
}

#[async_trait]
impl ServiceInitializer for MessageBus {
    async fn initialize(&self, token: CancellationToken) -> Result<(), InitError> {
        self.inner.initialize(token).await?;

        let task = PeriodicTask::spawn(
            "message_bus.heartbeat",
            Duration::from_millis(250),
            self.shutdown.child_token(),
            || async {
                event!(Level::TRACE, "message bus heartbeat");
            },
        );
        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }
}

/// The simulated collaborator set, by stage.
pub struct Collaborators {
    pub bootstrap: Vec<ServiceDescriptor>,
    pub services: Vec<ServiceDescriptor>,
    pub ready: Vec<ServiceDescriptor>,
    pub message_bus: Arc<MessageBus>,
}

pub fn collaborators(
    config: &BootConfig,
    breakers: &CircuitBreakerRegistry,
    faults: &FaultPlan,
    with_cycle: bool,
    shutdown: &CancellationToken,
) -> Collaborators {
    let simulated = |name: &str, latency_ms: u64| -> Arc<dyn ServiceInitializer> {
        Arc::new(SimulatedService::new(name, latency_ms, faults.get(name)))
    };
    let guarded = |name: &str, latency_ms: u64| -> Arc<dyn ServiceInitializer> {
        let policy = ResiliencePolicy::new(
            breakers.get(name),
            ExponentialBackoff::new(config.backoff.clone()),
        );
        Arc::new(SimulatedService::new(name, latency_ms, faults.get(name)).with_policy(policy))
    };

    let message_bus = Arc::new(MessageBus::new(
        SimulatedService::new("message_bus", 120, faults.get("message_bus")),
        shutdown.clone(),
    ));

    let bootstrap = vec![
        ServiceDescriptor::new("configuration", simulated("configuration", 40)),
        ServiceDescriptor::new("secret_store", simulated("secret_store", 30)),
        ServiceDescriptor::new("logging", simulated("logging", 20)),
    ];

    let mut localization = ServiceDescriptor::new("localization", simulated("localization", 90));
    if with_cycle {
        localization = localization.depends_on("theme");
    }

    let services = vec![
        ServiceDescriptor::new("diagnostics", simulated("diagnostics", 60)).optional(),
        ServiceDescriptor::new("database", guarded("database", 250)),
        ServiceDescriptor::new("remote_api", guarded("remote_api", 200)).optional(),
        ServiceDescriptor::new("cache", simulated("cache", 80))
            .depends_on("database")
            .optional(),
        ServiceDescriptor::new("message_bus", message_bus.clone()).optional(),
        ServiceDescriptor::new("validation", simulated("validation", 50)).depends_on("database"),
        ServiceDescriptor::new("mapping", simulated("mapping", 70))
            .depends_on_all(["database", "remote_api"])
            .optional(),
        localization,
        ServiceDescriptor::new("theme", simulated("theme", 40))
            .depends_on("localization")
            .optional(),
    ];

    let ready = vec![ServiceDescriptor::new("navigation", simulated("navigation", 60))];

    Collaborators {
        bootstrap,
        services,
        ready,
        message_bus,
    }
}
