use crate::core::{Criticality, InitError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Async initialization contract every collaborator exposes to the boot.
///
/// Implementations should check `token` at their await points and return
/// promptly once it is cancelled.
#[async_trait]
pub trait ServiceInitializer: Send + Sync {
    async fn initialize(&self, token: CancellationToken) -> Result<(), InitError>;
}

/// Adapts a closure returning a future into a [`ServiceInitializer`].
pub struct FnInitializer<F> {
    func: F,
}

impl<F> FnInitializer<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> ServiceInitializer for FnInitializer<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), InitError>> + Send + 'static,
{
    async fn initialize(&self, token: CancellationToken) -> Result<(), InitError> {
        (self.func)(token).await
    }
}

/// A named unit of startup work with its declared dependencies.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub dependencies: BTreeSet<String>,
    pub criticality: Criticality,
    pub initializer: Arc<dyn ServiceInitializer>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, initializer: Arc<dyn ServiceInitializer>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            criticality: Criticality::Required,
            initializer,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), InitError>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnInitializer::new(func)))
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn depends_on_all<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.criticality = Criticality::Optional;
        self
    }

    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn is_required(&self) -> bool {
        self.criticality == Criticality::Required
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("criticality", &self.criticality)
            .finish_non_exhaustive()
    }
}
