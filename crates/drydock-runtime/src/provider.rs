use crate::ProviderError;
use async_trait::async_trait;
use drydock_schema::{Resource, SchemaError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle driver for a single resource instance.
///
/// Providers receive the resource they act on and may write output
/// properties (addresses, assigned ports, image ids) into
/// `resource.meta.properties`. All operations must return promptly with
/// [`ProviderError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create(
        &self,
        resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Idempotent: destroying something that does not exist succeeds.
    async fn destroy(
        &self,
        resource: &mut Resource,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Reconcile external state with the declaration without recreating.
    async fn refresh(
        &self,
        resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// True if external state drifted since the last create.
    async fn changed(&self, _resource: &Resource) -> Result<bool, ProviderError> {
        Ok(false)
    }

    /// Backend ids observed as existing for this resource.
    async fn lookup(&self, _resource: &Resource) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}

/// Builds a provider for a resource. This is the provider's `init` step;
/// an `Err` means the resource is unusable for this type.
pub type ProviderFactory =
    Arc<dyn Fn(&Resource) -> Result<Box<dyn Provider>, ProviderError> + Send + Sync>;

/// Type prototype: the per-type part of parsing.
pub trait ResourceType: Send + Sync {
    /// Post-parse normalization. The default carries prior outputs over from
    /// the committed resource so providers see what they wrote last run.
    fn process(
        &self,
        resource: &mut Resource,
        committed: Option<&Resource>,
    ) -> Result<(), SchemaError> {
        carry_properties(resource, committed);
        Ok(())
    }
}

pub(crate) fn carry_properties(resource: &mut Resource, committed: Option<&Resource>) {
    if let Some(prior) = committed {
        for (k, v) in &prior.meta.properties {
            resource
                .meta
                .properties
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
    }
}

/// Wrap a closure as a [`ProviderFactory`].
pub fn factory<F>(f: F) -> ProviderFactory
where
    F: Fn(&Resource) -> Result<Box<dyn Provider>, ProviderError> + Send + Sync + 'static,
{
    Arc::new(f)
}
