//! Fallback provisioner boundary: when the pool call in
//! `choose_pool_provider` fails for any reason other than
//! `NoNonSelfProviders`, the supervisor asks this collaborator for a
//! stand-in provider rather than giving up the tick. Out of scope per
//! spec's "outbound HTTP plumbing" exclusion — only the trait is core.

use async_trait::async_trait;

use crate::provider::Provider;

#[async_trait]
pub trait FallbackProvisioner: Send + Sync {
    /// Produce a substitute provider to try this tick, or `None` if the
    /// fallback orchestrator has nothing to offer.
    async fn provision(&self) -> Option<Provider>;
}
