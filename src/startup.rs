//! Start-on-boot registration boundary. Registration with the host OS is
//! an explicit Non-goal; the supervisor only stores the toggle and
//! forwards it to this collaborator.

use async_trait::async_trait;

#[async_trait]
pub trait StartOnBoot: Send + Sync {
    async fn set_enabled(&self, enabled: bool);
    async fn is_enabled(&self) -> bool;
}

/// Ships as the default wiring — accepts the toggle but performs no host
/// registration. A real deployment supplies an OS-specific implementation.
#[derive(Default)]
pub struct NoopStartOnBoot;

#[async_trait]
impl StartOnBoot for NoopStartOnBoot {
    async fn set_enabled(&self, _enabled: bool) {}
    async fn is_enabled(&self) -> bool {
        false
    }
}
