use super::Availability;
use crate::config::FallbackMode;

/// Observer of fallback transitions, register with [`FallbackManager::add_hooks`](super::FallbackManager::add_hooks).
#[async_trait::async_trait]
pub trait FallbackHooks: Send + Sync {
    /// the availability estimate changed
    async fn on_availability_change(&self, _from: Availability, _to: Availability) {}

    /// a degraded mode became active
    async fn on_activate(&self, _mode: FallbackMode, _reason: &str) {}

    /// the active degraded mode was left
    async fn on_deactivate(&self, _mode: FallbackMode, _reason: &str) {}
}
