//! Connection lifecycle observers.

use crate::{
    session::{ClientInfo, DisconnectReason},
    transport::TransportError,
};

/// Observer of connection lifecycle, register with [`ConnectionManager::add_hooks`](super::ConnectionManager::add_hooks).
///
/// All callbacks default to doing nothing, they run in registration order
/// on the task that caused the transition.
#[async_trait::async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// a connection is accepted and registered
    async fn on_connect(&self, _session_id: &str, _client_info: &ClientInfo) {}

    /// a connection was released
    async fn on_disconnect(&self, _session_id: &str, _reason: DisconnectReason) {}

    /// handshake failed or transport faulted
    async fn on_error(&self, _session_id: &str, _error: &TransportError) {}
}
