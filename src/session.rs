//! Session records, connection state machine and per-connection counters.

use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque client information given by the request layer when a connection is accepted
pub type ClientInfo = serde_json::Value;

/// milliseconds since unix epoch
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// State of the live connection bound to a session.
///
/// `Connecting -> Connected -> Disconnecting -> Disconnected`, or
/// `Connected -> Error -> Disconnected` when the transport faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// handshake in progress
    Connecting,
    /// registered and streaming
    Connected,
    /// teardown in progress
    Disconnecting,
    /// transport released
    Disconnected,
    /// transport faulted, cleanup pending
    Error,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// client closed the connection
    ClientInitiated,
    /// server side fault
    ServerError,
    /// heartbeat staleness or session expiry
    Timeout,
    /// rate limit policy
    RateLimit,
    /// transport probe failed
    NetworkError,
    /// process is shutting down
    GracefulShutdown,
}

impl DisconnectReason {
    /// short name, same as the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientInitiated => "client_initiated",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::NetworkError => "network_error",
            Self::GracefulShutdown => "graceful_shutdown",
        }
    }
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical client engagement, outlives the connections bound to it.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingSession {
    /// caller generated session id
    pub session_id: String,
    /// creation time, ms since unix epoch
    pub created_at: i64,
    /// last successful send or inbound message, ms since unix epoch
    pub last_activity: i64,
    /// opaque client info given on connect
    pub client_info: ClientInfo,
    /// opaque analysis binding config
    pub analysis_config: Option<serde_json::Value>,
    /// whether a connection is currently bound
    pub is_active: bool,
    /// events delivered to this session, also the last used sequence number
    pub events_sent: u64,

    #[serde(skip)]
    pub(crate) last_activity_at: Instant,
}

impl StreamingSession {
    pub(crate) fn new(session_id: String, client_info: ClientInfo) -> Self {
        let now = now_millis();
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            client_info,
            analysis_config: None,
            is_active: false,
            events_sent: 0,
            last_activity_at: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = now_millis();
        self.last_activity_at = Instant::now();
    }

    /// sequence number the next delivered event will carry
    pub fn next_sequence_number(&self) -> u64 {
        self.events_sent + 1
    }

    pub(crate) fn record_event_sent(&mut self) {
        self.events_sent += 1;
        self.touch();
    }
}

/// Traffic counters of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    /// session id
    pub session_id: String,
    /// when the current (or last) connection was accepted, ms since unix epoch
    pub connected_at: i64,
    /// last traffic in either direction, ms since unix epoch
    pub last_activity: i64,
    /// frames written to the client
    pub messages_sent: u64,
    /// frames reported received from the client
    pub messages_received: u64,
    /// bytes written to the client
    pub bytes_sent: u64,
    /// bytes reported received from the client
    pub bytes_received: u64,
    /// connections accepted after the first one
    pub reconnection_attempts: u64,
    /// connections closed
    pub total_disconnections: u64,
}

impl ConnectionMetrics {
    pub(crate) fn new(session_id: String) -> Self {
        let now = now_millis();
        Self {
            session_id,
            connected_at: now,
            last_activity: now,
            ..Default::default()
        }
    }

    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_activity = now_millis();
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
        self.last_activity = now_millis();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_and_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Disconnecting).unwrap(),
            json!("disconnecting")
        );
        assert_eq!(
            serde_json::to_value(DisconnectReason::GracefulShutdown).unwrap(),
            json!("graceful_shutdown")
        );
        assert_eq!(DisconnectReason::NetworkError.to_string(), "network_error");
    }

    #[test]
    fn test_session_counts_events() {
        let mut session = StreamingSession::new("s1".to_string(), json!({"agent": "test"}));
        assert_eq!(session.next_sequence_number(), 1);

        session.record_event_sent();
        session.record_event_sent();

        assert_eq!(session.events_sent, 2);
        assert_eq!(session.next_sequence_number(), 3);
    }

    #[test]
    fn test_metrics_counters() {
        let mut metrics = ConnectionMetrics::new("s1".to_string());
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(3);

        assert_eq!(metrics.messages_sent, 2);
        assert_eq!(metrics.bytes_sent, 15);
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.bytes_received, 3);
        assert_eq!(metrics.total_disconnections, 0);
    }
}
