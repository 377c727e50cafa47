use std::time::Duration;

use tokio::time::Instant;

use crate::session::{ClientInfo, ConnectionMetrics, ConnectionState, StreamingSession};

/// Long lived part of a session, kept after its connection is released.
#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub state: ConnectionState,
    pub session: StreamingSession,
    pub metrics: ConnectionMetrics,
    released_at: Option<Instant>,
}

impl SessionRecord {
    pub fn new(session_id: String, client_info: ClientInfo) -> Self {
        Self {
            state: ConnectionState::Connecting,
            metrics: ConnectionMetrics::new(session_id.clone()),
            session: StreamingSession::new(session_id, client_info),
            released_at: None,
        }
    }

    pub fn open(&mut self, client_info: ClientInfo, reconnect: bool) {
        if reconnect {
            self.metrics = ConnectionMetrics {
                connected_at: crate::session::now_millis(),
                reconnection_attempts: self.metrics.reconnection_attempts + 1,
                ..self.metrics.clone()
            };
            self.session.client_info = client_info;
        }

        self.state = ConnectionState::Connected;
        self.session.is_active = true;
        self.session.touch();
        self.released_at = None;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.session.record_event_sent();
        self.metrics.record_sent(bytes);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.session.touch();
        self.metrics.record_received(bytes);
    }

    pub fn release(&mut self) {
        self.metrics.total_disconnections += 1;
        self.session.is_active = false;
        self.state = ConnectionState::Disconnected;
        self.released_at = Some(Instant::now());
    }

    /// time since the connection was released, `None` while one is bound
    pub fn idle_for(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Disconnected => self.released_at.map(|at| at.elapsed()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reopen_counts_reconnection_and_keeps_sequence() {
        let mut record = SessionRecord::new("s1".to_string(), json!({}));
        record.open(json!({}), false);
        record.record_sent(8);
        record.record_sent(8);
        record.release();

        record.open(json!({"ua": "second tab"}), true);

        assert_eq!(record.state, ConnectionState::Connected);
        assert_eq!(record.metrics.reconnection_attempts, 1);
        assert_eq!(record.metrics.total_disconnections, 1);
        assert_eq!(record.session.next_sequence_number(), 3);
        assert_eq!(record.session.client_info, json!({"ua": "second tab"}));
        assert!(record.idle_for().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_counts_from_release() {
        let mut record = SessionRecord::new("s1".to_string(), json!(null));
        record.open(json!(null), false);
        assert!(record.idle_for().is_none());

        record.release();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(record.idle_for(), Some(Duration::from_secs(5)));
    }
}
