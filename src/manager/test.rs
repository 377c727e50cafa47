use std::{sync::Mutex as StdMutex, time::Duration};

use serde_json::json;

use super::*;
use crate::transport::{MemoryPeer, MemoryTransport, WriteFailure};

#[derive(Debug, Default)]
struct Recorder {
    events: StdMutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait::async_trait]
impl ConnectionHooks for Recorder {
    async fn on_connect(&self, session_id: &str, _client_info: &ClientInfo) {
        self.push(format!("connect:{}", session_id));
    }

    async fn on_disconnect(&self, session_id: &str, reason: DisconnectReason) {
        self.push(format!("disconnect:{}:{}", session_id, reason));
    }

    async fn on_error(&self, session_id: &str, _error: &TransportError) {
        self.push(format!("error:{}", session_id));
    }
}

async fn manager_with(config: StreamingConfig) -> (ConnectionManager, Arc<Recorder>) {
    let manager = ConnectionManager::new(config);
    let recorder = Arc::new(Recorder::default());
    manager.add_hooks(recorder.clone()).await;
    (manager, recorder)
}

async fn connected(manager: &ConnectionManager, session_id: &str) -> MemoryPeer {
    let (transport, peer) = MemoryTransport::pair();
    manager
        .connect(transport, session_id, json!({"agent": "test"}))
        .await
        .unwrap();
    peer
}

#[tokio::test(start_paused = true)]
async fn test_sequence_numbers_follow_sends() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let mut peer = connected(&manager, "s1").await;

    for i in 0..5 {
        assert!(manager.send("s1", Event::progress("step", Some(i as f64 * 20.0))).await);
    }

    let envelopes = peer.drain_envelopes();
    let sequence: Vec<u64> = envelopes.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequence, [1, 2, 3, 4, 5]);
    assert!(envelopes.iter().all(|e| e.session_id == "s1"));

    let session = manager.session("s1").await.unwrap();
    let metrics = manager.metrics("s1").await.unwrap();
    assert_eq!(session.events_sent, 5);
    assert_eq!(metrics.messages_sent, 5);
    assert!(metrics.bytes_sent > 0);

    assert_eq!(recorder.events(), ["connect:s1"]);
    assert_eq!(
        manager.connection_state("s1").await,
        Some(ConnectionState::Connected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_rejected() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let _peer = connected(&manager, "s1").await;

    let (transport, _second) = MemoryTransport::pair();
    let err = manager
        .connect(transport, "s1", json!(null))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::AlreadyConnected { .. }));
    assert_eq!(manager.active_connections().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_registers_nothing() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let (transport, peer) = MemoryTransport::pair();
    peer.refuse_handshake();

    let err = manager
        .connect(transport, "s1", json!(null))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::Handshake { .. }));
    assert!(!manager.is_connected("s1").await);
    assert!(manager.session("s1").await.is_none());
    assert!(manager.connection_state("s1").await.is_none());
    assert_eq!(recorder.events(), ["error:s1"]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let mut peer = connected(&manager, "s1").await;

    manager.disconnect("s1", DisconnectReason::ServerError).await;
    manager.disconnect("s1", DisconnectReason::ServerError).await;

    let metrics = manager.metrics("s1").await.unwrap();
    assert_eq!(metrics.total_disconnections, 1);
    assert_eq!(
        manager.connection_state("s1").await,
        Some(ConnectionState::Disconnected)
    );
    assert!(!manager.session("s1").await.unwrap().is_active);
    assert!(peer.is_closed());

    // final notification, then nothing
    let frames = peer.drain_envelopes();
    assert_eq!(frames.len(), 1);
    let closing = frames[0].event.as_progress_update().unwrap();
    assert_eq!(closing.stage.as_deref(), Some("connection_closing"));

    assert_eq!(
        recorder.events(),
        ["connect:s1", "disconnect:s1:server_error"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_client_initiated_disconnect_skips_notification() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let mut peer = connected(&manager, "s1").await;

    manager
        .disconnect("s1", DisconnectReason::ClientInitiated)
        .await;

    assert!(peer.drain().is_empty());
    assert!(peer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_send_after_disconnect_has_no_side_effects() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let _peer = connected(&manager, "s1").await;
    assert!(manager.send("s1", Event::progress("one", None)).await);

    manager
        .disconnect("s1", DisconnectReason::ClientInitiated)
        .await;
    let before = manager.metrics("s1").await.unwrap();

    assert!(!manager.send("s1", Event::progress("two", None)).await);
    assert!(!manager.send("unknown", Event::progress("two", None)).await);

    assert_eq!(manager.metrics("s1").await.unwrap(), before);
    assert_eq!(manager.session("s1").await.unwrap().events_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_drops_excess_sends() {
    let config = StreamingConfig {
        max_events_per_second: 2,
        rate_limit_timeout_secs: 0.5,
        ..Default::default()
    };
    let (manager, _) = manager_with(config).await;
    let mut peer = connected(&manager, "s1").await;

    assert!(manager.send("s1", Event::progress("a", None)).await);
    assert!(manager.send("s1", Event::progress("b", None)).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.send("s1", Event::progress("c", None)).await);

    let start = tokio::time::Instant::now();
    let results = futures_util::future::join_all(
        (0..3).map(|_| manager.send("s1", Event::progress("burst", None))),
    )
    .await;

    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert!(start.elapsed() < Duration::from_millis(600));
    assert_eq!(peer.drain().len(), 4);
    assert!(manager.is_connected("s1").await);
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_times_out() {
    let config = StreamingConfig {
        heartbeat_interval_secs: 1.0,
        ..Default::default()
    };
    let (manager, recorder) = manager_with(config).await;
    let peer = connected(&manager, "s1").await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(manager.is_connected("s1").await);
    assert_eq!(peer.pings(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!manager.is_connected("s1").await);
    assert_eq!(
        recorder.events().last().map(String::as_str),
        Some("disconnect:s1:timeout")
    );
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_keeps_connection_alive() {
    let config = StreamingConfig {
        heartbeat_interval_secs: 1.0,
        ..Default::default()
    };
    let (manager, _) = manager_with(config).await;
    let _peer = connected(&manager, "s1").await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.record_received("s1", 16).await);
    }

    assert!(manager.is_connected("s1").await);
    let metrics = manager.metrics("s1").await.unwrap();
    assert_eq!(metrics.messages_received, 10);
    assert_eq!(metrics.bytes_received, 160);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_is_network_error() {
    let config = StreamingConfig {
        heartbeat_interval_secs: 1.0,
        ..Default::default()
    };
    let (manager, recorder) = manager_with(config).await;
    let peer = connected(&manager, "s1").await;
    peer.fail_pings(true);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!manager.is_connected("s1").await);
    assert_eq!(
        recorder.events().last().map(String::as_str),
        Some("disconnect:s1:network_error")
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_expires_after_max_duration() {
    let config = StreamingConfig {
        heartbeat_interval_secs: 0.0,
        max_session_duration_secs: 10.0,
        ..Default::default()
    };
    let (manager, recorder) = manager_with(config).await;
    let peer = connected(&manager, "s1").await;

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(manager.is_connected("s1").await);
    assert_eq!(peer.pings(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!manager.is_connected("s1").await);
    assert_eq!(
        recorder.events().last().map(String::as_str),
        Some("disconnect:s1:timeout")
    );
}

#[tokio::test(start_paused = true)]
async fn test_huge_unvalidated_durations_are_clamped() {
    let config = StreamingConfig {
        heartbeat_interval_secs: 1e20,
        max_session_duration_secs: 1e20,
        rate_limit_timeout_secs: 1e20,
        ..Default::default()
    };
    let (manager, _) = manager_with(config).await;
    let _peer = connected(&manager, "s1").await;

    assert!(manager.send("s1", Event::progress("step", None)).await);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(manager.is_connected("s1").await);
}

#[tokio::test(start_paused = true)]
async fn test_readouts_do_not_wait_for_slow_writes() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let mut peer = connected(&manager, "s1").await;
    peer.delay_writes(Duration::from_secs(5));

    let sending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.send("s1", Event::progress("slow", None)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let start = tokio::time::Instant::now();
    assert_eq!(manager.metrics("s1").await.unwrap().messages_sent, 0);
    assert_eq!(
        manager.connection_state("s1").await,
        Some(ConnectionState::Connected)
    );
    assert!(manager.record_received("s1", 4).await);
    assert!(start.elapsed() < Duration::from_secs(1));

    assert!(sending.await.unwrap());
    assert_eq!(manager.metrics("s1").await.unwrap().messages_sent, 1);
    assert_eq!(manager.metrics("s1").await.unwrap().messages_received, 1);
    let sequence: Vec<u64> = peer
        .drain_envelopes()
        .iter()
        .map(|e| e.sequence_number)
        .collect();
    assert_eq!(sequence, [1]);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_skips_excluded() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let mut a = connected(&manager, "a").await;
    let mut b = connected(&manager, "b").await;
    let mut c = connected(&manager, "c").await;

    let delivered = manager
        .broadcast(&Event::progress("maintenance soon", None), &["b"])
        .await;

    assert_eq!(delivered, 2);
    assert_eq!(a.drain().len(), 1);
    assert!(b.drain().is_empty());
    assert_eq!(c.drain().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_gone_during_send() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let peer = connected(&manager, "s1").await;
    peer.fail_writes(WriteFailure::Disconnect);

    assert!(!manager.send("s1", Event::progress("lost", None)).await);

    assert!(!manager.is_connected("s1").await);
    assert_eq!(
        recorder.events(),
        ["connect:s1", "disconnect:s1:client_initiated"]
    );
    assert_eq!(manager.session("s1").await.unwrap().events_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_fault_tears_down() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let peer = connected(&manager, "s1").await;
    peer.fail_writes(WriteFailure::Fault);

    assert!(!manager.send("s1", Event::progress("broken", None)).await);

    assert!(!manager.is_connected("s1").await);
    assert!(peer.is_closed());
    assert_eq!(
        manager.connection_state("s1").await,
        Some(ConnectionState::Disconnected)
    );
    assert_eq!(
        recorder.events(),
        ["connect:s1", "error:s1", "disconnect:s1:server_error"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_continues_sequence() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let mut first = connected(&manager, "s1").await;
    manager.send("s1", Event::progress("one", None)).await;
    manager.send("s1", Event::progress("two", None)).await;

    manager
        .disconnect("s1", DisconnectReason::GracefulShutdown)
        .await;
    let closing: Vec<u64> = first
        .drain_envelopes()
        .iter()
        .map(|e| e.sequence_number)
        .collect();
    assert_eq!(closing, [1, 2, 3]);

    let mut second = connected(&manager, "s1").await;
    assert!(manager.send("s1", Event::progress("three", None)).await);

    assert_eq!(second.drain_envelopes()[0].sequence_number, 4);
    let metrics = manager.metrics("s1").await.unwrap();
    assert_eq!(metrics.reconnection_attempts, 1);
    assert_eq!(metrics.total_disconnections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reap_only_disconnected_records() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let _gone = connected(&manager, "gone").await;
    let _live = connected(&manager, "live").await;

    manager
        .disconnect("gone", DisconnectReason::ClientInitiated)
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(manager.reap_records(Duration::from_secs(60)).await, 0);
    assert_eq!(manager.reap_records(Duration::from_secs(5)).await, 1);

    assert!(manager.session("gone").await.is_none());
    assert!(manager.session("live").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_housekeeping_reaps_periodically() {
    let config = StreamingConfig {
        record_retention_secs: 5.0,
        reap_interval_secs: 10.0,
        ..Default::default()
    };
    let (manager, _) = manager_with(config).await;
    let _peer = connected(&manager, "s1").await;
    manager.start_housekeeping().await;

    manager
        .disconnect("s1", DisconnectReason::ClientInitiated)
        .await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(manager.session("s1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_metrics() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let _a = connected(&manager, "a").await;
    let _b = connected(&manager, "b").await;

    manager.send("a", Event::progress("x", None)).await;
    manager.send("b", Event::progress("y", None)).await;
    manager.record_received("b", 4).await;
    manager.disconnect("a", DisconnectReason::ClientInitiated).await;

    let aggregate = manager.aggregate_metrics().await;
    assert_eq!(aggregate.active_connections, 1);
    assert_eq!(aggregate.sessions, 2);
    assert_eq!(aggregate.messages_sent, 2);
    assert_eq!(aggregate.messages_received, 1);
    assert_eq!(aggregate.bytes_received, 4);
    assert_eq!(aggregate.total_disconnections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_bind_analysis() {
    let (manager, _) = manager_with(StreamingConfig::default()).await;
    let _peer = connected(&manager, "s1").await;

    assert!(manager.bind_analysis("s1", json!({"analysis_id": "a-1"})).await);
    assert!(!manager.bind_analysis("nobody", json!({})).await);

    let session = manager.session("s1").await.unwrap();
    assert_eq!(session.analysis_config, Some(json!({"analysis_id": "a-1"})));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_everything() {
    let (manager, recorder) = manager_with(StreamingConfig::default()).await;
    let a = connected(&manager, "a").await;
    let b = connected(&manager, "b").await;

    let report = manager.shutdown().await;

    assert_eq!(report.disconnected, 2);
    assert!(report.errors.is_empty());
    assert_eq!(manager.active_connections().await, 0);
    assert!(a.is_closed() && b.is_closed());

    let disconnects = recorder
        .events()
        .iter()
        .filter(|e| e.ends_with(":graceful_shutdown"))
        .count();
    assert_eq!(disconnects, 2);
}
