//! Registry of live persistent connections.
//!
//! The manager owns every live transport, assigns per-session sequence numbers,
//! rate limits sends and runs one supervisor task per connection for heartbeat
//! and expiry. Session records outlive their connection and are reaped separately.

mod hooks;
mod limiter;
mod record;
mod supervisor;

pub use hooks::ConnectionHooks;

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use futures_util::future;
use serde::Serialize;
use snafu::prelude::*;
use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    config::StreamingConfig,
    event::{Envelope, Event, StatusLevel},
    session::{ClientInfo, ConnectionMetrics, ConnectionState, DisconnectReason, StreamingSession},
    transport::{Transport, TransportError},
};
use limiter::RateLimiter;
use record::SessionRecord;
use supervisor::Beat;

/// Error when accept a new connection
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ConnectError {
    /// session already has a live (or connecting) connection
    #[snafu(display("session {session_id} is already connected"))]
    AlreadyConnected {
        /// session id
        session_id: String,
    },

    /// transport handshake failed, nothing was registered
    #[snafu(display("accept connection of session {session_id} failed: {source}"))]
    Handshake {
        /// session id
        session_id: String,
        /// source error
        source: TransportError,
    },
}

/// Outcome of [`ConnectionManager::shutdown`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// connections released
    pub disconnected: usize,
    /// close errors, by session id
    pub errors: Vec<(String, TransportError)>,
}

/// Totals over every retained session record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateMetrics {
    /// live connections
    pub active_connections: usize,
    /// retained session records
    pub sessions: usize,
    /// frames written
    pub messages_sent: u64,
    /// frames reported received
    pub messages_received: u64,
    /// bytes written
    pub bytes_sent: u64,
    /// bytes reported received
    pub bytes_received: u64,
    /// reconnections
    pub reconnection_attempts: u64,
    /// disconnections
    pub total_disconnections: u64,
}

#[derive(Debug)]
struct Connection {
    session_id: String,
    limiter: RateLimiter,
    transport: Mutex<Box<dyn Transport>>,
    record: Arc<Mutex<SessionRecord>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

struct Shared {
    config: StreamingConfig,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    records: RwLock<HashMap<String, Arc<Mutex<SessionRecord>>>>,
    hooks: RwLock<Vec<Arc<dyn ConnectionHooks>>>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

/// Connection manager, cheap to clone, clones share the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create an empty manager.
    ///
    /// `config` is taken as is, out of range durations are clamped. Use
    /// [`StreamingConfig::validate`] to reject them instead.
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                connections: RwLock::new(HashMap::new()),
                records: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
                housekeeping: Mutex::new(None),
            }),
        }
    }

    /// manager config
    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Register a lifecycle observer
    pub async fn add_hooks(&self, hooks: Arc<dyn ConnectionHooks>) {
        self.inner.hooks.write().await.push(hooks);
    }

    async fn hooks(&self) -> Vec<Arc<dyn ConnectionHooks>> {
        self.inner.hooks.read().await.clone()
    }

    async fn emit_error(&self, session_id: &str, err: &TransportError) {
        for hook in self.hooks().await {
            hook.on_error(session_id, err).await;
        }
    }

    async fn connection(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.inner.connections.read().await.get(session_id).cloned()
    }

    /// Mark the session record connecting, creating it if needed.
    ///
    /// Returns the record and whether it was created by this call.
    async fn claim(
        &self,
        session_id: &str,
        client_info: &ClientInfo,
    ) -> Result<(Arc<Mutex<SessionRecord>>, bool), ConnectError> {
        let mut records = self.inner.records.write().await;

        if let Some(record) = records.get(session_id).cloned() {
            let mut guard = record.lock().await;
            ensure!(
                guard.state == ConnectionState::Disconnected,
                error::AlreadyConnected { session_id }
            );
            guard.state = ConnectionState::Connecting;
            drop(guard);
            return Ok((record, false));
        }

        let record = Arc::new(Mutex::new(SessionRecord::new(
            session_id.to_string(),
            client_info.clone(),
        )));
        records.insert(session_id.to_string(), record.clone());

        Ok((record, true))
    }

    async fn release_claim(
        &self,
        session_id: &str,
        record: &Arc<Mutex<SessionRecord>>,
        fresh: bool,
    ) {
        if fresh {
            let mut records = self.inner.records.write().await;
            if matches!(records.get(session_id), Some(r) if Arc::ptr_eq(r, record)) {
                records.remove(session_id);
            }
        } else {
            record.lock().await.state = ConnectionState::Disconnected;
        }
    }

    /// Accept a transport and bind it to `session_id`.
    ///
    /// On success the session is connected, its rate limiter is allocated and a
    /// supervisor task runs heartbeat and expiry. Connecting a session whose
    /// previous connection was released reuses its record, sequence numbers continue.
    ///
    /// Failure is not fatal, the caller decides whether to fall back.
    pub async fn connect<T, S>(
        &self,
        mut transport: T,
        session_id: S,
        client_info: ClientInfo,
    ) -> Result<(), ConnectError>
    where
        T: Transport + 'static,
        S: Into<String>,
    {
        let session_id = session_id.into();

        if self.is_connected(&session_id).await {
            return error::AlreadyConnected { session_id }.fail();
        }

        let (record, fresh) = self.claim(&session_id, &client_info).await?;

        log::debug!("Accepting connection of session {}", session_id);

        if let Err(source) = transport.accept().await {
            log::warn!("Accept connection of session {} failed: {}", session_id, source);
            self.release_claim(&session_id, &record, fresh).await;
            self.emit_error(&session_id, &source).await;
            return Err(source).context(error::Handshake { session_id });
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();

        let connection = Arc::new(Connection {
            session_id: session_id.clone(),
            limiter: RateLimiter::new(self.inner.config.max_events_per_second),
            transport: Mutex::new(Box::new(transport)),
            record: record.clone(),
            cancel: Mutex::new(Some(cancel_tx)),
        });

        record.lock().await.open(client_info.clone(), !fresh);

        self.inner
            .connections
            .write()
            .await
            .insert(session_id.clone(), connection);

        tokio::spawn(supervisor::supervise(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            self.inner.config.heartbeat_interval(),
            self.inner.config.max_session_duration(),
            cancel_rx,
        ));

        log::info!(
            "Session {} connected{}",
            session_id,
            if fresh { "" } else { " again" }
        );

        for hook in self.hooks().await {
            hook.on_connect(&session_id, &client_info).await;
        }

        Ok(())
    }

    /// Release the connection of `session_id`, no-op if it is not connected.
    ///
    /// The session record and metrics are kept.
    pub async fn disconnect(&self, session_id: &str, reason: DisconnectReason) {
        let connection = match self.inner.connections.write().await.remove(session_id) {
            Some(connection) => connection,
            None => {
                log::trace!("Session {} not connected, skip disconnect", session_id);
                return;
            }
        };

        if let Some(err) = self.teardown(connection, reason).await {
            log::debug!("Close transport of session {} failed: {}", session_id, err);
        }
    }

    async fn fail(&self, session_id: &str, err: TransportError) {
        let connection = match self.inner.connections.write().await.remove(session_id) {
            Some(connection) => connection,
            None => return,
        };

        log::warn!("Transport of session {} faulted: {}", session_id, err);

        connection.record.lock().await.state = ConnectionState::Error;
        self.emit_error(session_id, &err).await;

        if let Some(err) = self.teardown(connection, DisconnectReason::ServerError).await {
            log::debug!("Close transport of session {} failed: {}", session_id, err);
        }
    }

    /// Release a connection already removed from the registry, returns the close error
    async fn teardown(
        &self,
        connection: Arc<Connection>,
        reason: DisconnectReason,
    ) -> Option<TransportError> {
        let session_id = connection.session_id.as_str();

        log::debug!("Disconnecting session {}, reason {}", session_id, reason);

        connection.limiter.close();
        if let Some(cancel) = connection.cancel.lock().await.take() {
            let _ = cancel.send(());
        }

        let close_error = {
            let mut transport = connection.transport.lock().await;

            let notice = {
                let mut record = connection.record.lock().await;

                let faulted = record.state == ConnectionState::Error;
                if !faulted {
                    record.state = ConnectionState::Disconnecting;
                }

                // client already knows when it closed the connection itself
                (!faulted && reason != DisconnectReason::ClientInitiated).then(|| Envelope {
                    event: Event::stage(
                        "connection_closing",
                        StatusLevel::Info,
                        format!("Connection closing: {}", reason),
                        None,
                    ),
                    session_id: session_id.to_string(),
                    sequence_number: record.session.next_sequence_number(),
                })
            };

            if let Some(envelope) = notice {
                match envelope.encode() {
                    Ok(frame) => {
                        let size = frame.len();
                        match transport.send_text(frame).await {
                            Ok(()) => connection.record.lock().await.record_sent(size),
                            Err(err) => log::debug!(
                                "Final notification to session {} not delivered: {}",
                                session_id,
                                err
                            ),
                        }
                    }
                    Err(err) => log::warn!("Encode final notification failed: {}", err),
                }
            }

            let close_error = transport.close().await.err();
            connection.record.lock().await.release();
            close_error
        };

        log::info!("Session {} disconnected, reason {}", session_id, reason);

        for hook in self.hooks().await {
            hook.on_disconnect(session_id, reason).await;
        }

        close_error
    }

    /// Send one event to a connected session.
    ///
    /// Returns false without side effects if the session is not connected, and
    /// drops the event if no rate limiter token is available in time. Transport
    /// failures release the connection.
    pub async fn send(&self, session_id: &str, event: Event) -> bool {
        let connection = match self.connection(session_id).await {
            Some(connection) => connection,
            None => {
                log::trace!("Session {} not connected, drop {}", session_id, event.event_type());
                return false;
            }
        };

        if !connection
            .limiter
            .acquire(self.inner.config.rate_limit_timeout())
            .await
        {
            log::warn!(
                "Rate limit of session {} exhausted, drop {}",
                session_id,
                event.event_type()
            );
            return false;
        }

        let err = {
            // the transport lock orders writers, the record lock is only held around bookkeeping
            let mut transport = connection.transport.lock().await;

            let sequence_number = {
                let record = connection.record.lock().await;
                if record.state != ConnectionState::Connected {
                    return false;
                }
                record.session.next_sequence_number()
            };

            let envelope = Envelope {
                event,
                session_id: session_id.to_string(),
                sequence_number,
            };

            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("Encode event for session {} failed: {}", session_id, err);
                    return false;
                }
            };
            let size = frame.len();

            match transport.send_text(frame).await {
                Ok(()) => {
                    connection.record.lock().await.record_sent(size);
                    log::trace!(
                        "Sent {} #{} to session {}",
                        envelope.event.event_type(),
                        envelope.sequence_number,
                        session_id
                    );
                    return true;
                }
                Err(err) => err,
            }
        };

        if err.is_disconnect() {
            log::debug!("Session {} went away during send", session_id);
            self.disconnect(session_id, DisconnectReason::ClientInitiated)
                .await;
        } else {
            self.fail(session_id, err).await;
        }

        false
    }

    /// Send to every connected session except `exclude` concurrently, returns the success count
    pub async fn broadcast(&self, event: &Event, exclude: &[&str]) -> usize {
        let targets: Vec<String> = self
            .connected_sessions()
            .await
            .into_iter()
            .filter(|id| !exclude.contains(&id.as_str()))
            .collect();

        let results =
            future::join_all(targets.iter().map(|id| self.send(id, event.clone()))).await;
        let delivered = results.into_iter().filter(|ok| *ok).count();

        log::debug!(
            "Broadcast {} delivered to {}/{} sessions",
            event.event_type(),
            delivered,
            targets.len()
        );

        delivered
    }

    /// Report inbound traffic of a connected session, refreshes its activity
    pub async fn record_received(&self, session_id: &str, bytes: usize) -> bool {
        let connection = match self.connection(session_id).await {
            Some(connection) => connection,
            None => return false,
        };

        let mut record = connection.record.lock().await;
        if record.state != ConnectionState::Connected {
            return false;
        }
        record.record_received(bytes);
        true
    }

    /// Attach analysis binding config to a known session
    pub async fn bind_analysis(&self, session_id: &str, config: serde_json::Value) -> bool {
        let record = self.inner.records.read().await.get(session_id).cloned();
        match record {
            Some(record) => {
                record.lock().await.session.analysis_config = Some(config);
                true
            }
            None => false,
        }
    }

    async fn heartbeat_check(&self, session_id: &str) -> Beat {
        let connection = match self.connection(session_id).await {
            Some(connection) => connection,
            None => return Beat::Gone,
        };

        let window = match self.inner.config.liveness_window() {
            Some(window) => window,
            None => return Beat::Healthy,
        };

        let mut transport = connection.transport.lock().await;

        {
            let record = connection.record.lock().await;
            if record.state != ConnectionState::Connected {
                return Beat::Gone;
            }

            let idle = record.session.last_activity_at.elapsed();
            if idle > window {
                return Beat::Stale(idle);
            }
        }

        match transport.ping().await {
            Ok(()) => Beat::Healthy,
            Err(err) => Beat::ProbeFailed(err),
        }
    }

    /// Whether the session has a live connection
    pub async fn is_connected(&self, session_id: &str) -> bool {
        self.inner.connections.read().await.contains_key(session_id)
    }

    /// Current state of a known session
    pub async fn connection_state(&self, session_id: &str) -> Option<ConnectionState> {
        let record = self.inner.records.read().await.get(session_id).cloned()?;
        let state = record.lock().await.state;
        Some(state)
    }

    /// Snapshot of a known session
    pub async fn session(&self, session_id: &str) -> Option<StreamingSession> {
        let record = self.inner.records.read().await.get(session_id).cloned()?;
        let session = record.lock().await.session.clone();
        Some(session)
    }

    /// Snapshot of a known session's metrics
    pub async fn metrics(&self, session_id: &str) -> Option<ConnectionMetrics> {
        let record = self.inner.records.read().await.get(session_id).cloned()?;
        let metrics = record.lock().await.metrics.clone();
        Some(metrics)
    }

    /// Number of live connections
    pub async fn active_connections(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Ids of sessions with a live connection
    pub async fn connected_sessions(&self) -> Vec<String> {
        self.inner.connections.read().await.keys().cloned().collect()
    }

    /// Totals over all retained records
    pub async fn aggregate_metrics(&self) -> AggregateMetrics {
        let records: Vec<_> = self.inner.records.read().await.values().cloned().collect();

        let mut aggregate = AggregateMetrics {
            active_connections: self.active_connections().await,
            sessions: records.len(),
            ..Default::default()
        };

        for record in records {
            let record = record.lock().await;
            let m = &record.metrics;
            aggregate.messages_sent += m.messages_sent;
            aggregate.messages_received += m.messages_received;
            aggregate.bytes_sent += m.bytes_sent;
            aggregate.bytes_received += m.bytes_received;
            aggregate.reconnection_attempts += m.reconnection_attempts;
            aggregate.total_disconnections += m.total_disconnections;
        }

        aggregate
    }

    /// Delete records of sessions disconnected for longer than `max_idle`, returns how many
    pub async fn reap_records(&self, max_idle: Duration) -> usize {
        let mut records = self.inner.records.write().await;

        let mut expired = Vec::new();
        for (session_id, record) in records.iter() {
            if matches!(record.lock().await.idle_for(), Some(idle) if idle > max_idle) {
                expired.push(session_id.clone());
            }
        }

        for session_id in &expired {
            records.remove(session_id);
        }

        if !expired.is_empty() {
            log::debug!("Reaped {} idle session records", expired.len());
        }

        expired.len()
    }

    /// Spawn the periodic record reaper, replacing a running one
    pub async fn start_housekeeping(&self) {
        let shared = Arc::downgrade(&self.inner);
        let period = self.inner.config.reap_interval();
        let retention = self.inner.config.record_retention();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let manager = match shared.upgrade() {
                    Some(inner) => ConnectionManager { inner },
                    None => break,
                };
                manager.reap_records(retention).await;
            }
        });

        if let Some(previous) = self.inner.housekeeping.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Release every live connection concurrently and stop housekeeping.
    ///
    /// Close failures are collected, they never abort the drain.
    pub async fn shutdown(&self) -> ShutdownReport {
        if let Some(handle) = self.inner.housekeeping.lock().await.take() {
            handle.abort();
        }

        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        log::info!("Shutting down {} connections", connections.len());

        let results = future::join_all(connections.into_iter().map(|connection| async move {
            let session_id = connection.session_id.clone();
            let err = self
                .teardown(connection, DisconnectReason::GracefulShutdown)
                .await;
            (session_id, err)
        }))
        .await;

        let disconnected = results.len();
        let errors = results
            .into_iter()
            .filter_map(|(session_id, err)| err.map(|err| (session_id, err)))
            .collect();

        ShutdownReport {
            disconnected,
            errors,
        }
    }
}

#[cfg(test)]
mod test;
