use std::{sync::Weak, time::Duration};

use futures_util::{future, FutureExt};
use tokio::{sync::oneshot, time::Instant};

use super::{ConnectionManager, Shared};
use crate::{session::DisconnectReason, transport::TransportError};

/// Result of one heartbeat check
#[derive(Debug)]
pub(super) enum Beat {
    /// probe sent
    Healthy,
    /// no activity inside the liveness window
    Stale(Duration),
    /// probe could not be written
    ProbeFailed(TransportError),
    /// connection already released
    Gone,
}

/// Per-connection task running heartbeat and session expiry side by side.
///
/// Dropping or firing the cancel sender stops both.
pub(super) async fn supervise(
    shared: Weak<Shared>,
    session_id: String,
    heartbeat: Option<Duration>,
    max_duration: Duration,
    mut cancel: oneshot::Receiver<()>,
) {
    log::debug!("Supervisor of session {} start", session_id);

    let expiry = tokio::time::sleep(max_duration);
    tokio::pin!(expiry);

    let mut next_beat = heartbeat.map(|interval| Instant::now() + interval);

    let reason = loop {
        let beat_clock = match next_beat {
            Some(tick) => tokio::time::sleep_until(tick).boxed(),
            None => future::pending().boxed(),
        };

        tokio::select! {
            biased;

            _ = &mut cancel => {
                log::debug!("Supervisor of session {} cancelled", session_id);
                return;
            }

            _ = &mut expiry => {
                log::info!("Session {} reached max duration {:?}", session_id, max_duration);
                break DisconnectReason::Timeout;
            }

            _ = beat_clock => {
                let manager = match shared.upgrade() {
                    Some(inner) => ConnectionManager { inner },
                    None => return,
                };

                match manager.heartbeat_check(&session_id).await {
                    Beat::Healthy => {
                        log::trace!("Session {} heartbeat ok", session_id);
                        next_beat = heartbeat.map(|interval| Instant::now() + interval);
                    }
                    Beat::Stale(idle) => {
                        log::warn!("Session {} stale, no activity for {:?}", session_id, idle);
                        break DisconnectReason::Timeout;
                    }
                    Beat::ProbeFailed(err) => {
                        log::warn!("Session {} liveness probe failed: {}", session_id, err);
                        break DisconnectReason::NetworkError;
                    }
                    Beat::Gone => return,
                }
            }
        }
    };

    if let Some(inner) = shared.upgrade() {
        ConnectionManager { inner }
            .disconnect(&session_id, reason)
            .await;
    }
}
