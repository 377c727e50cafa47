//! # Upbeat
//!
//! Real-time analysis progress streaming with graceful fallback delivery.
//!
//! [`ConnectionManager`] owns live persistent connections and streams typed
//! [`Event`]s over them. When a connection can not be established or sustained,
//! [`FallbackManager`] takes over with polling, batching or a simulated narrative.

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod event;
pub mod fallback;
pub mod manager;
pub mod session;
pub mod transport;

mod error;
pub use error::{Error, Result};

pub use config::{Config, FallbackConfig, FallbackMode, StreamingConfig};
pub use event::{Envelope, Event};
pub use fallback::FallbackManager;
pub use manager::ConnectionManager;
pub use session::{ConnectionState, DisconnectReason};

/// Load a config file, then build both managers from it
pub async fn from_config_file<P: AsRef<std::path::Path>>(
    path: P,
    status: std::sync::Arc<dyn fallback::StatusProvider>,
) -> Result<(ConnectionManager, FallbackManager)> {
    let config = Config::from_json_file(path).await?;

    Ok((
        ConnectionManager::new(config.streaming),
        FallbackManager::new(config.fallback, status),
    ))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::fallback::{AnalysisStatus, StatusError, StatusProvider, StatusReport};

    #[derive(Debug)]
    struct Done;

    #[async_trait::async_trait]
    impl StatusProvider for Done {
        async fn get_status(
            &self,
            _analysis_id: &str,
        ) -> std::result::Result<StatusReport, StatusError> {
            Ok(StatusReport {
                status: AnalysisStatus::Completed,
                progress: Some(100.0),
                result: None,
            })
        }
    }

    #[tokio::test]
    async fn test_from_config_file() {
        let path =
            std::env::temp_dir().join(format!("upbeat-config-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"{"streaming":{"max_events_per_second":4},"fallback":{"batch_size":3}}"#,
        )
        .await
        .unwrap();

        let (manager, fallback) = from_config_file(&path, Arc::new(Done)).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(manager.config().max_events_per_second, 4);
        assert_eq!(fallback.config().batch_size, 3);
    }

    #[tokio::test]
    async fn test_from_missing_config_file() {
        let err = from_config_file("/nonexistent/upbeat.json", Arc::new(Done))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
    }
}
