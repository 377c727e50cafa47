use std::{fmt::Debug, time::Duration};

use serde::Serialize;
use snafu::prelude::*;
use tokio::{net::TcpStream, time::Instant};

/// Estimated health of the persistent channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// probe succeeded quickly
    Available,
    /// probe succeeded but slowly
    Degraded,
    /// probe failed
    Unavailable,
    /// never probed, or nothing to probe
    Unknown,
}

impl Availability {
    /// classify a probe latency against the slow connection threshold
    pub fn from_latency(latency: Duration, slow_threshold: Duration) -> Self {
        if latency > slow_threshold {
            Self::Degraded
        } else {
            Self::Available
        }
    }
}

/// Error of one availability probe
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ProbeError {
    /// target is not a valid url
    #[snafu(display("probe target {target} is not a valid url: {source}"))]
    InvalidTarget {
        /// probe target
        target: String,
        /// source error
        source: url::ParseError,
    },

    /// target url has no host or no known port
    #[snafu(display("probe target {target} has no host or port"))]
    NoAddress {
        /// probe target
        target: String,
    },

    /// no answer in time
    #[snafu(display("probe {target} timed out after {timeout:?}"))]
    Timeout {
        /// probe target
        target: String,
        /// time waited
        timeout: Duration,
    },

    /// connection refused or similar
    #[snafu(display("probe {target} failed: {source}"))]
    Connect {
        /// probe target
        target: String,
        /// source error
        source: std::io::Error,
    },
}

/// Reachability/latency probe of the persistent channel endpoint
#[async_trait::async_trait]
pub trait AvailabilityProbe: Debug + Send + Sync {
    /// Returns the probe latency
    async fn probe(&self, target: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Probe by opening (and dropping) a TCP connection to the target url's host.
///
/// `ws`, `wss`, `http` and `https` targets may omit the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait::async_trait]
impl AvailabilityProbe for TcpProbe {
    async fn probe(&self, target: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let url = url::Url::parse(target).context(error::InvalidTarget { target })?;

        let (host, port) = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => (host.to_string(), port),
            _ => return error::NoAddress { target }.fail(),
        };

        log::trace!("Probing {}:{}", host, port);

        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(source)) => Err(source).context(error::Connect { target }),
            Err(_) => error::Timeout { target, timeout }.fail(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_latency_classification() {
        let threshold = Duration::from_secs(5);

        assert_eq!(
            Availability::from_latency(Duration::from_millis(20), threshold),
            Availability::Available
        );
        assert_eq!(
            Availability::from_latency(Duration::from_secs(6), threshold),
            Availability::Degraded
        );
    }

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("ws://{}/ws", listener.local_addr().unwrap());

        let latency = TcpProbe.probe(&target, Duration::from_secs(2)).await.unwrap();

        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_bad_target() {
        let err = TcpProbe
            .probe("not a url", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidTarget { .. }));

        let err = TcpProbe
            .probe("unix:/tmp/socket", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoAddress { .. }));
    }
}
