use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Boxed error of a status backend
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle state of an analysis job as reported by the status backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// queued
    Pending,
    /// running
    Running,
    /// finished with results
    Completed,
    /// aborted
    Failed,
    /// anything this crate does not know
    #[serde(other)]
    Unknown,
}

impl AnalysisStatus {
    /// whether the job will not change any more
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status document of one analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// job state
    pub status: AnalysisStatus,
    /// 0 - 100
    #[serde(default)]
    pub progress: Option<f64>,
    /// opaque result payload, usually only set when completed
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Status backend failed to answer
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum StatusError {
    /// backend query failed
    #[snafu(display("query status of analysis {analysis_id} failed: {source}"))]
    Query {
        /// analysis id
        analysis_id: String,
        /// backend error
        source: BoxError,
    },
}

/// Collaborator answering analysis status queries while the persistent channel is down
#[async_trait::async_trait]
pub trait StatusProvider: std::fmt::Debug + Send + Sync {
    /// full status of an analysis
    async fn get_status(&self, analysis_id: &str) -> Result<StatusReport, StatusError>;

    /// whether an analysis is done, backends with a cheaper check should override this
    async fn is_complete(&self, analysis_id: &str) -> Result<bool, StatusError> {
        let report = self.get_status(analysis_id).await?;
        Ok(report.status == AnalysisStatus::Completed)
    }
}
