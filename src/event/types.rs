use serde::{Deserialize, Serialize};

use crate::session::now_millis;

/// Severity/kind of an event, drives rendering on the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// something finished well
    Success,
    /// neutral information
    Info,
    /// something degraded but analysis continues
    Warning,
    /// something failed
    Error,
    /// work is ongoing
    Progress,
}

/// Fields shared by every event variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBase {
    /// ms since unix epoch
    pub timestamp: i64,
    /// status level
    pub status: StatusLevel,
    /// human readable message
    pub message: String,
    /// 0 - 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl EventBase {
    /// Create a base stamped with current time, progress is clamped into 0 - 100
    pub fn new<S: Into<String>>(status: StatusLevel, message: S, progress: Option<f64>) -> Self {
        Self {
            timestamp: now_millis(),
            status,
            message: message.into(),
            progress: progress.map(|p| p.clamp(0.0, 100.0)),
        }
    }
}

/// analysis pipeline started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStarted {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// analysis id
    pub analysis_id: String,
    /// analysed subject, e.g. company name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// analysis pipeline finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCompleted {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// analysis id
    pub analysis_id: String,
    /// number of result items produced
    pub result_count: usize,
    /// wall time of the run in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// analysis pipeline aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFailed {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// analysis id
    pub analysis_id: String,
    /// failure description
    pub error: String,
}

/// a pipeline node/step started or finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// node name
    pub node: String,
    /// 1-based step index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// total steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// web search progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProgress {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// issued query
    pub query: String,
    /// results found so far
    pub results_found: u32,
}

/// a new source document found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDiscovered {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// source url
    pub url: String,
    /// source title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// an insight extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightGenerated {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// insight category
    pub category: String,
    /// insight text
    pub content: String,
}

/// a business opportunity identified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityIdentified {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// short title
    pub title: String,
    /// description
    pub description: String,
    /// relevance score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// generic progress update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// pipeline stage name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// error report with recovery hints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// common fields
    #[serde(flatten)]
    pub base: EventBase,
    /// machine readable error type
    pub error_type: String,
    /// extra details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// what the user can do about it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_suggestion: Option<String>,
    /// whether the analysis can continue
    pub recoverable: bool,
}
