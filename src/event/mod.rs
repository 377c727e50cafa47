//! Typed progress events and the envelope they travel in.

mod types;

pub use types::*;

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

/// Progress event, exactly one variant per instance, tagged by `event_type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// analysis lifecycle: started
    AnalysisStarted(AnalysisStarted),
    /// analysis lifecycle: completed
    AnalysisCompleted(AnalysisCompleted),
    /// analysis lifecycle: failed
    AnalysisError(AnalysisFailed),
    /// pipeline node/step execution
    NodeExecution(NodeExecution),
    /// search progress
    SearchProgress(SearchProgress),
    /// source discovery
    SourceDiscovered(SourceDiscovered),
    /// insight
    Insight(InsightGenerated),
    /// opportunity
    Opportunity(OpportunityIdentified),
    /// generic progress
    ProgressUpdate(ProgressUpdate),
    /// error with recovery hints
    Error(ErrorReport),
}

impl Event {
    /// Generic progress update
    pub fn progress<S: Into<String>>(message: S, progress: Option<f64>) -> Self {
        Self::ProgressUpdate(ProgressUpdate {
            base: EventBase::new(StatusLevel::Progress, message, progress),
            stage: None,
        })
    }

    /// Generic progress update for a named stage
    pub fn stage<S: Into<String>, M: Into<String>>(
        stage: S,
        status: StatusLevel,
        message: M,
        progress: Option<f64>,
    ) -> Self {
        Self::ProgressUpdate(ProgressUpdate {
            base: EventBase::new(status, message, progress),
            stage: Some(stage.into()),
        })
    }

    /// Error event
    pub fn error<T: Into<String>, M: Into<String>>(
        error_type: T,
        message: M,
        recoverable: bool,
    ) -> Self {
        Self::Error(ErrorReport {
            base: EventBase::new(StatusLevel::Error, message, None),
            error_type: error_type.into(),
            details: None,
            recovery_suggestion: None,
            recoverable,
        })
    }

    /// common fields of any variant
    pub fn base(&self) -> &EventBase {
        match self {
            Self::AnalysisStarted(e) => &e.base,
            Self::AnalysisCompleted(e) => &e.base,
            Self::AnalysisError(e) => &e.base,
            Self::NodeExecution(e) => &e.base,
            Self::SearchProgress(e) => &e.base,
            Self::SourceDiscovered(e) => &e.base,
            Self::Insight(e) => &e.base,
            Self::Opportunity(e) => &e.base,
            Self::ProgressUpdate(e) => &e.base,
            Self::Error(e) => &e.base,
        }
    }

    /// wire tag of this variant
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AnalysisStarted(_) => "analysis_started",
            Self::AnalysisCompleted(_) => "analysis_completed",
            Self::AnalysisError(_) => "analysis_error",
            Self::NodeExecution(_) => "node_execution",
            Self::SearchProgress(_) => "search_progress",
            Self::SourceDiscovered(_) => "source_discovered",
            Self::Insight(_) => "insight",
            Self::Opportunity(_) => "opportunity",
            Self::ProgressUpdate(_) => "progress_update",
            Self::Error(_) => "error",
        }
    }

    /// progress percentage, if any
    pub fn progress_percent(&self) -> Option<f64> {
        self.base().progress
    }

    /// true for events after which no more events of the same analysis follow
    pub fn is_terminal(&self) -> bool {
        self.as_analysis_completed().is_some() || self.as_analysis_error().is_some()
    }
}

/// Wire wrapper of an event, one UTF-8 text frame each
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// typed payload
    pub event: Event,
    /// destination session
    pub session_id: String,
    /// per-session sequence number, starts at 1
    pub sequence_number: u64,
}

impl Envelope {
    /// encode to a json text frame
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// decode a json text frame
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
