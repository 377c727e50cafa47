use std::time::Duration;

use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};

use crate::event::{
    AnalysisCompleted, AnalysisStarted, Event, EventBase, NodeExecution, OpportunityIdentified,
    StatusLevel,
};

/// One generated result item of an analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    /// short title
    pub title: String,
    /// description
    pub description: String,
    /// relevance score
    #[serde(default)]
    pub score: Option<f64>,
}

/// Static data of an analysis, the input of a simulated event stream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    /// analysis id
    pub analysis_id: String,
    /// analysed subject
    #[serde(default)]
    pub subject: Option<String>,
    /// competitors processed so far
    #[serde(default)]
    pub competitors: Vec<String>,
    /// generated result items
    #[serde(default)]
    pub results: Vec<ResultItem>,
}

// progress band of each narrative part
const COMPETITORS_FROM: f64 = 10.0;
const COMPETITORS_TO: f64 = 45.0;
const MIDPOINT: f64 = 50.0;
const RESULTS_TO: f64 = 95.0;

fn spread(from: f64, to: f64, index: usize, total: usize) -> f64 {
    from + (to - from) * (index + 1) as f64 / total as f64
}

/// Event number `index` of the narrative, `None` past the end
fn narrate(snapshot: &AnalysisSnapshot, index: usize) -> Option<Event> {
    let competitors = snapshot.competitors.len();
    let results = snapshot.results.len();

    if index == 0 {
        let message = match &snapshot.subject {
            Some(subject) => format!("Starting analysis of {}", subject),
            None => "Starting analysis".to_string(),
        };
        return Some(Event::AnalysisStarted(AnalysisStarted {
            base: EventBase::new(StatusLevel::Info, message, Some(0.0)),
            analysis_id: snapshot.analysis_id.clone(),
            subject: snapshot.subject.clone(),
        }));
    }

    let index = index - 1;
    if index < competitors {
        let name = &snapshot.competitors[index];
        return Some(Event::NodeExecution(NodeExecution {
            base: EventBase::new(
                StatusLevel::Progress,
                format!("Analyzing competitor {}", name),
                Some(spread(COMPETITORS_FROM, COMPETITORS_TO, index, competitors)),
            ),
            node: "competitor_analysis".to_string(),
            step: Some(index as u32 + 1),
            total_steps: Some(competitors as u32),
        }));
    }

    let index = index - competitors;
    if index == 0 {
        return Some(Event::stage(
            "market_analysis",
            StatusLevel::Progress,
            "Analyzing market position",
            Some(MIDPOINT),
        ));
    }

    let index = index - 1;
    if index < results {
        let item = &snapshot.results[index];
        return Some(Event::Opportunity(OpportunityIdentified {
            base: EventBase::new(
                StatusLevel::Success,
                format!("Opportunity identified: {}", item.title),
                Some(spread(MIDPOINT, RESULTS_TO, index, results)),
            ),
            title: item.title.clone(),
            description: item.description.clone(),
            score: item.score,
        }));
    }

    if index == results {
        return Some(Event::AnalysisCompleted(AnalysisCompleted {
            base: EventBase::new(StatusLevel::Success, "Analysis complete", Some(100.0)),
            analysis_id: snapshot.analysis_id.clone(),
            result_count: results,
            duration_secs: None,
        }));
    }

    None
}

/// Lazy, finite narrative of `snapshot`, each event after the first is delayed by `delay`
pub(crate) fn simulate(
    snapshot: AnalysisSnapshot,
    delay: Duration,
) -> impl Stream<Item = Event> + Send {
    stream::unfold((snapshot, 0usize), move |(snapshot, index)| async move {
        let event = narrate(&snapshot, index)?;
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some((event, (snapshot, index + 1)))
    })
}

#[cfg(test)]
mod test {
    use futures_util::StreamExt;

    use super::*;

    fn snapshot() -> AnalysisSnapshot {
        AnalysisSnapshot {
            analysis_id: "a-1".to_string(),
            subject: Some("Acme".to_string()),
            competitors: vec!["Globex".to_string(), "Initech".to_string()],
            results: (0..3)
                .map(|i| ResultItem {
                    title: format!("gap {}", i),
                    description: "underserved segment".to_string(),
                    score: Some(0.5),
                })
                .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_narrative_shape() {
        let start = tokio::time::Instant::now();
        let events: Vec<Event> = simulate(snapshot(), Duration::from_millis(100))
            .collect()
            .await;

        assert_eq!(events.len(), 8);
        assert!(events[0].as_analysis_started().is_some());
        assert_eq!(events[0].progress_percent(), Some(0.0));
        assert_eq!(events[1].as_node_execution().unwrap().step, Some(1));
        assert_eq!(events[3].progress_percent(), Some(MIDPOINT));
        assert!(events[4..7].iter().all(|e| e.as_opportunity().is_some()));
        assert!(events[7].is_terminal());
        assert_eq!(events[7].progress_percent(), Some(100.0));

        let progress: Vec<f64> = events.iter().filter_map(Event::progress_percent).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_empty_snapshot_still_completes() {
        let events: Vec<Event> = simulate(AnalysisSnapshot::default(), Duration::ZERO)
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[2].as_analysis_completed().unwrap().result_count, 0);
    }
}
