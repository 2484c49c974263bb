use serde::Serialize;
use specstream_core::analyzer::{AnalyzerStatus, SpectrumAnalyzer};
use specstream_core::broadcaster::{BroadcasterStats, StreamingBroadcaster};
use std::sync::Arc;

pub struct AppState {
    pub analyzer: Arc<SpectrumAnalyzer>,
    pub broadcaster: Arc<StreamingBroadcaster>,
    /// Used by `/api/connect` when the request names no url.
    pub default_upstream: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub analyzer: AnalyzerStatus,
    pub stream: BroadcasterStats,
    pub uptime_secs: i64,
}

impl AppState {
    pub fn new(
        analyzer: Arc<SpectrumAnalyzer>,
        broadcaster: Arc<StreamingBroadcaster>,
        default_upstream: Option<String>,
    ) -> Self {
        Self {
            analyzer,
            broadcaster,
            default_upstream,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.started_at).num_seconds().max(0)
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            analyzer: self.analyzer.status(),
            stream: self.broadcaster.stats(),
            uptime_secs: self.uptime_secs(),
        }
    }
}
