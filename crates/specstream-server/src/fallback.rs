use specstream_core::analyzer::{AnalyzerEvent, SpectrumAnalyzer};
use specstream_core::broadcaster::StreamingBroadcaster;
use specstream_core::config::{SourceMode, StreamerConfigPatch};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Streams synthetic frames while the upstream is down and live frames while
/// it is connected.
pub async fn follow_upstream(analyzer: Arc<SpectrumAnalyzer>, broadcaster: Arc<StreamingBroadcaster>) {
    let mut events = analyzer.subscribe();
    sync_source(&analyzer, &broadcaster);
    loop {
        match events.recv().await {
            Ok(AnalyzerEvent::Connected { .. } | AnalyzerEvent::Disconnected { .. }) => {
                sync_source(&analyzer, &broadcaster)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "demo fallback lagged behind analyzer events");
                sync_source(&analyzer, &broadcaster);
            }
            Err(RecvError::Closed) => break,
        }
        if broadcaster.is_destroyed() {
            break;
        }
    }
}

pub fn sync_source(analyzer: &SpectrumAnalyzer, broadcaster: &StreamingBroadcaster) {
    let want = if analyzer.is_connected() {
        SourceMode::Live
    } else {
        SourceMode::Synthetic
    };
    if broadcaster.streamer_config().source_mode == want {
        return;
    }
    match broadcaster.update_streamer_config(&StreamerConfigPatch::new().with_source_mode(want)) {
        Ok(_) => tracing::info!(source = want.as_str(), "demo fallback switched stream source"),
        Err(e) => tracing::warn!(error = %e, "demo fallback could not switch stream source"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specstream_core::config::{AnalyzerConfig, StreamerConfig};

    #[tokio::test]
    async fn disconnected_upstream_streams_synthetic_frames() {
        let analyzer = Arc::new(SpectrumAnalyzer::new(AnalyzerConfig::default(), 4).unwrap());
        let broadcaster = Arc::new(
            StreamingBroadcaster::new(analyzer.clone(), StreamerConfig::default()).unwrap(),
        );
        sync_source(&analyzer, &broadcaster);
        assert_eq!(
            broadcaster.streamer_config().source_mode,
            SourceMode::Synthetic
        );
        sync_source(&analyzer, &broadcaster);
        assert_eq!(
            broadcaster.streamer_config().source_mode,
            SourceMode::Synthetic
        );
    }
}
