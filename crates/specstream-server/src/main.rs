mod api;
mod app;
mod banner;
mod build_info;
mod fallback;
mod logging;
mod state;
mod ws;

use anyhow::Context;
use clap::Parser;
use specstream_core::analyzer::SpectrumAnalyzer;
use specstream_core::broadcaster::StreamingBroadcaster;
use specstream_core::config::{AnalyzerConfig, PerformanceMode, SourceMode, StreamerConfig};
use specstream_core::history::DEFAULT_MAX_BUFFER_SIZE;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "specstream-server",
    version,
    about = "Ingest FFT frames from an upstream analyzer, detect signals and stream spectra to WebSocket clients."
)]
struct Args {
    /// Address to bind the HTTP/WebSocket server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8092)]
    port: u16,

    /// Upstream FFT WebSocket to connect to at startup (example: ws://127.0.0.1:8073/fft)
    #[arg(long)]
    upstream: Option<String>,

    #[arg(long, default_value_t = 1024)]
    fft_size: usize,

    /// Centre frequency in Hz
    #[arg(long, default_value_t = 145_000_000.0)]
    center_frequency: f64,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 2_400_000.0)]
    sample_rate: f64,

    /// Default signal detection threshold in dB
    #[arg(long, default_value_t = -70.0, allow_negative_numbers = true)]
    threshold: f64,

    /// Frames kept in history
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_SIZE)]
    max_buffer_size: usize,

    /// performance, balanced or quality
    #[arg(long, default_value = "balanced")]
    performance_mode: PerformanceMode,

    /// Override the mode's streaming rate (frames per second)
    #[arg(long)]
    streaming_rate: Option<f64>,

    /// Send frames without zstd compression
    #[arg(long)]
    no_compression: bool,

    /// Stream generated frames instead of upstream data
    #[arg(long, conflicts_with = "demo_fallback")]
    synthetic: bool,

    /// Stream generated frames whenever the upstream is disconnected
    #[arg(long)]
    demo_fallback: bool,

    #[arg(long, default_value_t = StreamerConfig::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Enable debug logging for specstream crates
    #[arg(long)]
    debug: bool,

    /// Also write daily-rotated logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            fft_size: self.fft_size,
            center_frequency: self.center_frequency,
            sample_rate: self.sample_rate,
            signal_threshold: self.threshold,
        }
    }

    fn streamer_config(&self) -> StreamerConfig {
        let mut cfg = StreamerConfig::for_mode(self.performance_mode);
        if let Some(rate) = self.streaming_rate {
            cfg.streaming_rate_hz = rate;
        }
        if self.no_compression {
            cfg.compression_enabled = false;
        }
        if self.synthetic {
            cfg.source_mode = SourceMode::Synthetic;
        }
        cfg.max_clients = self.max_clients;
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guards = logging::init(&logging::LoggingConfig {
        debug: args.debug,
        log_dir: args.log_dir.clone(),
        ..Default::default()
    })?;

    let addr = app::bind_addr(&args.host, args.port)?;
    banner::log_startup_banner(&addr.to_string(), args.upstream.as_deref());

    let analyzer = Arc::new(
        SpectrumAnalyzer::new(args.analyzer_config(), args.max_buffer_size)
            .context("invalid analyzer configuration")?,
    );
    let broadcaster = Arc::new(
        StreamingBroadcaster::new(analyzer.clone(), args.streamer_config())
            .context("invalid streaming configuration")?,
    );
    broadcaster.start().context("start stream scheduler")?;

    if let Some(url) = args.upstream.as_deref() {
        if let Err(e) = analyzer.connect(url).await {
            tracing::warn!(error = %e, "initial upstream connect failed; use /api/connect to retry");
        }
    }

    let fallback = args.demo_fallback.then(|| {
        tokio::spawn(fallback::follow_upstream(
            analyzer.clone(),
            broadcaster.clone(),
        ))
    });

    let state = Arc::new(state::AppState::new(
        analyzer.clone(),
        broadcaster.clone(),
        args.upstream.clone(),
    ));
    let served = app::serve(state, addr).await;
    if let Err(e) = &served {
        tracing::error!(error = ?e, "server stopped with an error");
    }

    if let Some(task) = fallback {
        task.abort();
    }
    broadcaster.destroy().await;
    analyzer.disconnect().await;
    tracing::info!("shutdown complete");
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_mode_preset() {
        let args = Args::parse_from([
            "specstream-server",
            "--performance-mode",
            "quality",
            "--streaming-rate",
            "20",
            "--no-compression",
            "--threshold",
            "-65",
        ]);
        let cfg = args.streamer_config();
        assert_eq!(cfg.performance_mode, PerformanceMode::Quality);
        assert_eq!(cfg.streaming_rate_hz, 20.0);
        assert!(!cfg.compression_enabled);
        assert_eq!(cfg.source_mode, SourceMode::Live);
        assert_eq!(args.analyzer_config().signal_threshold, -65.0);
    }

    #[test]
    fn defaults_match_the_balanced_preset() {
        let args = Args::parse_from(["specstream-server"]);
        assert_eq!(args.streamer_config(), StreamerConfig::default());
        assert_eq!(args.analyzer_config(), AnalyzerConfig::default());
    }

    #[test]
    fn synthetic_and_demo_fallback_conflict() {
        assert!(Args::try_parse_from(["specstream-server", "--synthetic", "--demo-fallback"]).is_err());
    }
}
