use crate::config::{AnalyzerConfig, AnalyzerConfigPatch};
use crate::detect::{detect, Signal};
use crate::error::{ConnectionError, DecodeError, ValidationError};
use crate::frame::{self, now_ms, Frame};
use crate::history::HistoryBuffer;
use crate::util;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 256;
const DETECTION_LOG_LEN: usize = 100;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyzerEvent {
    Connected {
        url: String,
    },
    Disconnected {
        reason: String,
    },
    FrameAvailable {
        seq: u64,
        captured_at_ms: u64,
        bins: usize,
    },
    DecodeFailed {
        error: DecodeError,
        len: usize,
    },
    ConfigUpdated {
        config: AnalyzerConfig,
    },
    BufferCleared {
        previous_size: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub upstream_url: Option<String>,
    pub buffer_size: usize,
    pub max_buffer_size: usize,
    pub config: AnalyzerConfig,
    /// Capture time (epoch ms) of the newest accepted frame.
    pub last_frame_at: Option<u64>,
    pub frames_received: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DetectionRecord {
    pub timestamp_ms: u64,
    pub signal_count: usize,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalStats {
    pub total_detections: usize,
    pub total_signals: usize,
    pub average_signals_per_detection: f64,
    pub last_detection: Option<DetectionRecord>,
}

/// What happened to one inbound upstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { seq: u64 },
    Rejected(DecodeError),
    /// Not connected; frames are only taken while connected.
    Ignored,
}

struct Link {
    state: ConnectionState,
    url: Option<String>,
    generation: u64,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

struct History {
    buffer: HistoryBuffer,
    last_frame_at_ms: Option<u64>,
    next_seq: u64,
}

/// Owns the upstream connection, the frame history and the analyzer config.
///
/// History is only written by the ingestion path; every reader gets `Arc`
/// snapshots, so a frame is never observed half written.
pub struct SpectrumAnalyzer {
    config: RwLock<Arc<AnalyzerConfig>>,
    history: RwLock<History>,
    link: Mutex<Link>,
    lifecycle: tokio::sync::Mutex<()>,
    detections: Mutex<VecDeque<DetectionRecord>>,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
    events: broadcast::Sender<AnalyzerEvent>,
}

impl SpectrumAnalyzer {
    pub fn new(config: AnalyzerConfig, max_buffer_size: usize) -> Result<Self, ValidationError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tracing::info!(?config, max_buffer_size, "spectrum analyzer created");
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            history: RwLock::new(History {
                buffer: HistoryBuffer::new(max_buffer_size),
                last_frame_at_ms: None,
                next_seq: 0,
            }),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                url: None,
                generation: 0,
                stop: None,
                task: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            detections: Mutex::new(VecDeque::with_capacity(DETECTION_LOG_LEN)),
            frames_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalyzerEvent> {
        self.events.subscribe()
    }

    /// Connects to `url`. Already being connected to the same url is a no-op;
    /// a different url replaces the current connection. Failures are returned
    /// and never retried here.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<(), ConnectionError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConnectionError::EmptyUrl);
        }

        let _lifecycle = self.lifecycle.lock().await;
        {
            let link = util::lock(&self.link, "analyzer link");
            if link.state == ConnectionState::Connected && link.url.as_deref() == Some(url) {
                return Ok(());
            }
        }
        self.close_link("replaced by a new connection").await;

        {
            let mut link = util::lock(&self.link, "analyzer link");
            link.state = ConnectionState::Connecting;
            link.url = Some(url.to_string());
        }
        tracing::info!(url, "connecting to upstream");

        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.set_disconnected();
                tracing::warn!(url, error = %e, "upstream connect failed");
                return Err(ConnectionError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.set_disconnected();
                tracing::warn!(url, "upstream connect timed out");
                return Err(ConnectionError::Timeout {
                    url: url.to_string(),
                });
            }
        };

        {
            let mut link = util::lock(&self.link, "analyzer link");
            link.generation += 1;
            let generation = link.generation;
            let (stop_tx, stop_rx) = oneshot::channel();
            link.state = ConnectionState::Connected;
            link.stop = Some(stop_tx);
            let this = Arc::clone(self);
            link.task = Some(tokio::spawn(async move {
                this.read_upstream(ws, stop_rx, generation).await;
            }));
        }

        tracing::info!(url, "connected to upstream");
        let _ = self.events.send(AnalyzerEvent::Connected {
            url: url.to_string(),
        });
        Ok(())
    }

    /// Closes the upstream connection. Safe to call when not connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_link("disconnect requested").await;
    }

    async fn close_link(&self, reason: &str) {
        let (was, stop, task) = {
            let mut link = util::lock(&self.link, "analyzer link");
            let was = link.state;
            link.state = ConnectionState::Disconnected;
            link.generation += 1;
            (was, link.stop.take(), link.task.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("upstream reader did not stop in time; aborting");
                task.abort();
            }
        }
        if was != ConnectionState::Disconnected {
            tracing::info!(reason, "disconnected from upstream");
            let _ = self.events.send(AnalyzerEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn set_disconnected(&self) {
        let mut link = util::lock(&self.link, "analyzer link");
        link.state = ConnectionState::Disconnected;
    }

    async fn read_upstream(
        self: Arc<Self>,
        mut ws: UpstreamSocket,
        mut stop: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let reason = loop {
            tokio::select! {
                _ = &mut stop => {
                    if let Err(e) = ws.close(None).await {
                        tracing::debug!(error = %e, "upstream close handshake failed");
                    }
                    return;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.on_frame(&data);
                    }
                    Some(Ok(Message::Text(txt))) => {
                        tracing::debug!(bytes = txt.len(), "ignoring upstream text message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => format!("upstream closed ({}: {})", f.code, f.reason),
                            None => "upstream closed".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("upstream error: {e}"),
                    None => break "upstream stream ended".to_string(),
                }
            }
        };

        let current = {
            let mut link = util::lock(&self.link, "analyzer link");
            if link.generation != generation || link.state == ConnectionState::Disconnected {
                false
            } else {
                link.state = ConnectionState::Disconnected;
                link.stop = None;
                link.task = None;
                true
            }
        };
        if current {
            tracing::warn!(reason = %reason, "upstream connection lost");
            let _ = self.events.send(AnalyzerEvent::Disconnected { reason });
        }
    }

    /// Handles one inbound upstream message.
    ///
    /// Malformed buffers are counted, logged and reported as events; they are
    /// not stored and never interrupt the stream.
    pub fn on_frame(&self, raw: &[u8]) -> IngestOutcome {
        if self.connection_state() != ConnectionState::Connected {
            return IngestOutcome::Ignored;
        }

        let cfg = self.config();
        let mut frame = frame::decode(raw, cfg.acquisition());
        if let Some(err) = frame.decode_error {
            let n = self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n.is_power_of_two() {
                tracing::warn!(error = %err, len = raw.len(), decode_errors = n, "dropping malformed upstream frame");
            }
            let _ = self.events.send(AnalyzerEvent::DecodeFailed {
                error: err,
                len: raw.len(),
            });
            return IngestOutcome::Rejected(err);
        }
        if frame.fft_size != cfg.fft_size {
            tracing::debug!(
                expected = cfg.fft_size,
                got = frame.fft_size,
                "upstream frame size differs from configured fft_size"
            );
        }

        let bins = frame.fft_size;
        let (seq, captured_at_ms) = {
            let mut h = util::write(&self.history, "analyzer history");
            h.next_seq += 1;
            frame.seq = h.next_seq;
            let at = frame.captured_at_ms;
            h.buffer.push(Arc::new(frame));
            h.last_frame_at_ms = Some(at);
            (h.next_seq, at)
        };
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(AnalyzerEvent::FrameAvailable {
            seq,
            captured_at_ms,
            bins,
        });
        IngestOutcome::Accepted { seq }
    }

    pub fn connection_state(&self) -> ConnectionState {
        util::lock(&self.link, "analyzer link").state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn status(&self) -> AnalyzerStatus {
        let (state, upstream_url) = {
            let link = util::lock(&self.link, "analyzer link");
            (link.state, link.url.clone())
        };
        let (buffer_size, max_buffer_size, last_frame_at) = {
            let h = util::read(&self.history, "analyzer history");
            (h.buffer.len(), h.buffer.capacity(), h.last_frame_at_ms)
        };
        AnalyzerStatus {
            connected: state == ConnectionState::Connected,
            state,
            upstream_url,
            buffer_size,
            max_buffer_size,
            config: *self.config(),
            last_frame_at,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> Arc<AnalyzerConfig> {
        util::read(&self.config, "analyzer config").clone()
    }

    /// Validates and merges `patch`; on error the config is left untouched.
    pub fn update_config(
        &self,
        patch: &AnalyzerConfigPatch,
    ) -> Result<AnalyzerConfig, ValidationError> {
        let (old, next) = {
            let mut cfg = util::write(&self.config, "analyzer config");
            let next = cfg.merged(patch)?;
            let old = std::mem::replace(&mut *cfg, Arc::new(next));
            (old, next)
        };
        tracing::info!(old = ?*old, new = ?next, "analyzer config updated");
        let _ = self
            .events
            .send(AnalyzerEvent::ConfigUpdated { config: next });
        Ok(next)
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        util::read(&self.history, "analyzer history").buffer.latest()
    }

    pub fn recent_frames(&self, limit: usize) -> Vec<Arc<Frame>> {
        util::read(&self.history, "analyzer history")
            .buffer
            .recent(limit)
    }

    pub fn history_bytes(&self) -> usize {
        util::read(&self.history, "analyzer history")
            .buffer
            .heap_bytes()
    }

    /// Runs detection on the newest frame. `None` uses the configured threshold.
    pub fn detect_signals(&self, threshold: Option<f64>) -> Result<Vec<Signal>, ValidationError> {
        let threshold = match threshold {
            Some(t) if !t.is_finite() => {
                return Err(ValidationError::new("threshold", "must be a finite number"))
            }
            Some(t) => t,
            None => self.config().signal_threshold,
        };
        let Some(frame) = self.latest_frame() else {
            return Ok(Vec::new());
        };

        let signals = detect(&frame, threshold);
        {
            let mut log = util::lock(&self.detections, "detection log");
            if log.len() >= DETECTION_LOG_LEN {
                log.pop_front();
            }
            log.push_back(DetectionRecord {
                timestamp_ms: now_ms(),
                signal_count: signals.len(),
                threshold,
            });
        }
        tracing::debug!(
            signals = signals.len(),
            threshold,
            bins = frame.fft_size,
            seq = frame.seq,
            "signal detection completed"
        );
        Ok(signals)
    }

    pub fn signal_stats(&self) -> SignalStats {
        let log = util::lock(&self.detections, "detection log");
        let total_signals: usize = log.iter().map(|r| r.signal_count).sum();
        SignalStats {
            total_detections: log.len(),
            total_signals,
            average_signals_per_detection: if log.is_empty() {
                0.0
            } else {
                total_signals as f64 / log.len() as f64
            },
            last_detection: log.back().copied(),
        }
    }

    /// Empties the history. Config and connection are unaffected.
    pub fn clear_buffer(&self) -> usize {
        let previous_size = util::write(&self.history, "analyzer history")
            .buffer
            .clear();
        tracing::info!(previous_size, "frame history cleared");
        let _ = self
            .events
            .send(AnalyzerEvent::BufferCleared { previous_size });
        previous_size
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        util::lock(&self.link, "analyzer link").state = state;
    }
}
