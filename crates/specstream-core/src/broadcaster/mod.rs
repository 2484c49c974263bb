//! Paced fan-out of frames to downstream clients.
//!
//! A single scheduler task ticks at the configured rate and drops the newest
//! frame into every client's one-slot mailbox. Each client has its own delivery
//! task, so a slow client only ever loses frames of its own. A client that keeps
//! losing frames is backed off to a coarser decimation for a while.

pub mod backoff;
pub mod stats;
pub mod transport;

pub use stats::BroadcasterStats;
pub use transport::{ChannelTransport, ClientTransport, Outgoing, OutgoingReceiver, WriteAck};

use crate::analyzer::SpectrumAnalyzer;
use crate::codec::zstd_stream::ZstdStreamEncoder;
use crate::config::{PerformanceMode, SourceMode, StreamerConfig, StreamerConfigPatch};
use crate::error::{BroadcasterError, TransportError, ValidationError};
use crate::frame::Frame;
use crate::protocol::{FramePacket, ServerMessage, PACKET_RAW, PACKET_ZSTD};
use crate::synthetic::SyntheticSource;
use crate::util;
use backoff::Backoff;
use dashmap::DashMap;
use serde::Serialize;
use stats::{Counters, Perf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const ZSTD_LEVEL: i32 = 3;
const NOTICE_DEPTH: usize = 8;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BroadcasterEvent {
    ClientAdded {
        client_id: String,
        client_count: usize,
    },
    ClientRemoved {
        client_id: String,
        client_count: usize,
    },
    ClientError {
        client_id: String,
        error: String,
    },
    ConfigUpdated {
        config: StreamerConfig,
    },
}

/// One encoded view of a frame, shared by every client at the same decimation.
struct PreparedFrame {
    /// Broadcaster-wide publish order, independent of the frame's source.
    pos: u64,
    seq: u64,
    compress: bool,
    cbor: Vec<u8>,
    prepared_at: Instant,
}

impl PreparedFrame {
    fn build(
        pos: u64,
        frame: &Frame,
        decimation: usize,
        cfg: &StreamerConfig,
    ) -> anyhow::Result<Self> {
        let cbor = FramePacket::from_frame(frame, decimation, cfg.source_mode).to_cbor()?;
        Ok(Self {
            pos,
            seq: frame.seq,
            compress: cfg.compression_enabled,
            cbor,
            prepared_at: Instant::now(),
        })
    }
}

struct ClientSlot {
    id: String,
    transport: Arc<dyn ClientTransport>,
    mailbox: Mutex<Option<Arc<PreparedFrame>>>,
    wake: Notify,
    notices: mpsc::Sender<String>,
    mode: Mutex<Option<PerformanceMode>>,
    backoff: Mutex<Backoff>,
    last_pos: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSlot {
    fn mode(&self) -> Option<PerformanceMode> {
        *util::lock(&self.mode, "client mode")
    }

    /// Returns true if an undelivered frame was replaced.
    fn publish(&self, frame: Arc<PreparedFrame>) -> bool {
        let superseded = {
            let mut mb = util::lock(&self.mailbox, "client mailbox");
            if mb.as_ref().is_some_and(|cur| cur.pos >= frame.pos) {
                return false;
            }
            mb.replace(frame).is_some()
        };
        self.wake.notify_one();
        superseded
    }

    fn take(&self) -> Option<Arc<PreparedFrame>> {
        util::lock(&self.mailbox, "client mailbox").take()
    }

    fn queued_bytes(&self) -> usize {
        util::lock(&self.mailbox, "client mailbox")
            .as_ref()
            .map_or(0, |f| f.cbor.len())
    }

    fn notify(&self, text: String) {
        if let Err(e) = self.notices.try_send(text) {
            tracing::debug!(client_id = %self.id, error = %e, "client notice dropped");
        }
    }

    /// Preset decimation adjusted for backoff; restores the preset once the
    /// hold has run out.
    fn decimation(&self, base: usize, now: Instant) -> usize {
        let mut backoff = util::lock(&self.backoff, "client backoff");
        if backoff.expire(now) {
            tracing::info!(client_id = %self.id, decimation = base, "client caught up; decimation restored");
        }
        backoff.apply(base)
    }

    /// Returns true if this publish raised the client's decimation.
    fn record_publish(&self, superseded: bool, base: usize, now: Instant) -> bool {
        let raised = util::lock(&self.backoff, "client backoff").record(superseded, base, now);
        if let Some(decimation) = raised {
            tracing::warn!(client_id = %self.id, decimation, "client falling behind; raising decimation");
        }
        raised.is_some()
    }

    fn abort(&self) {
        if let Some(task) = util::lock(&self.task, "client task").take() {
            task.abort();
        }
    }
}

struct Shared {
    analyzer: Arc<SpectrumAnalyzer>,
    config: RwLock<Arc<StreamerConfig>>,
    clients: DashMap<String, Arc<ClientSlot>>,
    admission: Mutex<()>,
    synthetic: Mutex<SyntheticSource>,
    /// Highest analyzer seq already streamed or passed over; live frames at
    /// or below it are stale.
    live_floor: AtomicU64,
    next_pos: AtomicU64,
    closed: AtomicBool,
    rearm: Notify,
    counters: Counters,
    perf: Mutex<Perf>,
    events: broadcast::Sender<BroadcasterEvent>,
}

impl Shared {
    fn config(&self) -> Arc<StreamerConfig> {
        util::read(&self.config, "streamer config").clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: BroadcasterEvent) {
        let _ = self.events.send(event);
    }

    fn tick(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let started = Instant::now();
        let published = self.publish_latest();
        let cost_ms = started.elapsed().as_secs_f64() * 1000.0;
        util::lock(&self.perf, "broadcaster perf")
            .tick_cost_ms
            .insert(cost_ms);
        published
    }

    fn next_frame(&self, cfg: &StreamerConfig) -> Option<Arc<Frame>> {
        match cfg.source_mode {
            SourceMode::Live => {
                let frame = self.analyzer.latest_frame()?;
                if self.live_floor.fetch_max(frame.seq, Ordering::AcqRel) >= frame.seq {
                    return None;
                }
                Some(frame)
            }
            SourceMode::Synthetic => Some(Arc::new(
                util::lock(&self.synthetic, "synthetic source").next_frame(),
            )),
        }
    }

    fn publish_latest(&self) -> usize {
        let cfg = self.config();
        let Some(frame) = self.next_frame(&cfg) else {
            Counters::bump(&self.counters.skipped_ticks, 1);
            return 0;
        };
        let pos = self.next_pos.fetch_add(1, Ordering::AcqRel) + 1;

        let slots: Vec<Arc<ClientSlot>> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut views: Vec<(usize, Arc<PreparedFrame>)> = Vec::with_capacity(2);
        let mut published = 0usize;
        let now = Instant::now();
        for slot in slots {
            if slot.last_pos.fetch_max(pos, Ordering::AcqRel) >= pos {
                continue;
            }
            let base = cfg.decimation_for(slot.mode());
            let decimation = slot.decimation(base, now);
            let view = match views.iter().find(|(d, _)| *d == decimation) {
                Some((_, v)) => v.clone(),
                None => match PreparedFrame::build(pos, &frame, decimation, &cfg) {
                    Ok(v) => {
                        let v = Arc::new(v);
                        views.push((decimation, v.clone()));
                        v
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, seq = frame.seq, decimation, "frame encode failed; dropping");
                        continue;
                    }
                },
            };
            let superseded = slot.publish(view);
            if superseded {
                Counters::bump(&self.counters.superseded_frames, 1);
            }
            if slot.record_publish(superseded, base, now) {
                Counters::bump(&self.counters.backoff_raises, 1);
            }
            published += 1;
        }
        published
    }

    fn detach(&self, id: &str) -> bool {
        let Some((_, slot)) = self.clients.remove(id) else {
            return false;
        };
        slot.abort();
        slot.transport.close();
        let client_count = self.clients.len();
        tracing::info!(client_id = %id, client_count, "stream client removed");
        self.emit(BroadcasterEvent::ClientRemoved {
            client_id: id.to_string(),
            client_count,
        });
        true
    }

    /// Called from the client's own delivery task.
    fn drop_failed(&self, slot: &Arc<ClientSlot>, err: &TransportError) {
        Counters::bump(&self.counters.send_failures, 1);
        let removed = self
            .clients
            .remove_if(&slot.id, |_, v| Arc::ptr_eq(v, slot))
            .is_some();
        slot.transport.close();
        if !removed {
            return;
        }
        let client_count = self.clients.len();
        tracing::warn!(client_id = %slot.id, error = %err, client_count, "client send failed; dropping client");
        self.emit(BroadcasterEvent::ClientError {
            client_id: slot.id.clone(),
            error: err.to_string(),
        });
        self.emit(BroadcasterEvent::ClientRemoved {
            client_id: slot.id.clone(),
            client_count,
        });
    }
}

fn encode_message(
    encoder: &mut Option<ZstdStreamEncoder>,
    frame: &PreparedFrame,
) -> anyhow::Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(frame.cbor.len() + 1);
    if !frame.compress {
        *encoder = None;
        msg.push(PACKET_RAW);
        msg.extend_from_slice(&frame.cbor);
        return Ok(msg);
    }
    let enc = match encoder.take() {
        Some(e) => e,
        None => ZstdStreamEncoder::new(ZSTD_LEVEL)?,
    };
    let enc = encoder.insert(enc);
    msg.push(PACKET_ZSTD);
    enc.compress_flush_into(&frame.cbor, &mut msg)?;
    Ok(msg)
}

async fn deliver(shared: Arc<Shared>, slot: Arc<ClientSlot>, mut notices: mpsc::Receiver<String>) {
    let mut encoder: Option<ZstdStreamEncoder> = None;
    loop {
        let (msg, frame) = tokio::select! {
            biased;
            Some(text) = notices.recv() => (Outgoing::Text(text), None),
            _ = slot.wake.notified() => {
                let Some(frame) = slot.take() else {
                    continue;
                };
                let bytes = match encode_message(&mut encoder, &frame) {
                    Ok(b) => b,
                    Err(e) => {
                        // A raw packet also resets the client's zstd decoder.
                        tracing::warn!(client_id = %slot.id, error = ?e, "frame compression failed; sending raw");
                        encoder = None;
                        let mut raw = Vec::with_capacity(frame.cbor.len() + 1);
                        raw.push(PACKET_RAW);
                        raw.extend_from_slice(&frame.cbor);
                        raw
                    }
                };
                (Outgoing::Binary(bytes), Some(frame))
            }
        };

        let len = msg.len() as u64;
        if let Err(e) = slot.transport.send(msg).await {
            shared.drop_failed(&slot, &e);
            break;
        }
        Counters::bump(&shared.counters.bytes_transmitted, len);
        if let Some(frame) = frame {
            Counters::bump(&shared.counters.frames_streamed, 1);
            let latency_ms = frame.prepared_at.elapsed().as_secs_f64() * 1000.0;
            util::lock(&shared.perf, "broadcaster perf")
                .latency_ms
                .insert(latency_ms);
        }
    }
}

async fn run_scheduler(shared: Arc<Shared>) {
    loop {
        let period = shared.config().tick_interval();
        tracing::debug!(period_ms = period.as_secs_f64() * 1000.0, "stream scheduler armed");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    shared.tick();
                }
                _ = shared.rearm.notified() => break,
            }
        }
        if shared.is_closed() {
            return;
        }
    }
}

pub struct StreamingBroadcaster {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingBroadcaster {
    pub fn new(
        analyzer: Arc<SpectrumAnalyzer>,
        config: StreamerConfig,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tracing::info!(?config, "streaming broadcaster created");
        Ok(Self {
            shared: Arc::new(Shared {
                analyzer,
                config: RwLock::new(Arc::new(config)),
                clients: DashMap::new(),
                admission: Mutex::new(()),
                synthetic: Mutex::new(SyntheticSource::new()),
                live_floor: AtomicU64::new(0),
                next_pos: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                rearm: Notify::new(),
                counters: Counters::default(),
                perf: Mutex::new(Perf::default()),
                events,
            }),
            scheduler: Mutex::new(None),
        })
    }

    /// Spawns the scheduler. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<(), BroadcasterError> {
        if self.shared.is_closed() {
            return Err(BroadcasterError::Closed);
        }
        let mut scheduler = util::lock(&self.scheduler, "stream scheduler");
        if scheduler.is_none() {
            *scheduler = Some(tokio::spawn(run_scheduler(self.shared.clone())));
            tracing::info!("stream scheduler started");
        }
        Ok(())
    }

    /// Runs one scheduling step now; returns how many clients got a frame.
    pub fn tick(&self) -> usize {
        self.shared.tick()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcasterEvent> {
        self.shared.events.subscribe()
    }

    pub fn add_client(
        &self,
        client_id: &str,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<(), BroadcasterError> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(ValidationError::new("client_id", "must not be empty").into());
        }
        let shared = &self.shared;
        let client_count = {
            let _admission = util::lock(&shared.admission, "client admission");
            if shared.is_closed() {
                return Err(BroadcasterError::Closed);
            }
            let cfg = shared.config();
            if shared.clients.contains_key(client_id) {
                return Err(BroadcasterError::Conflict {
                    client_id: client_id.to_string(),
                });
            }
            if shared.clients.len() >= cfg.max_clients {
                return Err(BroadcasterError::CapacityExceeded {
                    max: cfg.max_clients,
                });
            }

            let (notice_tx, notice_rx) = mpsc::channel(NOTICE_DEPTH);
            let slot = Arc::new(ClientSlot {
                id: client_id.to_string(),
                transport,
                mailbox: Mutex::new(None),
                wake: Notify::new(),
                notices: notice_tx,
                mode: Mutex::new(None),
                backoff: Mutex::new(Backoff::default()),
                last_pos: AtomicU64::new(0),
                task: Mutex::new(None),
            });
            slot.notify(ServerMessage::stream_config(&cfg, None).to_json());
            let task = tokio::spawn(deliver(shared.clone(), slot.clone(), notice_rx));
            *util::lock(&slot.task, "client task") = Some(task);
            shared.clients.insert(client_id.to_string(), slot);
            shared.clients.len()
        };

        tracing::info!(client_id, client_count, "stream client added");
        shared.emit(BroadcasterEvent::ClientAdded {
            client_id: client_id.to_string(),
            client_count,
        });
        Ok(())
    }

    /// Returns false if the client was not registered.
    pub fn remove_client(&self, client_id: &str) -> bool {
        self.shared.detach(client_id)
    }

    /// Overrides the decimation preset for one client; `None` follows the
    /// global mode again.
    pub fn set_client_performance(
        &self,
        client_id: &str,
        mode: Option<PerformanceMode>,
    ) -> Result<(), BroadcasterError> {
        if self.shared.is_closed() {
            return Err(BroadcasterError::Closed);
        }
        let slot = self
            .shared
            .clients
            .get(client_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BroadcasterError::UnknownClient {
                client_id: client_id.to_string(),
            })?;
        *util::lock(&slot.mode, "client mode") = mode;
        let cfg = self.shared.config();
        slot.notify(ServerMessage::stream_config(&cfg, mode).to_json());
        tracing::info!(
            client_id,
            mode = mode.map(PerformanceMode::as_str),
            decimation = cfg.decimation_for(mode),
            "client performance mode set"
        );
        Ok(())
    }

    pub fn client_performance(&self, client_id: &str) -> Option<Option<PerformanceMode>> {
        self.shared.clients.get(client_id).map(|e| e.value().mode())
    }

    pub fn update_streamer_config(
        &self,
        patch: &StreamerConfigPatch,
    ) -> Result<StreamerConfig, BroadcasterError> {
        if self.shared.is_closed() {
            return Err(BroadcasterError::Closed);
        }
        let (old, next) = {
            let mut cfg = util::write(&self.shared.config, "streamer config");
            let next = cfg.merged(patch)?;
            let old = std::mem::replace(&mut *cfg, Arc::new(next));
            (*old, next)
        };

        let slots: Vec<Arc<ClientSlot>> = self
            .shared
            .clients
            .iter()
            .map(|e| e.value().clone())
            .collect();
        if old.source_mode != SourceMode::Live && next.source_mode == SourceMode::Live {
            // Anything the analyzer already holds predates the frames streamed
            // while it was not the source.
            if let Some(frame) = self.shared.analyzer.latest_frame() {
                self.shared.live_floor.fetch_max(frame.seq, Ordering::AcqRel);
            }
        }
        if old.streaming_rate_hz != next.streaming_rate_hz {
            self.shared.rearm.notify_one();
        }
        if slots.len() > next.max_clients {
            tracing::warn!(
                client_count = slots.len(),
                max_clients = next.max_clients,
                "client limit lowered below current client count; existing clients kept"
            );
        }
        for slot in &slots {
            slot.notify(ServerMessage::stream_config(&next, slot.mode()).to_json());
        }

        tracing::info!(old = ?old, new = ?next, "streamer config updated");
        self.shared
            .emit(BroadcasterEvent::ConfigUpdated { config: next });
        Ok(next)
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        *self.shared.config()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> BroadcasterStats {
        let shared = &self.shared;
        let cfg = shared.config();
        let queued: usize = shared.clients.iter().map(|e| e.value().queued_bytes()).sum();
        let held = shared.analyzer.history_bytes() + queued;
        let (cpu_usage, average_latency_ms) = {
            let perf = util::lock(&shared.perf, "broadcaster perf");
            (perf.cpu_usage(&cfg), perf.latency_ms.get())
        };
        BroadcasterStats {
            cpu_usage,
            memory_usage: held as f64 / (1024.0 * 1024.0),
            average_latency_ms,
            client_count: shared.clients.len(),
            frames_streamed: Counters::get(&shared.counters.frames_streamed),
            bytes_transmitted: Counters::get(&shared.counters.bytes_transmitted),
            superseded_frames: Counters::get(&shared.counters.superseded_frames),
            skipped_ticks: Counters::get(&shared.counters.skipped_ticks),
            send_failures: Counters::get(&shared.counters.send_failures),
            backoff_raises: Counters::get(&shared.counters.backoff_raises),
            config: *cfg,
        }
    }

    /// Stops the scheduler, waits for it to exit and closes every client.
    /// Later calls do nothing.
    pub async fn destroy(&self) {
        {
            let _admission = util::lock(&self.shared.admission, "client admission");
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let scheduler = util::lock(&self.scheduler, "stream scheduler").take();
        if let Some(task) = scheduler {
            task.abort();
            let _ = task.await;
        }
        let ids: Vec<String> = self.shared.clients.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.shared.detach(id);
        }
        tracing::info!(clients = ids.len(), "streaming broadcaster destroyed");
    }
}

impl Drop for StreamingBroadcaster {
    fn drop(&mut self) {
        if let Some(task) = util::lock(&self.scheduler, "stream scheduler").take() {
            task.abort();
        }
        for entry in self.shared.clients.iter() {
            entry.value().abort();
        }
    }
}
