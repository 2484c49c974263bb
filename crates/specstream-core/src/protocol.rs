//! Downstream wire format.
//!
//! Binary messages carry one frame: a one-byte header followed by a CBOR
//! [`FramePacket`], either raw (`PACKET_RAW`) or as the next chunk of a zstd
//! stream (`PACKET_ZSTD`). The zstd stream restarts whenever a client goes from
//! raw to compressed packets. Text messages are JSON [`ServerMessage`]s out and
//! [`ClientCommand`]s in.

use crate::analyzer::{AnalyzerStatus, SignalStats};
use crate::broadcaster::BroadcasterStats;
use crate::codec::zstd_stream::ZstdStreamDecoder;
use crate::config::{AnalyzerConfig, PerformanceMode, SourceMode, StreamerConfig};
use crate::detect::Signal;
use crate::dsp::{decimate_peak_hold, power_stats, PowerStats};
use crate::frame::Frame;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PACKET_RAW: u8 = 0;
pub const PACKET_ZSTD: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePacket {
    pub seq: u64,
    pub captured_at_ms: u64,
    pub center_frequency: f64,
    pub sample_rate: f64,
    /// Bin count of the source frame, before decimation.
    pub fft_size: usize,
    pub decimation: usize,
    pub source: SourceMode,
    pub stats: PowerStats,
    /// Little-endian f32 dB values, one per sent bin.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl FramePacket {
    pub fn from_frame(frame: &Frame, decimation: usize, source: SourceMode) -> Self {
        let powers = decimate_peak_hold(&frame.powers, decimation);
        let effective = if powers.len() == frame.powers.len() {
            1
        } else {
            decimation
        };
        let mut data = Vec::with_capacity(powers.len() * 4);
        for p in &powers {
            data.put_f32_le(*p);
        }
        Self {
            seq: frame.seq,
            captured_at_ms: frame.captured_at_ms,
            center_frequency: frame.center_frequency,
            sample_rate: frame.sample_rate,
            fft_size: frame.fft_size,
            decimation: effective,
            source,
            stats: power_stats(&powers),
            data,
        }
    }

    pub fn powers(&self) -> Vec<f32> {
        let mut buf = &self.data[..];
        let mut out = Vec::with_capacity(buf.len() / 4);
        while buf.remaining() >= 4 {
            out.push(buf.get_f32_le());
        }
        out
    }

    pub fn to_cbor(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }
}

/// Client-side decoder for binary frame messages.
#[derive(Default)]
pub struct PacketDecoder {
    zstd: Option<ZstdStreamDecoder>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, msg: &[u8]) -> anyhow::Result<FramePacket> {
        let (&kind, body) = msg
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty frame message"))?;
        let cbor = match kind {
            PACKET_RAW => {
                self.zstd = None;
                body.to_vec()
            }
            PACKET_ZSTD => self
                .zstd
                .get_or_insert_with(ZstdStreamDecoder::new)
                .decompress(body)?,
            other => anyhow::bail!("unknown frame message kind {other}"),
        };
        Ok(serde_cbor::from_slice(&cbor)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Reply with a status snapshot now.
    Status,
    /// Analyzer config patch.
    Config { config: Value },
    /// Streamer config patch.
    Streamer { config: Value },
    Signals {
        #[serde(default)]
        threshold: Option<f64>,
    },
    #[serde(rename = "signal_stats")]
    SignalStats,
    /// Per-client performance mode; `null` follows the global mode again.
    Performance {
        #[serde(default)]
        mode: Option<PerformanceMode>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StreamConfig {
        streaming_rate_hz: f64,
        decimation: usize,
        compression: bool,
        performance_mode: PerformanceMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_mode: Option<PerformanceMode>,
        source_mode: SourceMode,
    },
    Status {
        analyzer: AnalyzerStatus,
        stream: BroadcasterStats,
    },
    Config {
        config: AnalyzerConfig,
    },
    Streamer {
        config: StreamerConfig,
    },
    Signals {
        signals: Vec<Signal>,
        count: usize,
        threshold: f64,
        timestamp_ms: u64,
    },
    SignalStats {
        stats: SignalStats,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn stream_config(cfg: &StreamerConfig, client_mode: Option<PerformanceMode>) -> Self {
        ServerMessage::StreamConfig {
            streaming_rate_hz: cfg.streaming_rate_hz,
            decimation: cfg.decimation_for(client_mode),
            compression: cfg.compression_enabled,
            performance_mode: cfg.performance_mode,
            client_mode,
            source_mode: cfg.source_mode,
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        json_string(self)
    }
}

pub fn json_string<T: Serialize>(v: &T) -> String {
    match serde_json::to_string(v) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = ?e, "failed to serialize json value");
            "{}".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::zstd_stream::ZstdStreamEncoder;
    use crate::frame::Acquisition;

    fn frame() -> Frame {
        let mut powers = vec![-90.0f32; 1024];
        powers[700] = -42.5;
        let mut f = Frame::new(
            powers,
            Acquisition {
                center_frequency: 145e6,
                sample_rate: 2.4e6,
            },
        );
        f.seq = 7;
        f
    }

    #[test]
    fn packet_carries_decimated_powers() {
        let pkt = FramePacket::from_frame(&frame(), 4, SourceMode::Live);
        assert_eq!(pkt.decimation, 4);
        assert_eq!(pkt.fft_size, 1024);
        let powers = pkt.powers();
        assert_eq!(powers.len(), 256);
        assert_eq!(powers[175], -42.5);
        assert_eq!(pkt.stats.max, -42.5);
        assert_eq!(pkt.stats.peak_index, 175);
    }

    #[test]
    fn decoder_reads_raw_then_compressed_messages() {
        let pkt = FramePacket::from_frame(&frame(), 1, SourceMode::Synthetic);
        let cbor = pkt.to_cbor().unwrap();
        let mut dec = PacketDecoder::new();

        let mut raw = vec![PACKET_RAW];
        raw.extend_from_slice(&cbor);
        assert_eq!(dec.decode(&raw).unwrap(), pkt);

        let mut enc = ZstdStreamEncoder::new(3).unwrap();
        for _ in 0..3 {
            let mut msg = vec![PACKET_ZSTD];
            enc.compress_flush_into(&cbor, &mut msg).unwrap();
            assert_eq!(dec.decode(&msg).unwrap(), pkt);
        }
    }

    #[test]
    fn unknown_message_kind_is_an_error() {
        let mut dec = PacketDecoder::new();
        assert!(dec.decode(&[9, 1, 2]).is_err());
        assert!(dec.decode(&[]).is_err());
    }

    #[test]
    fn client_commands_parse() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"signals","threshold":-60}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Signals { threshold: Some(t) } if t == -60.0));
        let cmd: ClientCommand = serde_json::from_str(r#"{"cmd":"status"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Status));
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"performance","mode":"quality"}"#).unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::Performance {
                mode: Some(PerformanceMode::Quality)
            }
        ));
    }
}
