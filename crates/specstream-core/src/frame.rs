use crate::error::DecodeError;
use bytes::Buf;
use serde::Serialize;

/// Power reported for bins whose magnitude is zero, negative or not finite.
///
/// Lies below the weakest reading an f32 magnitude can carry (the smallest
/// subnormal maps to about -897 dB), so it never collides with a real bin.
pub const POWER_FLOOR_DB: f32 = -1000.0;

/// Acquisition parameters active when a buffer arrives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acquisition {
    pub center_frequency: f64,
    pub sample_rate: f64,
}

/// One spectrum snapshot.
///
/// `powers.len() == fft_size` always holds. A frame that failed to decode has
/// no powers, `fft_size == 0` and `decode_error` set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    /// Ingestion order. Strictly increasing for frames accepted by one analyzer
    /// (or produced by one synthetic source); this is the ordering key.
    pub seq: u64,
    pub captured_at_ms: u64,
    pub powers: Vec<f32>,
    pub center_frequency: f64,
    pub sample_rate: f64,
    pub fft_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<DecodeError>,
}

impl Frame {
    pub fn new(powers: Vec<f32>, acq: Acquisition) -> Self {
        Self {
            seq: 0,
            captured_at_ms: now_ms(),
            fft_size: powers.len(),
            powers,
            center_frequency: acq.center_frequency,
            sample_rate: acq.sample_rate,
            decode_error: None,
        }
    }

    fn failed(err: DecodeError, acq: Acquisition) -> Self {
        Self {
            decode_error: Some(err),
            ..Self::new(Vec::new(), acq)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.decode_error.is_none() && !self.powers.is_empty()
    }

    pub fn bin_width_hz(&self) -> f64 {
        if self.fft_size == 0 {
            return 0.0;
        }
        self.sample_rate / self.fft_size as f64
    }

    pub fn heap_bytes(&self) -> usize {
        self.powers.capacity() * std::mem::size_of::<f32>()
    }
}

/// Decodes little-endian f32 linear magnitudes into a dB frame.
///
/// Never fails: malformed input produces an empty frame carrying the error.
pub fn decode(buffer: &[u8], acq: Acquisition) -> Frame {
    if buffer.is_empty() {
        return Frame::failed(DecodeError::Empty, acq);
    }
    if buffer.len() % 4 != 0 {
        return Frame::failed(DecodeError::Misaligned { len: buffer.len() }, acq);
    }

    let mut buf = buffer;
    let mut powers = Vec::with_capacity(buffer.len() / 4);
    while buf.has_remaining() {
        powers.push(magnitude_to_db(buf.get_f32_le()));
    }
    Frame::new(powers, acq)
}

pub fn magnitude_to_db(magnitude: f32) -> f32 {
    if !magnitude.is_finite() || magnitude <= 0.0 {
        return POWER_FLOOR_DB;
    }
    20.0 * magnitude.log10()
}

pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
