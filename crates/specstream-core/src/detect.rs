//! Threshold peak detection over one frame.
//!
//! A candidate is a local maximum (a run of equal bins counts once, reported at
//! its centre) strictly above the threshold. A frame sitting flat at exactly the
//! threshold is one signal covering the band. Candidates are accepted strongest
//! first; a weaker candidate inside an accepted signal's -3 dB span is ripple
//! on that signal and is dropped.

use crate::frame::Frame;
use serde::Serialize;

/// Half-power drop used for bandwidth estimation.
pub const BANDWIDTH_DROP_DB: f64 = 3.0;

/// Margin above threshold at which the margin part of the confidence saturates.
pub const CONFIDENCE_FULL_SCALE_DB: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub bin_index: usize,
    pub frequency_hz: f64,
    pub power_db: f64,
    pub bandwidth_hz: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    bin: usize,
    power: f64,
}

pub fn detect(frame: &Frame, threshold_db: f64) -> Vec<Signal> {
    let powers = &frame.powers;
    if powers.is_empty() || !threshold_db.is_finite() {
        return Vec::new();
    }

    let mut candidates = find_candidates(powers, threshold_db);
    candidates.sort_by(|a, b| b.power.total_cmp(&a.power).then(a.bin.cmp(&b.bin)));

    let n = powers.len();
    let bin_width = frame.sample_rate / n as f64;
    let mut accepted: Vec<(Signal, usize, usize)> = Vec::new();
    for c in candidates {
        if accepted
            .iter()
            .any(|(_, left, right)| (*left..=*right).contains(&c.bin))
        {
            continue;
        }
        let (left, right) = half_power_span(powers, c.bin, c.power);
        let span_bins = right - left + 1;
        accepted.push((
            Signal {
                bin_index: c.bin,
                frequency_hz: bin_frequency(frame.center_frequency, bin_width, n, c.bin),
                power_db: c.power,
                bandwidth_hz: span_bins as f64 * bin_width,
                confidence: confidence(c.power - threshold_db, span_bins, n),
            },
            left,
            right,
        ));
    }

    let mut signals: Vec<Signal> = accepted.into_iter().map(|(s, _, _)| s).collect();
    signals.sort_by_key(|s| s.bin_index);
    signals
}

fn find_candidates(powers: &[f32], threshold_db: f64) -> Vec<Candidate> {
    let n = powers.len();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < n {
        let v = powers[i];
        let mut j = i;
        while j + 1 < n && powers[j + 1] == v {
            j += 1;
        }

        let left_lower = i == 0 || powers[i - 1] < v;
        let right_lower = j == n - 1 || powers[j + 1] < v;
        let power = f64::from(v);
        let whole_band = i == 0 && j == n - 1;
        let qualifies = power > threshold_db || (whole_band && power == threshold_db);
        if left_lower && right_lower && qualifies {
            out.push(Candidate {
                bin: i + (j - i) / 2,
                power,
            });
        }
        i = j + 1;
    }
    out
}

/// Inclusive bin bounds where power stays within 3 dB of the peak.
fn half_power_span(powers: &[f32], bin: usize, peak: f64) -> (usize, usize) {
    let floor = peak - BANDWIDTH_DROP_DB;
    let mut left = bin;
    while left > 0 && f64::from(powers[left - 1]) >= floor {
        left -= 1;
    }
    let mut right = bin;
    while right + 1 < powers.len() && f64::from(powers[right + 1]) >= floor {
        right += 1;
    }
    (left, right)
}

/// Bin 0 is the most negative offset; bin `fft_size / 2` is the centre frequency.
pub fn bin_frequency(center_frequency: f64, bin_width: f64, fft_size: usize, bin: usize) -> f64 {
    let offset = bin as f64 - (fft_size / 2) as f64;
    center_frequency + offset * bin_width
}

/// `min(margin / 40 dB, 1) * (0.75 + 0.25 * isolation)`, isolation being the
/// share of the band the signal does not occupy.
pub fn confidence(margin_db: f64, span_bins: usize, fft_size: usize) -> f64 {
    let margin = (margin_db.max(0.0) / CONFIDENCE_FULL_SCALE_DB).min(1.0);
    let isolation = if fft_size == 0 {
        0.0
    } else {
        1.0 - (span_bins as f64 / fft_size as f64).min(1.0)
    };
    (margin * (0.75 + 0.25 * isolation)).clamp(0.0, 1.0)
}
