use serde::{Deserialize, Serialize};

/// Frames at or below this many bins are sent undecimated.
pub const MIN_DECIMATION_BINS: usize = 512;

/// Peak-hold decimation: each output bin is the maximum of `factor` input bins.
pub fn decimate_peak_hold(powers: &[f32], factor: usize) -> Vec<f32> {
    if factor <= 1 || powers.len() <= MIN_DECIMATION_BINS {
        return powers.to_vec();
    }
    powers
        .chunks(factor)
        .map(|chunk| chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub peak_index: usize,
}

pub fn power_stats(powers: &[f32]) -> PowerStats {
    let Some(&first) = powers.first() else {
        return PowerStats::default();
    };
    let mut out = PowerStats {
        min: first,
        max: first,
        mean: 0.0,
        peak_index: 0,
    };
    let mut sum = 0.0f64;
    for (i, &v) in powers.iter().enumerate() {
        sum += f64::from(v);
        if v < out.min {
            out.min = v;
        }
        if v > out.max {
            out.max = v;
            out.peak_index = i;
        }
    }
    out.mean = (sum / powers.len() as f64) as f32;
    out
}
