use crate::frame::{Acquisition, Frame};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const SYNTHETIC_FFT_SIZE: usize = 1024;
pub const SYNTHETIC_CENTER_FREQUENCY: f64 = 145_000_000.0;
pub const SYNTHETIC_SAMPLE_RATE: f64 = 2_400_000.0;
const NOISE_FLOOR_DB: f32 = -90.0;
const NOISE_SPAN_DB: f32 = 5.0;
const SEED: u64 = 0x5eed_f00d;

struct Carrier {
    /// Position as a fraction of the band.
    position: f32,
    power_db: f32,
    /// Half-width as a fraction of the band.
    width: f32,
}

const CARRIERS: [Carrier; 4] = [
    Carrier {
        position: 0.1,
        power_db: -60.0,
        width: 0.02,
    },
    Carrier {
        position: 0.3,
        power_db: -55.0,
        width: 0.03,
    },
    Carrier {
        position: 0.7,
        power_db: -65.0,
        width: 0.025,
    },
    Carrier {
        position: 0.85,
        power_db: -58.0,
        width: 0.04,
    },
];

/// Deterministic stand-in for the analyzer: a noise floor plus four slowly
/// drifting Gaussian carriers. Two sources built alike produce identical
/// frame sequences.
pub struct SyntheticSource {
    rng: StdRng,
    time: f32,
    seq: u64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::with_seed(SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            time: 0.0,
            seq: 0,
        }
    }

    pub fn next_frame(&mut self) -> Frame {
        let n = SYNTHETIC_FFT_SIZE;
        let mut powers: Vec<f32> = (0..n)
            .map(|_| NOISE_FLOOR_DB + (self.rng.gen::<f32>() - 0.5) * NOISE_SPAN_DB)
            .collect();

        for (idx, c) in CARRIERS.iter().enumerate() {
            let drift = (self.time * 0.1 + idx as f32).sin() * 0.02;
            let centre = ((c.position + drift) * n as f32).floor() as i64;
            let width = ((c.width * n as f32).floor() as i64).max(1);
            let spread = (width * width) as f32 / 4.0;
            for i in -width..=width {
                let bin = centre + i;
                if !(0..n as i64).contains(&bin) {
                    continue;
                }
                let shape = (-((i * i) as f32) / spread).exp();
                let bin = bin as usize;
                let level = NOISE_FLOOR_DB + (c.power_db - NOISE_FLOOR_DB) * shape;
                powers[bin] = powers[bin].max(level);
            }
        }

        self.time += 0.1;
        self.seq += 1;
        let mut frame = Frame::new(
            powers,
            Acquisition {
                center_frequency: SYNTHETIC_CENTER_FREQUENCY,
                sample_rate: SYNTHETIC_SAMPLE_RATE,
            },
        );
        frame.seq = self.seq;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::detect;

    #[test]
    fn same_seed_same_frames() {
        let mut a = SyntheticSource::new();
        let mut b = SyntheticSource::new();
        for _ in 0..5 {
            let fa = a.next_frame();
            let fb = b.next_frame();
            assert_eq!(fa.powers, fb.powers);
            assert_eq!(fa.seq, fb.seq);
        }
    }

    #[test]
    fn sequence_increases_and_size_is_fixed() {
        let mut src = SyntheticSource::new();
        let first = src.next_frame();
        let second = src.next_frame();
        assert_eq!(first.fft_size, SYNTHETIC_FFT_SIZE);
        assert!(second.seq > first.seq);
    }

    #[test]
    fn carriers_stand_out_of_the_floor() {
        let frame = SyntheticSource::new().next_frame();
        let signals = detect(&frame, -70.0);
        assert_eq!(signals.len(), 4);
        let strongest = signals
            .iter()
            .map(|s| s.power_db)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(strongest, -55.0);
    }

    #[test]
    fn carrier_skirts_fall_smoothly_to_the_floor() {
        let frame = SyntheticSource::new().next_frame();
        let peak = frame
            .powers
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0;
        let skirt = &frame.powers[peak..peak + 6];
        assert!(skirt.windows(2).all(|w| w[1] < w[0]));
        assert!(skirt.iter().all(|&p| p > NOISE_FLOOR_DB));
    }
}
