use specstream_core::detect::{bin_frequency, detect};
use specstream_core::frame::{Acquisition, Frame};

const CENTER: f64 = 145_000_000.0;
const RATE: f64 = 2_400_000.0;

fn frame_of(powers: Vec<f32>) -> Frame {
    Frame::new(
        powers,
        Acquisition {
            center_frequency: CENTER,
            sample_rate: RATE,
        },
    )
}

fn three_carriers() -> Frame {
    let mut p = vec![-90.0f32; 1024];
    p[256] = -60.0;
    p[257] = -62.0;
    p[258] = -65.0;
    p[512] = -55.0;
    p[513] = -56.0;
    p[514] = -58.0;
    p[768] = -65.0;
    p[769] = -66.0;
    p[770] = -68.0;
    frame_of(p)
}

#[test]
fn finds_each_carrier_once() {
    let signals = detect(&three_carriers(), -70.0);
    let bins: Vec<usize> = signals.iter().map(|s| s.bin_index).collect();
    assert_eq!(bins, vec![256, 512, 768]);
    let powers: Vec<f64> = signals.iter().map(|s| s.power_db).collect();
    assert_eq!(powers, vec![-60.0, -55.0, -65.0]);
}

#[test]
fn threshold_is_exclusive() {
    let signals = detect(&three_carriers(), -60.0);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].bin_index, 512);
    assert_eq!(signals[0].power_db, -55.0);
}

#[test]
fn high_threshold_finds_nothing() {
    assert!(detect(&three_carriers(), -40.0).is_empty());
}

#[test]
fn centre_bin_maps_to_centre_frequency() {
    let signals = detect(&three_carriers(), -70.0);
    let centre = signals.iter().find(|s| s.bin_index == 512).unwrap();
    assert_eq!(centre.frequency_hz, CENTER);

    let bin_width = RATE / 1024.0;
    let low = signals.iter().find(|s| s.bin_index == 256).unwrap();
    assert_eq!(low.frequency_hz, CENTER - 256.0 * bin_width);
    assert_eq!(bin_frequency(CENTER, bin_width, 1024, 0), CENTER - RATE / 2.0);
}

#[test]
fn bandwidth_covers_the_half_power_span() {
    let signals = detect(&three_carriers(), -70.0);
    let centre = signals.iter().find(|s| s.bin_index == 512).unwrap();
    assert_eq!(centre.bandwidth_hz, 3.0 * RATE / 1024.0);
}

#[test]
fn stronger_margin_means_higher_confidence() {
    let signals = detect(&three_carriers(), -70.0);
    let by_bin = |b: usize| signals.iter().find(|s| s.bin_index == b).unwrap().confidence;
    assert!(by_bin(512) > by_bin(256));
    assert!(by_bin(256) > by_bin(768));
    assert!(signals.iter().all(|s| (0.0..=1.0).contains(&s.confidence)));
}

#[test]
fn flat_frame_at_threshold_is_one_wideband_signal() {
    let signals = detect(&frame_of(vec![-70.0; 64]), -70.0);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].bin_index, 31);
    assert_eq!(signals[0].bandwidth_hz, RATE);
    assert_eq!(signals[0].confidence, 0.0);
}

#[test]
fn flat_frame_below_threshold_is_quiet() {
    assert!(detect(&frame_of(vec![-90.0; 64]), -70.0).is_empty());
}

#[test]
fn error_frames_have_no_signals() {
    let frame = specstream_core::frame::decode(
        &[1, 2, 3],
        Acquisition {
            center_frequency: CENTER,
            sample_rate: RATE,
        },
    );
    assert!(detect(&frame, -200.0).is_empty());
}
