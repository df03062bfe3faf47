#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use quadtag_core::test_utils::{add_gaussian_noise, render_tag_into};
use quadtag_core::{Detection, Detector, DetectorConfig, ImageView, TagFamily};

fn busy_scene() -> (Vec<u8>, usize) {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let canvas = 640;
    let mut data = vec![255u8; canvas * canvas];
    render_tag_into(&mut data, canvas, &family, 0, 20, 40, 40);
    render_tag_into(&mut data, canvas, &family, 11, 16, 420, 60);
    render_tag_into(&mut data, canvas, &family, 29, 22, 80, 380);
    add_gaussian_noise(&mut data, 6.0, 0xC0FFEE);
    (data, canvas)
}

fn run(nthreads: usize) -> Vec<Detection> {
    let (data, canvas) = busy_scene();
    let img = ImageView::new(&data, canvas, canvas, canvas).unwrap();
    let config = DetectorConfig::builder().nthreads(nthreads).build();
    let mut detector = Detector::with_config(config).unwrap();
    detector.add_family_by_name("tag36h11").unwrap();
    detector.detect(&img).unwrap()
}

fn assert_bitwise_equal(a: &[Detection], b: &[Detection]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.id, y.id);
        assert_eq!(x.hamming, y.hamming);
        assert_eq!(x.decision_margin.to_bits(), y.decision_margin.to_bits());
        assert_eq!(x.goodness.to_bits(), y.goodness.to_bits());
        for (p, q) in x.corners.iter().zip(&y.corners) {
            assert_eq!(p[0].to_bits(), q[0].to_bits());
            assert_eq!(p[1].to_bits(), q[1].to_bits());
        }
        assert_eq!(x.center[0].to_bits(), y.center[0].to_bits());
        assert_eq!(x.center[1].to_bits(), y.center[1].to_bits());
        for (r, s) in x.homography.iter().zip(&y.homography) {
            for (u, v) in r.iter().zip(s) {
                assert_eq!(u.to_bits(), v.to_bits());
            }
        }
    }
}

/// The emitted list must be bitwise identical for any worker count.
#[test]
fn results_do_not_depend_on_thread_count() {
    let single = run(1);
    assert!(single.len() >= 3, "scene lost tags: {single:?}");
    for nthreads in [2, 4, 8] {
        let parallel = run(nthreads);
        assert_bitwise_equal(&single, &parallel);
    }
}

/// Repeated calls on one detector instance are stable (arena reuse must
/// not leak state between calls).
#[test]
fn repeated_calls_are_stable() {
    let (data, canvas) = busy_scene();
    let img = ImageView::new(&data, canvas, canvas, canvas).unwrap();
    let mut detector = Detector::new();
    detector.add_family_by_name("tag36h11").unwrap();
    let first = detector.detect(&img).unwrap();
    for _ in 0..3 {
        let again = detector.detect(&img).unwrap();
        assert_bitwise_equal(&first, &again);
    }
}
