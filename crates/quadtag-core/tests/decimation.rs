#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use quadtag_core::test_utils::render_tag_image;
use quadtag_core::{Detector, DetectorConfig, ImageView, TagFamily};

fn detect_with_decimation(data: &[u8], size: usize, factor: f32) -> Vec<quadtag_core::Detection> {
    let img = ImageView::new(data, size, size, size).unwrap();
    let config = DetectorConfig::builder().quad_decimate(factor).build();
    let mut detector = Detector::with_config(config).unwrap();
    detector.add_family_by_name("tag36h11").unwrap();
    detector.detect(&img).unwrap()
}

/// Decimation may cost precision, never the detection itself; corners must
/// agree with the full-resolution result to within half the factor.
#[test]
fn corners_agree_across_decimation_factors() {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let (data, _) = render_tag_image(&family, 3, 240, 512);

    let full = detect_with_decimation(&data, 512, 1.0);
    assert_eq!(full.len(), 1);

    for factor in [2.0f32, 3.0] {
        let decimated = detect_with_decimation(&data, 512, factor);
        assert_eq!(decimated.len(), 1, "factor {factor}");
        assert_eq!(decimated[0].id, 3);
        for (a, b) in decimated[0].corners.iter().zip(&full[0].corners) {
            let d = (a[0] - b[0]).hypot(a[1] - b[1]);
            assert!(
                d <= 0.5 * f64::from(factor) + 1e-9,
                "factor {factor}: corner drifted {d} px"
            );
        }
    }
}

#[test]
fn decimated_centers_stay_put() {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let (data, _) = render_tag_image(&family, 3, 240, 512);
    let full = detect_with_decimation(&data, 512, 1.0);
    let half = detect_with_decimation(&data, 512, 2.0);
    let d = (full[0].center[0] - half[0].center[0]).hypot(full[0].center[1] - half[0].center[1]);
    assert!(d < 1.0, "center drifted {d} px");
}

#[test]
fn small_tags_survive_moderate_decimation() {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let (data, _) = render_tag_image(&family, 0, 160, 512);
    let detections = detect_with_decimation(&data, 512, 2.0);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].hamming, 0);
}
