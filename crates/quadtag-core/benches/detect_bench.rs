use divan::bench;
use quadtag_core::test_utils::{add_gaussian_noise, render_tag_into};
use quadtag_core::{Detector, DetectorConfig, ImageView, TagFamily};

fn main() {
    divan::main();
}

fn scene(canvas: usize) -> Vec<u8> {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let mut data = vec![255u8; canvas * canvas];
    render_tag_into(&mut data, canvas, &family, 0, canvas / 40, canvas / 8, canvas / 8);
    render_tag_into(&mut data, canvas, &family, 42, canvas / 48, canvas / 2, canvas / 2);
    add_gaussian_noise(&mut data, 4.0, 1);
    data
}

#[bench(args = [640, 1280])]
fn full_detect(bencher: divan::Bencher, canvas: usize) {
    let data = scene(canvas);
    let mut detector = Detector::new();
    detector.add_family_by_name("tag36h11").unwrap();
    bencher.bench_local(move || {
        let img = ImageView::new(&data, canvas, canvas, canvas).unwrap();
        detector.detect(&img).unwrap().len()
    });
}

#[bench]
fn full_detect_decimated(bencher: divan::Bencher) {
    let canvas = 1280;
    let data = scene(canvas);
    let config = DetectorConfig::builder().quad_decimate(2.0).build();
    let mut detector = Detector::with_config(config).unwrap();
    detector.add_family_by_name("tag36h11").unwrap();
    bencher.bench_local(move || {
        let img = ImageView::new(&data, canvas, canvas, canvas).unwrap();
        detector.detect(&img).unwrap().len()
    });
}

#[bench(args = [1, 4])]
fn full_detect_threaded(bencher: divan::Bencher, nthreads: usize) {
    let canvas = 1280;
    let data = scene(canvas);
    let config = DetectorConfig::builder().nthreads(nthreads).build();
    let mut detector = Detector::with_config(config).unwrap();
    detector.add_family_by_name("tag36h11").unwrap();
    bencher.bench_local(move || {
        let img = ImageView::new(&data, canvas, canvas, canvas).unwrap();
        detector.detect(&img).unwrap().len()
    });
}
