use divan::bench;
use quadtag_core::families::{rotate90, TagFamily};

fn main() {
    divan::main();
}

#[bench]
fn exact_lookup(bencher: divan::Bencher) {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let codes: Vec<u64> = (0..family.len() as u16)
        .map(|id| family.code(id).unwrap())
        .collect();
    bencher.bench_local(move || {
        let mut hits = 0usize;
        for &c in &codes {
            if family.decode(c, 0).is_some() {
                hits += 1;
            }
        }
        hits
    });
}

#[bench(args = [1, 3, 5])]
fn hamming_scan(bencher: divan::Bencher, errors: u32) {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let corrupted: Vec<u64> = (0..family.len() as u16)
        .map(|id| {
            let mut c = family.code(id).unwrap();
            for bit in 0..errors {
                c ^= 1 << (bit * 7);
            }
            c
        })
        .collect();
    bencher.bench_local(move || {
        let mut hits = 0usize;
        for &c in &corrupted {
            if family.decode(c, family.max_correctable()).is_some() {
                hits += 1;
            }
        }
        hits
    });
}

#[bench]
fn rotate_grid(bencher: divan::Bencher) {
    let family = TagFamily::for_name("tag36h11").unwrap();
    let code = family.code(0).unwrap();
    bencher.bench_local(move || rotate90(rotate90(code, 6), 6));
}
