//! Synthetic scene generation for tests and benchmarks.
//!
//! Renders any registered family/id onto a white canvas with a quiet zone,
//! optionally under a projective warp or with seeded sensor noise, and
//! returns ground-truth corner positions for accuracy metrics. Corner
//! positions use the pixel-center convention: the boundary between pixel
//! columns `x - 1` and `x` lies at `x - 0.5`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::decoder::Homography;
use crate::families::TagFamily;

/// Cell color of the rendered tag grid, `(gx, gy)` over the full
/// `(dim + 2 * border)` grid including the border ring.
#[must_use]
pub fn tag_cell_color(family: &TagFamily, id: u16, gx: usize, gy: usize) -> u8 {
    let d = family.dim;
    let b = family.border;
    let total = d + 2 * b;
    debug_assert!(gx < total && gy < total);
    let in_payload = gx >= b && gx < b + d && gy >= b && gy < b + d;
    if !in_payload {
        return if family.reversed_border { 255 } else { 0 };
    }
    let code = family.code(id).expect("id within family");
    let bit = (code >> ((gy - b) * d + (gx - b))) & 1;
    if bit != 0 {
        255
    } else {
        0
    }
}

/// Draw `id` into an existing canvas with its top-left grid corner at
/// `(ox, oy)`, using `cell` pixels per grid cell. Returns the ground-truth
/// outer corners in canonical order (top-left first).
pub fn render_tag_into(
    data: &mut [u8],
    canvas_size: usize,
    family: &TagFamily,
    id: u16,
    cell: usize,
    ox: usize,
    oy: usize,
) -> [[f64; 2]; 4] {
    let total = family.dim + 2 * family.border;
    let actual = cell * total;
    assert!(ox + actual <= canvas_size && oy + actual <= canvas_size);

    for gy in 0..total {
        for gx in 0..total {
            let color = tag_cell_color(family, id, gx, gy);
            for dy in 0..cell {
                for dx in 0..cell {
                    let x = ox + gx * cell + dx;
                    let y = oy + gy * cell + dy;
                    data[y * canvas_size + x] = color;
                }
            }
        }
    }

    let x0 = ox as f64 - 0.5;
    let y0 = oy as f64 - 0.5;
    let x1 = (ox + actual) as f64 - 0.5;
    let y1 = (oy + actual) as f64 - 0.5;
    [[x0, y0], [x1, y0], [x1, y1], [x0, y1]]
}

/// Render `id` centered on a white canvas.
///
/// `tag_size` is the nominal tag side in pixels (rounded down to a whole
/// number of cells). Returns the pixel buffer and the ground-truth outer
/// corners in canonical order (top-left first).
#[must_use]
pub fn render_tag_image(
    family: &TagFamily,
    id: u16,
    tag_size: usize,
    canvas_size: usize,
) -> (Vec<u8>, [[f64; 2]; 4]) {
    let mut data = vec![255u8; canvas_size * canvas_size];
    let total = family.dim + 2 * family.border;
    let cell = (tag_size / total).max(1);
    let actual = cell * total;
    let margin = (canvas_size - actual) / 2;
    let corners = render_tag_into(&mut data, canvas_size, family, id, cell, margin, margin);
    (data, corners)
}

/// Render `id` warped so its outer corners land on `dst` (canonical
/// order). Pixels outside the tag stay white.
#[must_use]
pub fn render_warped_tag_image(
    family: &TagFamily,
    id: u16,
    dst: &[[f64; 2]; 4],
    canvas_size: usize,
) -> Vec<u8> {
    let mut data = vec![255u8; canvas_size * canvas_size];
    let h = Homography::square_to_quad(dst).expect("destination corners form a proper quad");
    let inv = h
        .h
        .try_inverse()
        .expect("homography of a proper quad is invertible");
    let total = family.dim + 2 * family.border;

    for y in 0..canvas_size {
        for x in 0..canvas_size {
            let p = inv * nalgebra::Vector3::new(x as f64, y as f64, 1.0);
            let u = p[0] / p[2];
            let v = p[1] / p[2];
            if u <= -1.0 || u >= 1.0 || v <= -1.0 || v >= 1.0 {
                continue;
            }
            let gx = (((u + 1.0) * 0.5) * total as f64) as usize;
            let gy = (((v + 1.0) * 0.5) * total as f64) as usize;
            data[y * canvas_size + x] =
                tag_cell_color(family, id, gx.min(total - 1), gy.min(total - 1));
        }
    }
    data
}

/// Add seeded Gaussian noise in place, clamping to the byte range.
pub fn add_gaussian_noise(data: &mut [u8], sigma: f32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, sigma).expect("sigma must be positive");
    for v in data {
        let noisy = f32::from(*v) + normal.sample(&mut rng);
        *v = noisy.clamp(0.0, 255.0) as u8;
    }
}

/// Rotate a square image 90 degrees clockwise.
#[must_use]
pub fn rotate_image_cw(data: &[u8], size: usize) -> Vec<u8> {
    let mut out = vec![0u8; data.len()];
    for y in 0..size {
        for x in 0..size {
            // (x, y) lands at (size - 1 - y, x).
            out[x * size + (size - 1 - y)] = data[y * size + x];
        }
    }
    out
}

/// Tile an image 2x2, returning the doubled-size buffer.
#[must_use]
pub fn tile_2x2(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height * 4];
    let out_w = width * 2;
    for y in 0..height * 2 {
        for x in 0..out_w {
            out[y * out_w + x] = data[(y % height) * width + (x % width)];
        }
    }
    out
}

/// Mean distance between detected and ground-truth corners, index-aligned.
#[must_use]
pub fn corner_error_aligned(detected: &[[f64; 2]; 4], truth: &[[f64; 2]; 4]) -> f64 {
    let mut sum = 0.0;
    for (d, g) in detected.iter().zip(truth) {
        sum += (d[0] - g[0]).hypot(d[1] - g[1]);
    }
    sum / 4.0
}

/// Mean corner distance minimized over the four cyclic shifts; useful when
/// the orientation under test is not the point.
#[must_use]
pub fn corner_error_any_rotation(detected: &[[f64; 2]; 4], truth: &[[f64; 2]; 4]) -> f64 {
    let mut best = f64::MAX;
    for shift in 0..4 {
        let mut sum = 0.0;
        for i in 0..4 {
            let d = detected[(i + shift) % 4];
            sum += (d[0] - truth[i][0]).hypot(d[1] - truth[i][1]);
        }
        best = best.min(sum / 4.0);
    }
    best
}
