//! Gradient-guided edge refinement.
//!
//! Quad corners out of the fitter are limited by the threshold image's
//! quantization. This pass re-fits each side against the full-resolution
//! grayscale: the gradient is probed along the edge normal at a handful of
//! stations, the strongest response localizes the true edge sub-pixel, and
//! the corners are recomputed from the intersections of the refitted side
//! lines.

use crate::image::ImageView;
use crate::quad::line_intersection;

/// Stations probed along each edge.
const EDGE_SAMPLES: usize = 10;
/// Normal search half-range in pixels.
const NORMAL_RANGE: f64 = 3.0;
/// Normal search step in pixels.
const NORMAL_STEP: f64 = 0.5;
/// Minimum gradient magnitude for a station to vote.
const MIN_GRADIENT: f64 = 5.0;
/// A refined corner may move at most this far from the original. Wide
/// enough to undo the worst-case localization error of a 3x decimation.
const MAX_CORNER_SHIFT: f64 = 3.0;

/// Refine the quad's corners in place against the image gradient.
///
/// Sides that do not produce enough strong gradient stations keep their
/// original line; corners whose refined intersection drifts too far are
/// left untouched.
pub fn refine_edges(img: &ImageView<'_>, corners: &mut [[f64; 2]; 4]) {
    let mut lines: [([f64; 2], [f64; 2]); 4] = Default::default();

    for k in 0..4 {
        let p0 = corners[k];
        let p1 = corners[(k + 1) % 4];
        let dx = p1[0] - p0[0];
        let dy = p1[1] - p0[1];
        let len = dx.hypot(dy);
        // Fallback: the side as currently known.
        lines[k] = (p0, [dx / len.max(1e-9), dy / len.max(1e-9)]);
        if len < 4.0 {
            continue;
        }
        let nx = -dy / len;
        let ny = dx / len;

        let mut stations: Vec<([f64; 2], f64)> = Vec::with_capacity(EDGE_SAMPLES);
        for s in 1..=EDGE_SAMPLES {
            let t = s as f64 / (EDGE_SAMPLES + 1) as f64;
            let bx = p0[0] + dx * t;
            let by = p0[1] + dy * t;

            // Walk the normal, scoring the gradient component across the
            // edge; a parabolic fit of the best step gives sub-pixel.
            let mut best_offset = 0.0;
            let mut best_mag = 0.0;
            let mut prev_mag = 0.0;
            let mut next_mag = 0.0;
            let steps = (2.0 * NORMAL_RANGE / NORMAL_STEP) as i32;
            for i in 0..=steps {
                let offset = -NORMAL_RANGE + f64::from(i) * NORMAL_STEP;
                let g = img.sample_gradient_bilinear(bx + nx * offset, by + ny * offset);
                let mag = (g[0] * nx + g[1] * ny).abs();
                if mag > best_mag {
                    best_mag = mag;
                    best_offset = offset;
                    prev_mag = if i > 0 {
                        let go = img.sample_gradient_bilinear(
                            bx + nx * (offset - NORMAL_STEP),
                            by + ny * (offset - NORMAL_STEP),
                        );
                        (go[0] * nx + go[1] * ny).abs()
                    } else {
                        mag
                    };
                    next_mag = {
                        let go = img.sample_gradient_bilinear(
                            bx + nx * (offset + NORMAL_STEP),
                            by + ny * (offset + NORMAL_STEP),
                        );
                        (go[0] * nx + go[1] * ny).abs()
                    };
                }
            }
            if best_mag < MIN_GRADIENT {
                continue;
            }
            let denom = prev_mag - 2.0 * best_mag + next_mag;
            let sub = if denom.abs() > 1e-9 {
                (0.5 * (prev_mag - next_mag) / denom).clamp(-0.5, 0.5) * NORMAL_STEP
            } else {
                0.0
            };
            let offset = best_offset + sub;
            stations.push(([bx + nx * offset, by + ny * offset], best_mag));
        }

        if stations.len() < EDGE_SAMPLES / 2 {
            continue;
        }
        if let Some(line) = weighted_line(&stations) {
            lines[k] = line;
        }
    }

    for k in 0..4 {
        let (p0, u0) = lines[(k + 3) % 4];
        let (p1, u1) = lines[k];
        if let Some(p) = line_intersection(p0, u0, p1, u1) {
            let shift = (p[0] - corners[k][0]).hypot(p[1] - corners[k][1]);
            if shift <= MAX_CORNER_SHIFT {
                corners[k] = p;
            }
        }
    }
}

/// Gradient-magnitude-weighted total least squares through the stations.
fn weighted_line(stations: &[([f64; 2], f64)]) -> Option<([f64; 2], [f64; 2])> {
    let mut w_sum = 0.0;
    let mut ex = 0.0;
    let mut ey = 0.0;
    for &(p, w) in stations {
        w_sum += w;
        ex += w * p[0];
        ey += w * p[1];
    }
    if w_sum <= 0.0 {
        return None;
    }
    ex /= w_sum;
    ey /= w_sum;

    let (mut cxx, mut cxy, mut cyy) = (0.0, 0.0, 0.0);
    for &(p, w) in stations {
        let dx = p[0] - ex;
        let dy = p[1] - ey;
        cxx += w * dx * dx;
        cxy += w * dx * dy;
        cyy += w * dy * dy;
    }
    let half_trace = 0.5 * (cxx + cyy);
    let disc = (0.5 * (cxx - cyy)).hypot(cxy);
    let eig_large = half_trace + disc;
    let dir = if cxy.abs() > 1e-12 {
        let vx = cxy;
        let vy = eig_large - cxx;
        let norm = vx.hypot(vy);
        [vx / norm, vy / norm]
    } else if cxx >= cyy {
        [1.0, 0.0]
    } else {
        [0.0, 1.0]
    };
    Some(([ex, ey], dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image8;

    /// Dark square on light ground.
    fn square_image(size: usize, x0: f64, x1: f64) -> Image8 {
        let mut img = Image8::new(size, size);
        for y in 0..size {
            for x in 0..size {
                let fx = x as f64;
                let fy = y as f64;
                let inside =
                    fx > x0 && fx < x1 && fy > x0 && fy < x1;
                img.set_pixel(x, y, if inside { 20 } else { 235 });
            }
        }
        img
    }

    #[test]
    fn corners_converge_toward_the_physical_edge() {
        let img = square_image(128, 31.0, 96.0);
        // Physical edges at 31.5 and 95.5; start corners perturbed by ~1px.
        let mut corners: [[f64; 2]; 4] = [
            [32.4, 32.3],
            [94.7, 32.6],
            [94.6, 94.5],
            [32.5, 94.4],
        ];
        let before: Vec<f64> = corners
            .iter()
            .flat_map(|p| {
                [
                    (p[0] - 31.5).abs().min((p[0] - 95.5).abs()),
                    (p[1] - 31.5).abs().min((p[1] - 95.5).abs()),
                ]
            })
            .collect();
        refine_edges(&img.as_view(), &mut corners);
        let after: Vec<f64> = corners
            .iter()
            .flat_map(|p| {
                [
                    (p[0] - 31.5).abs().min((p[0] - 95.5).abs()),
                    (p[1] - 31.5).abs().min((p[1] - 95.5).abs()),
                ]
            })
            .collect();
        let before_sum: f64 = before.iter().sum();
        let after_sum: f64 = after.iter().sum();
        assert!(
            after_sum < before_sum,
            "refinement should reduce corner error: {before_sum} -> {after_sum}"
        );
    }

    #[test]
    fn flat_image_leaves_corners_alone() {
        let mut img = Image8::new(64, 64);
        for y in 0..64 {
            img.row_mut(y).fill(120);
        }
        let mut corners = [[10.0, 10.0], [50.0, 10.0], [50.0, 50.0], [10.0, 50.0]];
        let original = corners;
        refine_edges(&img.as_view(), &mut corners);
        for (a, b) in corners.iter().zip(&original) {
            assert!((a[0] - b[0]).abs() < 1e-9);
            assert!((a[1] - b[1]).abs() < 1e-9);
        }
    }
}
