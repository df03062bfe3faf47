//! Homography fitting and payload decoding.
//!
//! The decoder projects the payload grid of a candidate quad into the
//! image, classifies every cell against the local adaptive threshold,
//! validates the border ring polarity, and matches the packed bits against
//! the family codebook in all four rotations.
//!
//! Canonical tag coordinates span `[-1, 1]` across the full tag including
//! the border ring; grid cell `(i, j)` of the `(d + 2b)`-wide grid has its
//! center at `(-1 + (2i + 1) / (d + 2b), -1 + (2j + 1) / (d + 2b))`.

use multiversion::multiversion;
use nalgebra::{SMatrix, SVector};

use crate::families::{rotate90, TagFamily};
use crate::image::ImageView;
use crate::quad::Quad;
use crate::threshold::TileGrid;

/// Fraction of border cells that must carry the expected polarity.
const BORDER_MATCH_RATIO: f64 = 0.75;

/// A 3x3 projective transform from canonical tag space to image pixels.
pub struct Homography {
    /// The matrix itself.
    pub h: SMatrix<f64, 3, 3>,
}

impl Homography {
    /// Fit the homography mapping 4 source points onto 4 destination
    /// points via the direct linear transform. Returns `None` for
    /// degenerate correspondences.
    #[must_use]
    pub fn from_pairs(src: &[[f64; 2]; 4], dst: &[[f64; 2]; 4]) -> Option<Self> {
        let mut m = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for i in 0..4 {
            let sx = src[i][0];
            let sy = src[i][1];
            let dx = dst[i][0];
            let dy = dst[i][1];

            m[(i * 2, 0)] = -sx;
            m[(i * 2, 1)] = -sy;
            m[(i * 2, 2)] = -1.0;
            m[(i * 2, 6)] = sx * dx;
            m[(i * 2, 7)] = sy * dx;
            b[i * 2] = -dx;

            m[(i * 2 + 1, 3)] = -sx;
            m[(i * 2 + 1, 4)] = -sy;
            m[(i * 2 + 1, 5)] = -1.0;
            m[(i * 2 + 1, 6)] = sx * dy;
            m[(i * 2 + 1, 7)] = sy * dy;
            b[i * 2 + 1] = -dy;
        }

        m.lu().solve(&b).and_then(|v| {
            let mut h = SMatrix::<f64, 3, 3>::identity();
            h[(0, 0)] = v[0];
            h[(0, 1)] = v[1];
            h[(0, 2)] = v[2];
            h[(1, 0)] = v[3];
            h[(1, 1)] = v[4];
            h[(1, 2)] = v[5];
            h[(2, 0)] = v[6];
            h[(2, 1)] = v[7];
            h[(2, 2)] = 1.0;
            let out = Self { h };
            for i in 0..4 {
                let p = out.project(src[i]);
                let err = (p[0] - dst[i][0]).powi(2) + (p[1] - dst[i][1]).powi(2);
                if !err.is_finite() || err > 1e-4 {
                    return None;
                }
            }
            Some(out)
        })
    }

    /// Fit the homography from the canonical square
    /// `(-1,-1), (1,-1), (1,1), (-1,1)` to a quad's corners.
    #[must_use]
    pub fn square_to_quad(dst: &[[f64; 2]; 4]) -> Option<Self> {
        const SRC: [[f64; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];
        Self::from_pairs(&SRC, dst)
    }

    /// Project a canonical point into the image.
    #[must_use]
    pub fn project(&self, p: [f64; 2]) -> [f64; 2] {
        let v = self.h * SVector::<f64, 3>::new(p[0], p[1], 1.0);
        [v[0] / v[2], v[1] / v[2]]
    }

    /// Row-major copy of the matrix.
    #[must_use]
    pub fn to_array(&self) -> [[f64; 3]; 3] {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.h[(r, c)];
            }
        }
        out
    }
}

/// Adaptive threshold lookup shared with the thresholder.
///
/// Tile statistics live at post-decimation resolution; `scale` maps
/// full-resolution sample positions back onto the tile grid.
pub struct ThresholdLookup<'a> {
    grid: &'a TileGrid,
    scale: f64,
}

impl<'a> ThresholdLookup<'a> {
    /// Wrap a tile grid computed on an image downscaled by `scale`.
    #[must_use]
    pub fn new(grid: &'a TileGrid, scale: f64) -> Self {
        Self { grid, scale }
    }

    fn threshold_at(&self, x: f64, y: f64) -> Option<f64> {
        self.grid.threshold_at(x / self.scale, y / self.scale)
    }
}

/// Result of decoding one quad against one family.
#[derive(Clone, Debug)]
pub struct Decoded {
    /// Codeword index within the family.
    pub id: u32,
    /// Bit errors corrected.
    pub hamming: u32,
    /// Clockwise quarter turns between the quad's corner 0 and the tag's
    /// canonical top-left.
    pub rotation: u8,
    /// Soft-decision separation between the matched codeword and the best
    /// non-matching one.
    pub decision_margin: f64,
    /// Payload contrast under the matched codeword; opaque quality score.
    pub goodness: f64,
}

/// Decode a quad. Returns `None` when the projection leaves the image,
/// the border polarity disagrees, or no codeword matches within the
/// family's correction radius.
pub fn decode_quad(
    img: &ImageView<'_>,
    quad: &Quad,
    family: &TagFamily,
    thresholds: &ThresholdLookup<'_>,
    refine_decode: bool,
) -> Option<Decoded> {
    let h = Homography::square_to_quad(&quad.corners)?;
    let mut best = decode_with_offset(img, &h, family, thresholds, [0.0, 0.0])?;

    // When the nominal grid needed correction, a one-pixel nudge of every
    // sample center sometimes lands cleanly on the true cell interiors.
    if refine_decode && best.hamming > 0 {
        for dy in [-1.0, 0.0, 1.0] {
            for dx in [-1.0, 0.0, 1.0] {
                if dx == 0.0 && dy == 0.0 {
                    continue;
                }
                if let Some(candidate) = decode_with_offset(img, &h, family, thresholds, [dx, dy])
                {
                    if candidate.id == best.id && candidate.hamming < best.hamming {
                        best = candidate;
                    }
                }
            }
        }
    }
    Some(best)
}

fn decode_with_offset(
    img: &ImageView<'_>,
    h: &Homography,
    family: &TagFamily,
    thresholds: &ThresholdLookup<'_>,
    offset: [f64; 2],
) -> Option<Decoded> {
    let d = family.dim;
    let b = family.border;
    let total = d + b * 2;
    let ncells = total * total;

    // Canonical centers of the whole (d + 2b)^2 grid: payload cells for
    // the codeword, ring cells for the border polarity test.
    let mut points = Vec::with_capacity(ncells);
    for gy in 0..total {
        for gx in 0..total {
            points.push((
                -1.0 + (2.0 * gx as f64 + 1.0) / total as f64,
                -1.0 + (2.0 * gy as f64 + 1.0) / total as f64,
            ));
        }
    }
    let mut intensities = vec![0.0f64; ncells];
    let mut positions = vec![[0.0f64; 2]; ncells];
    if !sample_grid_values(img, h, &points, offset, &mut intensities, &mut positions) {
        return None;
    }

    // Threshold fallback for samples landing on low-contrast tiles: an
    // Otsu split of everything sampled under this quad.
    let fallback = otsu_threshold(&intensities);
    let cell_threshold = |idx: usize| {
        let [x, y] = positions[idx];
        thresholds.threshold_at(x, y).unwrap_or(fallback)
    };
    let in_payload = |gx: usize, gy: usize| gx >= b && gx < b + d && gy >= b && gy < b + d;

    // Reversed families carry a light ring instead of the usual dark one.
    let expected_light = family.reversed_border;
    let mut ring_cells = 0usize;
    let mut border_matches = 0usize;
    for gy in 0..total {
        for gx in 0..total {
            if in_payload(gx, gy) {
                continue;
            }
            let idx = gy * total + gx;
            ring_cells += 1;
            if (intensities[idx] > cell_threshold(idx)) == expected_light {
                border_matches += 1;
            }
        }
    }
    if (border_matches as f64) < BORDER_MATCH_RATIO * ring_cells as f64 {
        return None;
    }

    let n = d * d;
    let mut bits = 0u64;
    let mut cell_intensities = [0.0f64; 64];
    let mut cell_thresholds = [0.0f64; 64];
    let mut i = 0usize;
    for gy in b..b + d {
        for gx in b..b + d {
            let idx = gy * total + gx;
            let t = cell_threshold(idx);
            cell_intensities[i] = intensities[idx];
            cell_thresholds[i] = t;
            if intensities[idx] > t {
                bits |= 1 << i;
            }
            i += 1;
        }
    }

    let (id, hamming, rotation) = family.decode(bits, family.max_correctable())?;

    let matched = {
        let mut code = family.code(id)?;
        for _ in 0..rotation {
            code = rotate90(code, d);
        }
        code
    };
    let matched_penalty = soft_penalty(matched, &cell_intensities[..n], &cell_thresholds[..n]);
    let mut best_other = f64::INFINITY;
    for &(code, other_id, _) in family.rotated_codes() {
        if other_id == id {
            continue;
        }
        let p = soft_penalty(code, &cell_intensities[..n], &cell_thresholds[..n]);
        if p < best_other {
            best_other = p;
        }
    }
    let decision_margin = if best_other.is_finite() {
        (best_other - matched_penalty).max(0.0)
    } else {
        matched_penalty.max(0.0)
    };

    // Contrast between the cells the codeword says are light and dark.
    let mut sum_light = 0.0;
    let mut n_light = 0usize;
    let mut sum_dark = 0.0;
    let mut n_dark = 0usize;
    for (i, &intensity) in cell_intensities[..n].iter().enumerate() {
        if (matched >> i) & 1 != 0 {
            sum_light += intensity;
            n_light += 1;
        } else {
            sum_dark += intensity;
            n_dark += 1;
        }
    }
    let goodness = if n_light > 0 && n_dark > 0 {
        (sum_light / n_light as f64 - sum_dark / n_dark as f64).max(0.0)
    } else {
        0.0
    };

    Some(Decoded {
        id: u32::from(id),
        hamming,
        rotation,
        decision_margin,
        goodness,
    })
}

/// Project every canonical grid point through the homography and sample
/// the grayscale bilinearly, recording intensities and image positions.
/// Returns `false` as soon as any sample leaves the interpolable area.
#[multiversion(targets(
    "x86_64+avx2+bmi1+bmi2+popcnt+lzcnt",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn sample_grid_values<'a>(
    img: &ImageView<'a>,
    h: &Homography,
    points: &[(f64, f64)],
    offset: [f64; 2],
    intensities: &mut [f64],
    positions: &mut [[f64; 2]],
) -> bool {
    let h00 = h.h[(0, 0)];
    let h01 = h.h[(0, 1)];
    let h02 = h.h[(0, 2)];
    let h10 = h.h[(1, 0)];
    let h11 = h.h[(1, 1)];
    let h12 = h.h[(1, 2)];
    let h20 = h.h[(2, 0)];
    let h21 = h.h[(2, 1)];
    let h22 = h.h[(2, 2)];

    let w_limit = (img.width - 1) as f64;
    let h_limit = (img.height - 1) as f64;

    for (i, &(u, v)) in points.iter().enumerate() {
        let wz = h20 * u + h21 * v + h22;
        let x = (h00 * u + h01 * v + h02) / wz + offset[0];
        let y = (h10 * u + h11 * v + h12) / wz + offset[1];
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 || x >= w_limit || y >= h_limit
        {
            return false;
        }

        let xf = x.floor();
        let yf = y.floor();
        let ix = xf as usize;
        let iy = yf as usize;
        let dx = x - xf;
        let dy = y - yf;

        // SAFETY: bounds checked above; ix + 1 and iy + 1 stay in range.
        let val = unsafe {
            let r0 = img.row_unchecked(iy);
            let r1 = img.row_unchecked(iy + 1);
            let v00 = f64::from(*r0.get_unchecked(ix));
            let v10 = f64::from(*r0.get_unchecked(ix + 1));
            let v01 = f64::from(*r1.get_unchecked(ix));
            let v11 = f64::from(*r1.get_unchecked(ix + 1));
            let top = v00 + dx * (v10 - v00);
            let bot = v01 + dx * (v11 - v01);
            top + dy * (bot - top)
        };
        intensities[i] = val;
        positions[i] = [x, y];
    }
    true
}

/// Sum of `|intensity - threshold|` over the cells where the observed bit
/// disagrees with `code`.
fn soft_penalty(code: u64, intensities: &[f64], thresholds: &[f64]) -> f64 {
    let mut penalty = 0.0;
    for (i, (&intensity, &t)) in intensities.iter().zip(thresholds).enumerate() {
        let observed = intensity > t;
        let expected = (code >> i) & 1 != 0;
        if observed != expected {
            penalty += (intensity - t).abs();
        }
    }
    penalty
}

/// Threshold maximizing inter-class variance over a small sample set.
fn otsu_threshold(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 127.5;
    }
    let n = values.len() as f64;
    let total: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    if max - min < 1.0 {
        return f64::midpoint(min, max);
    }

    let mut best_t = f64::midpoint(min, max);
    let mut best_var = 0.0;
    for i in 1..16 {
        let t = min + (max - min) * f64::from(i) / 16.0;
        let mut w0 = 0.0;
        let mut sum0 = 0.0;
        for &v in values {
            if v <= t {
                w0 += 1.0;
                sum0 += v;
            }
        }
        let w1 = n - w0;
        if w0 < 1.0 || w1 < 1.0 {
            continue;
        }
        let m0 = sum0 / w0;
        let m1 = (total - sum0) / w1;
        let var = w0 * w1 * (m0 - m1) * (m0 - m1);
        if var > best_var {
            best_var = var;
            best_t = t;
        }
    }
    best_t
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dlt_reproduces_corner_mapping() {
        let src = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let dst = [[10.0, 10.0], [20.0, 11.0], [19.0, 21.0], [9.0, 20.0]];
        let h = Homography::from_pairs(&src, &dst).unwrap();
        for i in 0..4 {
            let p = h.project(src[i]);
            assert!((p[0] - dst[i][0]).abs() < 1e-6);
            assert!((p[1] - dst[i][1]).abs() < 1e-6);
        }
    }

    #[test]
    fn square_to_quad_centers_at_projection_of_origin() {
        let dst = [[100.0, 100.0], [200.0, 100.0], [200.0, 200.0], [100.0, 200.0]];
        let h = Homography::square_to_quad(&dst).unwrap();
        let c = h.project([0.0, 0.0]);
        assert!((c[0] - 150.0).abs() < 1e-9);
        assert!((c[1] - 150.0).abs() < 1e-9);
    }

    #[test]
    fn collinear_corners_are_rejected() {
        let dst = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        assert!(Homography::square_to_quad(&dst).is_none());
    }

    #[test]
    fn soft_penalty_counts_only_disagreements() {
        // observed bits from (intensity > threshold): 1, 0, 1
        let intensities = [200.0, 50.0, 180.0];
        let thresholds = [127.0, 127.0, 127.0];
        assert_eq!(soft_penalty(0b101, &intensities, &thresholds), 0.0);
        // code 0b010 disagrees everywhere
        let p = soft_penalty(0b010, &intensities, &thresholds);
        assert!((p - (73.0 + 77.0 + 53.0)).abs() < 1e-9);
    }

    #[test]
    fn otsu_splits_bimodal_samples() {
        let values = [10.0, 12.0, 8.0, 240.0, 235.0, 250.0];
        let t = otsu_threshold(&values);
        assert!(t > 20.0 && t < 230.0);
    }

    proptest! {
        #[test]
        fn homography_roundtrips_random_quads(
            jitter in prop::collection::vec(-20.0..20.0f64, 8)
        ) {
            let dst = [
                [100.0 + jitter[0], 100.0 + jitter[1]],
                [300.0 + jitter[2], 100.0 + jitter[3]],
                [300.0 + jitter[4], 300.0 + jitter[5]],
                [100.0 + jitter[6], 300.0 + jitter[7]],
            ];
            if let Some(h) = Homography::square_to_quad(&dst) {
                let canonical = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];
                for i in 0..4 {
                    let p = h.project(canonical[i]);
                    prop_assert!((p[0] - dst[i][0]).abs() < 1e-6);
                    prop_assert!((p[1] - dst[i][1]).abs() < 1e-6);
                }
            }
        }
    }
}
