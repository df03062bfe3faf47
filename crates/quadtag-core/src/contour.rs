//! Contour-based quad extraction.
//!
//! Alternative front end to the gradient-cluster path: dark components are
//! boundary-traced with a Moore-neighbourhood walk, each closed boundary is
//! simplified to exactly four corners by iterative farthest-point
//! insertion, and the result is accepted when the boundary hugs the
//! four-sided polyline tightly enough. Corners are then sharpened by
//! fitting a line to the boundary run of each side and intersecting
//! adjacent side lines.

use std::collections::HashSet;

use crate::image::Image8;
use crate::quad::{accept_geometry, fit_points_line, line_intersection, FitParams, Quad};
use crate::segmentation::UnionFind;
use crate::threshold::DARK;

/// Largest boundary length traced before a component is abandoned.
const MAX_BOUNDARY: usize = 20_000;

/// Fraction of the boundary diameter tolerated as residual between the
/// boundary and the simplified quad.
const RESIDUAL_FRAC: f64 = 0.12;

/// Boundary samples dropped on each side of a corner before line fitting,
/// where the trace bends and pollutes the fit.
const CORNER_TRIM: usize = 2;

/// Extract quads by tracing and simplifying dark component boundaries.
pub fn contour_quads(
    tri: &Image8,
    uf: &mut UnionFind<'_>,
    min_component: u32,
    params: &FitParams,
) -> Vec<Quad> {
    let w = tri.width();
    let h = tri.height();
    let mut seen: HashSet<u32> = HashSet::new();
    let mut quads = Vec::new();

    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            if tri.pixel(x, y) != DARK {
                continue;
            }
            let idx = (y * w + x) as u32;
            let root = uf.find(idx);
            if !seen.insert(root) {
                continue;
            }
            if uf.set_size(idx) < min_component {
                continue;
            }
            // First dark pixel of the component in scan order: its outer
            // boundary starts here.
            let boundary = trace_boundary(tri, uf, root, x, y);
            if boundary.len() < params.min_cluster_pixels {
                continue;
            }
            let Some(corner_idx) = simplify_to_quad(&boundary) else {
                continue;
            };
            let Some(quad) = corners_from_boundary(&boundary, corner_idx) else {
                continue;
            };
            if let Some(quad) = accept_geometry(quad, w, h, params) {
                quads.push(quad);
            }
        }
    }
    quads
}

/// Moore-neighbourhood clockwise walk along the component boundary.
fn trace_boundary(
    tri: &Image8,
    uf: &mut UnionFind<'_>,
    root: u32,
    start_x: usize,
    start_y: usize,
) -> Vec<[f64; 2]> {
    const DX: [i32; 8] = [0, 1, 1, 1, 0, -1, -1, -1];
    const DY: [i32; 8] = [-1, -1, 0, 1, 1, 1, 0, -1];
    let w = tri.width();
    let h = tri.height();

    let mut points = Vec::new();
    let mut cx = start_x;
    let mut cy = start_y;
    let mut enter = 6; // came from the left

    loop {
        points.push([cx as f64, cy as f64]);
        let mut advanced = false;
        for i in 0..8 {
            let dir = (enter + 1 + i) % 8;
            let nx = cx as i32 + DX[dir];
            let ny = cy as i32 + DY[dir];
            if nx < 0 || ny < 0 || nx >= w as i32 || ny >= h as i32 {
                continue;
            }
            let nidx = (ny as usize * w + nx as usize) as u32;
            if tri.pixel(nx as usize, ny as usize) == DARK && uf.find(nidx) == root {
                cx = nx as usize;
                cy = ny as usize;
                enter = (dir + 4) % 8;
                advanced = true;
                break;
            }
        }
        if !advanced
            || (cx == start_x && cy == start_y && points.len() > 2)
            || points.len() > MAX_BOUNDARY
        {
            break;
        }
    }
    points
}

/// Reduce a closed boundary to four corner indices by farthest-point
/// insertion: seed with two antipodal extrema, then repeatedly insert the
/// boundary point farthest from the current polyline until four corners
/// remain. Returns `None` when the residual says the shape is not a quad.
fn simplify_to_quad(boundary: &[[f64; 2]]) -> Option<[usize; 4]> {
    let n = boundary.len();
    if n < 8 {
        return None;
    }

    let ia = farthest_from(boundary, boundary[0]);
    let ib = farthest_from(boundary, boundary[ia]);
    let diameter = dist(boundary[ia], boundary[ib]);
    if diameter < 4.0 {
        return None;
    }

    let mut corners: Vec<usize> = if ia < ib { vec![ia, ib] } else { vec![ib, ia] };
    while corners.len() < 4 {
        let mut best_d = -1.0;
        let mut best_idx = 0;
        let mut insert_at = 0;
        for (slot, &(c0, c1)) in chord_pairs(&corners).iter().enumerate() {
            if let Some((idx, d)) = farthest_in_arc(boundary, c0, c1) {
                if d > best_d {
                    best_d = d;
                    best_idx = idx;
                    insert_at = slot + 1;
                }
            }
        }
        if best_d <= 0.0 {
            return None;
        }
        if insert_at == corners.len() {
            corners.push(best_idx);
        } else {
            corners.insert(insert_at, best_idx);
        }
    }

    // Residual gate: every boundary point must lie close to its chord.
    let tol = RESIDUAL_FRAC * diameter;
    for &(c0, c1) in chord_pairs(&corners).iter() {
        if let Some((_, d)) = farthest_in_arc(boundary, c0, c1) {
            if d > tol {
                return None;
            }
        }
    }

    Some([corners[0], corners[1], corners[2], corners[3]])
}

/// Consecutive corner pairs including the closing wrap.
fn chord_pairs(corners: &[usize]) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(corners.len());
    for i in 0..corners.len() {
        out.push((corners[i], corners[(i + 1) % corners.len()]));
    }
    out
}

fn farthest_from(boundary: &[[f64; 2]], origin: [f64; 2]) -> usize {
    let mut best = 0;
    let mut best_d = -1.0;
    for (i, p) in boundary.iter().enumerate() {
        let d = dist(*p, origin);
        if d > best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Farthest boundary point from the chord `c0 -> c1`, searching the cyclic
/// arc strictly between the two corners.
fn farthest_in_arc(boundary: &[[f64; 2]], c0: usize, c1: usize) -> Option<(usize, f64)> {
    let n = boundary.len();
    let a = boundary[c0];
    let b = boundary[c1];
    let mut best: Option<(usize, f64)> = None;
    let mut i = (c0 + 1) % n;
    while i != c1 {
        let d = perpendicular_distance(boundary[i], a, b);
        if best.map_or(true, |(_, bd)| d > bd) {
            best = Some((i, d));
        }
        i = (i + 1) % n;
    }
    best
}

fn perpendicular_distance(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let mag = dx.hypot(dy);
    if mag < 1e-9 {
        return dist(p, a);
    }
    ((dy * p[0] - dx * p[1] + b[0] * a[1] - b[1] * a[0]).abs()) / mag
}

fn dist(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// Sharpen corners by fitting each side's boundary run and intersecting
/// adjacent side lines.
fn corners_from_boundary(boundary: &[[f64; 2]], corner_idx: [usize; 4]) -> Option<Quad> {
    let n = boundary.len();
    let mut lines = [([0.0f64; 2], [0.0f64; 2]); 4];

    for k in 0..4 {
        let c0 = corner_idx[k];
        let c1 = corner_idx[(k + 1) % 4];
        let len = (c1 + n - c0) % n;
        if len <= 2 * CORNER_TRIM + 2 {
            return None;
        }
        let mut side = Vec::with_capacity(len);
        let mut i = (c0 + CORNER_TRIM) % n;
        let stop = (c1 + n - CORNER_TRIM) % n;
        while i != stop {
            side.push(boundary[i]);
            i = (i + 1) % n;
        }
        lines[k] = fit_points_line(&side)?;
    }

    let mut corners = [[0.0f64; 2]; 4];
    for k in 0..4 {
        let (p0, u0) = lines[(k + 3) % 4];
        let (p1, u1) = lines[k];
        let p = line_intersection(p0, u0, p1, u1)?;
        // The intersection must stay near the traced corner.
        if dist(p, boundary[corner_idx[k]]) > 6.0 {
            return None;
        }
        corners[k] = p;
    }

    Some(Quad {
        corners,
        reversed_border: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::connected_components;
    use crate::threshold::LIGHT;
    use bumpalo::Bump;

    fn params(w: usize, h: usize) -> FitParams {
        FitParams {
            min_cluster_pixels: 24,
            max_nmaxima: 10,
            cos_critical_rad: (10.0f64).to_radians().cos(),
            max_line_fit_mse: 10.0,
            min_perimeter: 24.0,
            max_perimeter: 4.0 * (w + h) as f64,
            min_area: 64.0,
            max_aspect_ratio: 10.0,
        }
    }

    fn scene(size: usize, draw: impl Fn(usize, usize) -> bool) -> Image8 {
        let mut tri = Image8::new(size, size);
        for y in 0..size {
            for x in 0..size {
                tri.set_pixel(x, y, if draw(x, y) { DARK } else { LIGHT });
            }
        }
        tri
    }

    #[test]
    fn traces_and_simplifies_square() {
        let tri = scene(96, |x, y| (24..72).contains(&x) && (24..72).contains(&y));
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let quads = contour_quads(&tri, &mut uf, 16, &params(96, 96));
        assert_eq!(quads.len(), 1);
        for p in &quads[0].corners {
            let near_x = (p[0] - 24.0).abs() < 1.5 || (p[0] - 71.0).abs() < 1.5;
            let near_y = (p[1] - 24.0).abs() < 1.5 || (p[1] - 71.0).abs() < 1.5;
            assert!(near_x && near_y, "corner {p:?} off the square outline");
        }
    }

    #[test]
    fn rejects_disc() {
        let tri = scene(96, |x, y| {
            let dx = x as f64 - 48.0;
            let dy = y as f64 - 48.0;
            dx * dx + dy * dy < 28.0 * 28.0
        });
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let quads = contour_quads(&tri, &mut uf, 16, &params(96, 96));
        assert!(quads.is_empty(), "a disc must not pass the residual gate");
    }

    #[test]
    fn rejects_thin_bar() {
        let tri = scene(96, |x, y| (8..88).contains(&x) && (46..50).contains(&y));
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let quads = contour_quads(&tri, &mut uf, 16, &params(96, 96));
        assert!(quads.is_empty());
    }

    #[test]
    fn rotated_square_survives() {
        // 45-degree diamond.
        let tri = scene(96, |x, y| {
            let dx = (x as i32 - 48).abs();
            let dy = (y as i32 - 48).abs();
            dx + dy <= 30
        });
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let quads = contour_quads(&tri, &mut uf, 16, &params(96, 96));
        assert_eq!(quads.len(), 1);
    }
}
