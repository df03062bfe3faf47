//! Quad fitting from gradient clusters.
//!
//! Each cluster is an unordered ring of edge samples around one candidate
//! border. The fitter orders the ring by angle about its centroid, builds
//! prefix line-fit moments so any contiguous arc can be fit in O(1), scores
//! every sample by the fit error of a window centered on it, and picks the
//! four error maxima that bound the straightest sides. Corners fall out of
//! the analytic intersection of adjacent side lines, already sub-pixel.

use crate::cluster::Cluster;
use crate::image::Image8;

/// A candidate quadrilateral in pixel coordinates.
#[derive(Clone, Debug)]
pub struct Quad {
    /// Corners in canonical order: positive shoelace area, `corners[0]`
    /// starting wherever the fit began (the decoder rotates it later).
    pub corners: [[f64; 2]; 4],
    /// True when the gradient winding says light-inside-dark, i.e. the tag
    /// border polarity is inverted.
    pub reversed_border: bool,
}

/// Geometric acceptance thresholds for fitted quads.
#[derive(Clone, Copy, Debug)]
pub struct FitParams {
    /// Minimum edge samples per cluster.
    pub min_cluster_pixels: usize,
    /// Cap on the number of candidate corners fed to the 4-subset search.
    pub max_nmaxima: usize,
    /// Cosine of the critical corner angle; quads with a flatter corner are
    /// rejected.
    pub cos_critical_rad: f64,
    /// Maximum mean squared line-fit error per side.
    pub max_line_fit_mse: f64,
    /// Minimum quad perimeter in pixels.
    pub min_perimeter: f64,
    /// Maximum quad perimeter in pixels.
    pub max_perimeter: f64,
    /// Minimum quad area in square pixels.
    pub min_area: f64,
    /// Maximum bounding-box aspect ratio.
    pub max_aspect_ratio: f64,
}

/// Fit one quad from a cluster of edge samples, or reject it.
pub fn fit_quad(img: &Image8, cluster: &Cluster, params: &FitParams) -> Option<Quad> {
    let n = cluster.points.len();
    if n < params.min_cluster_pixels {
        return None;
    }
    // A plausible border cannot have more samples than the whole image
    // boundary walked twice.
    if n > 6 * (img.width() + img.height()) {
        return None;
    }

    // Centroid and angular ordering (doubled coordinates throughout the
    // moment accumulation; halved when corners are emitted).
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in &cluster.points {
        cx += f64::from(p.x);
        cy += f64::from(p.y);
    }
    cx /= n as f64;
    cy /= n as f64;

    let mut ordered: Vec<&crate::cluster::EdgePoint> = cluster.points.iter().collect();
    ordered.sort_by(|a, b| {
        let ta = (f64::from(a.y) - cy).atan2(f64::from(a.x) - cx);
        let tb = (f64::from(b.y) - cy).atan2(f64::from(b.x) - cx);
        ta.total_cmp(&tb).then_with(|| a.x.cmp(&b.x)).then_with(|| a.y.cmp(&b.y))
    });

    // Border polarity from the gradient winding.
    let mut winding = 0.0;
    for p in &ordered {
        let ox = f64::from(p.x) - cx;
        let oy = f64::from(p.y) - cy;
        winding += ox * f64::from(p.gx) + oy * f64::from(p.gy);
    }
    let reversed_border = winding < 0.0;

    let lfps = compute_moments(img, &ordered);
    let indices = select_corner_indices(&lfps, n, params)?;

    let mut lines = [LineFit::default(); 4];
    for k in 0..4 {
        lines[k] = fit_line(&lfps, indices[k], indices[(k + 1) % 4])?;
        if lines[k].mse > params.max_line_fit_mse {
            return None;
        }
    }

    let mut corners = [[0.0f64; 2]; 4];
    for k in 0..4 {
        let a = &lines[(k + 3) % 4];
        let b = &lines[k];
        let p = line_intersection(a.point, a.dir, b.point, b.dir)?;
        // Back to pixel units from doubled coordinates.
        corners[k] = [p[0] * 0.5, p[1] * 0.5];
    }

    let quad = Quad {
        corners,
        reversed_border,
    };
    accept_geometry(quad, img.width(), img.height(), params)
}

/// Shared geometric acceptance for both quad extractors. Enforces the
/// canonical winding, then applies the area/perimeter/angle filters.
pub(crate) fn accept_geometry(
    mut quad: Quad,
    width: usize,
    height: usize,
    params: &FitParams,
) -> Option<Quad> {
    if polygon_area(&quad.corners) < 0.0 {
        quad.corners.swap(1, 3);
    }
    let c = &quad.corners;

    for p in c {
        if !p[0].is_finite() || !p[1].is_finite() {
            return None;
        }
        if p[0] < -3.0 || p[1] < -3.0 || p[0] > width as f64 + 3.0 || p[1] > height as f64 + 3.0 {
            return None;
        }
    }

    let area = polygon_area(c);
    if area < params.min_area {
        return None;
    }

    let mut perimeter = 0.0;
    for k in 0..4 {
        let dx = c[(k + 1) % 4][0] - c[k][0];
        let dy = c[(k + 1) % 4][1] - c[k][1];
        let len = (dx * dx + dy * dy).sqrt();
        if len < 2.0 {
            return None;
        }
        perimeter += len;
    }
    if perimeter < params.min_perimeter || perimeter > params.max_perimeter {
        return None;
    }

    // Convexity plus the critical-angle bound at every corner.
    for k in 0..4 {
        let prev = c[(k + 3) % 4];
        let here = c[k];
        let next = c[(k + 1) % 4];
        let ax = here[0] - prev[0];
        let ay = here[1] - prev[1];
        let bx = next[0] - here[0];
        let by = next[1] - here[1];
        let cross = ax * by - ay * bx;
        if cross <= 0.0 {
            return None;
        }
        let dot = (ax * bx + ay * by) / ((ax.hypot(ay)) * (bx.hypot(by)));
        if dot.abs() > params.cos_critical_rad {
            return None;
        }
    }

    let (mut xmin, mut ymin, mut xmax, mut ymax) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for p in c {
        xmin = xmin.min(p[0]);
        ymin = ymin.min(p[1]);
        xmax = xmax.max(p[0]);
        ymax = ymax.max(p[1]);
    }
    let bw = (xmax - xmin).max(1e-9);
    let bh = (ymax - ymin).max(1e-9);
    if bw / bh > params.max_aspect_ratio || bh / bw > params.max_aspect_ratio {
        return None;
    }

    Some(quad)
}

// ── Windowed line fitting over the ordered boundary ──

/// Prefix sums of gradient-weighted first and second moments.
#[derive(Clone, Copy, Default)]
struct Moment {
    mx: f64,
    my: f64,
    mxx: f64,
    mxy: f64,
    myy: f64,
    w: f64,
    n: f64,
}

#[derive(Clone, Copy, Default)]
struct LineFit {
    point: [f64; 2],
    dir: [f64; 2],
    err: f64,
    mse: f64,
}

fn compute_moments(img: &Image8, ordered: &[&crate::cluster::EdgePoint]) -> Vec<Moment> {
    let mut lfps = Vec::with_capacity(ordered.len());
    let mut acc = Moment::default();
    let w = img.width();
    let h = img.height();
    for p in ordered {
        let x = f64::from(p.x);
        let y = f64::from(p.y);

        // Weight samples by the local image gradient so texture noise on a
        // side contributes less than the actual edge.
        let px = (p.x / 2) as usize;
        let py = (p.y / 2) as usize;
        let weight = if px >= 1 && px + 1 < w && py >= 1 && py + 1 < h {
            let gx = f64::from(img.pixel(px + 1, py)) - f64::from(img.pixel(px - 1, py));
            let gy = f64::from(img.pixel(px, py + 1)) - f64::from(img.pixel(px, py - 1));
            gx.hypot(gy) + 1.0
        } else {
            1.0
        };

        acc.mx += weight * x;
        acc.my += weight * y;
        acc.mxx += weight * x * x;
        acc.mxy += weight * x * y;
        acc.myy += weight * y * y;
        acc.w += weight;
        acc.n += 1.0;
        lfps.push(acc);
    }
    lfps
}

fn range_moment(lfps: &[Moment], i0: usize, i1: usize) -> Moment {
    let n = lfps.len();
    debug_assert!(i0 != i1);
    let sub = |a: &Moment, b: &Moment| Moment {
        mx: a.mx - b.mx,
        my: a.my - b.my,
        mxx: a.mxx - b.mxx,
        mxy: a.mxy - b.mxy,
        myy: a.myy - b.myy,
        w: a.w - b.w,
        n: a.n - b.n,
    };
    let add = |a: &Moment, b: &Moment| Moment {
        mx: a.mx + b.mx,
        my: a.my + b.my,
        mxx: a.mxx + b.mxx,
        mxy: a.mxy + b.mxy,
        myy: a.myy + b.myy,
        w: a.w + b.w,
        n: a.n + b.n,
    };
    if i0 < i1 {
        if i0 == 0 {
            lfps[i1]
        } else {
            sub(&lfps[i1], &lfps[i0 - 1])
        }
    } else {
        // Wrap around the end of the ring; i0 >= 1 here.
        add(&sub(&lfps[n - 1], &lfps[i0 - 1]), &lfps[i1])
    }
}

/// Total least squares over the arc `[i0, i1]` (cyclic, inclusive).
fn fit_line(lfps: &[Moment], i0: usize, i1: usize) -> Option<LineFit> {
    if i0 == i1 {
        return None;
    }
    let m = range_moment(lfps, i0, i1);
    if m.w <= 0.0 || m.n < 2.0 {
        return None;
    }
    let ex = m.mx / m.w;
    let ey = m.my / m.w;
    let cxx = m.mxx / m.w - ex * ex;
    let cxy = m.mxy / m.w - ex * ey;
    let cyy = m.myy / m.w - ey * ey;

    let half_trace = 0.5 * (cxx + cyy);
    let disc = (0.5 * (cxx - cyy)).hypot(cxy);
    let eig_large = half_trace + disc;
    let eig_small = (half_trace - disc).max(0.0);

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

    Some(LineFit {
        point: [ex, ey],
        dir,
        err: m.n * eig_small,
        mse: eig_small,
    })
}

/// Score every boundary index by the line-fit error of a window centered on
/// it, smooth the scores, and search the maxima for the best 4-subset.
fn select_corner_indices(lfps: &[Moment], n: usize, params: &FitParams) -> Option<[usize; 4]> {
    // Window half-width: about half the sample count of the shortest side
    // of a square border, shrunk for high-aspect tags.
    let ksz = (n / 12).min(20);
    if ksz < 2 {
        return None;
    }

    let mut errs = Vec::with_capacity(n);
    for i in 0..n {
        let i0 = (i + n - ksz) % n;
        let i1 = (i + ksz) % n;
        errs.push(fit_line(lfps, i0, i1).map_or(0.0, |f| f.err));
    }

    // Low-pass the error signal so staircase aliasing does not split one
    // corner into several maxima.
    let sigma = 1.0f64;
    let cutoff = 0.05f64;
    let half = (-cutoff.ln() * 2.0 * sigma * sigma).sqrt() as usize + 1;
    let mut kernel = Vec::with_capacity(2 * half + 1);
    for i in 0..=2 * half {
        let d = i as f64 - half as f64;
        kernel.push((-d * d / (2.0 * sigma * sigma)).exp());
    }
    let smoothed: Vec<f64> = (0..n)
        .map(|i| {
            let mut acc = 0.0;
            for (k, &coeff) in kernel.iter().enumerate() {
                let idx = (i + n + k - half) % n;
                acc += errs[idx] * coeff;
            }
            acc
        })
        .collect();

    let mut maxima: Vec<(usize, f64)> = Vec::new();
    for i in 0..n {
        let prev = smoothed[(i + n - 1) % n];
        let next = smoothed[(i + 1) % n];
        if smoothed[i] > prev && smoothed[i] > next {
            maxima.push((i, smoothed[i]));
        }
    }
    if maxima.len() < 4 {
        return None;
    }

    if maxima.len() > params.max_nmaxima {
        let mut by_err: Vec<f64> = maxima.iter().map(|&(_, e)| e).collect();
        by_err.sort_by(|a, b| b.total_cmp(a));
        let floor = by_err[params.max_nmaxima];
        maxima.retain(|&(_, e)| e > floor);
        if maxima.len() < 4 {
            return None;
        }
    }

    let mut best: Option<[usize; 4]> = None;
    let mut best_err = f64::INFINITY;
    let max_dot = params.cos_critical_rad;

    for m0 in 0..maxima.len() - 3 {
        let i0 = maxima[m0].0;
        for m1 in m0 + 1..maxima.len() - 2 {
            let i1 = maxima[m1].0;
            let Some(line01) = fit_line(lfps, i0, i1) else {
                continue;
            };
            if line01.mse > params.max_line_fit_mse {
                continue;
            }
            for m2 in m1 + 1..maxima.len() - 1 {
                let i2 = maxima[m2].0;
                let Some(line12) = fit_line(lfps, i1, i2) else {
                    continue;
                };
                if line12.mse > params.max_line_fit_mse {
                    continue;
                }
                let dot = line01.dir[0] * line12.dir[0] + line01.dir[1] * line12.dir[1];
                if dot.abs() > max_dot {
                    continue;
                }
                for m3 in m2 + 1..maxima.len() {
                    let i3 = maxima[m3].0;
                    let Some(line23) = fit_line(lfps, i2, i3) else {
                        continue;
                    };
                    if line23.mse > params.max_line_fit_mse {
                        continue;
                    }
                    let Some(line30) = fit_line(lfps, i3, i0) else {
                        continue;
                    };
                    if line30.mse > params.max_line_fit_mse {
                        continue;
                    }
                    let err = line01.err + line12.err + line23.err + line30.err;
                    if err < best_err {
                        best_err = err;
                        best = Some([i0, i1, i2, i3]);
                    }
                }
            }
        }
    }

    if best_err / n as f64 >= params.max_line_fit_mse {
        return None;
    }
    best
}

// ── Small geometric helpers shared with the contour extractor ──

/// Shoelace signed area. Positive for the canonical corner winding.
#[must_use]
pub(crate) fn polygon_area(corners: &[[f64; 2]; 4]) -> f64 {
    let mut area = 0.0;
    for i in 0..4 {
        let j = (i + 1) % 4;
        area += corners[i][0] * corners[j][1] - corners[j][0] * corners[i][1];
    }
    area * 0.5
}

/// Intersection of two parametric lines `p + t * u`.
#[must_use]
pub(crate) fn line_intersection(
    p0: [f64; 2],
    u0: [f64; 2],
    p1: [f64; 2],
    u1: [f64; 2],
) -> Option<[f64; 2]> {
    let det = u1[0] * u0[1] - u0[0] * u1[1];
    if det.abs() < 1e-9 {
        return None;
    }
    let dx = p1[0] - p0[0];
    let dy = p1[1] - p0[1];
    let t = (u1[0] * dy - u1[1] * dx) / det;
    Some([p0[0] + t * u0[0], p0[1] + t * u0[1]])
}

/// Total-least-squares line through a point set: `(centroid, direction)`.
#[must_use]
pub(crate) fn fit_points_line(points: &[[f64; 2]]) -> Option<([f64; 2], [f64; 2])> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let (mut ex, mut ey) = (0.0, 0.0);
    for p in points {
        ex += p[0];
        ey += p[1];
    }
    ex /= n;
    ey /= n;
    let (mut cxx, mut cxy, mut cyy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p[0] - ex;
        let dy = p[1] - ey;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
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
    use crate::segmentation::connected_components;
    use crate::threshold::{DARK, LIGHT};
    use bumpalo::Bump;

    fn default_params(w: usize, h: usize) -> FitParams {
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

    fn dark_square_tri(size: usize, x0: usize, y0: usize, side: usize) -> Image8 {
        let mut img = Image8::new(size, size);
        for y in 0..size {
            img.row_mut(y).fill(LIGHT);
        }
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.set_pixel(x, y, DARK);
            }
        }
        img
    }

    fn gray_of(tri: &Image8) -> Image8 {
        // A matching grayscale image (dark 30, light 220) for moment weights.
        let mut img = Image8::new(tri.width(), tri.height());
        for y in 0..tri.height() {
            for x in 0..tri.width() {
                img.set_pixel(x, y, if tri.pixel(x, y) == DARK { 30 } else { 220 });
            }
        }
        img
    }

    #[test]
    fn fits_axis_aligned_square() {
        let tri = dark_square_tri(96, 24, 24, 48);
        let gray = gray_of(&tri);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let clusters = crate::cluster::gradient_clusters(&tri, &mut uf, 4);
        assert_eq!(clusters.len(), 1);

        let params = default_params(96, 96);
        let quad = fit_quad(&gray, &clusters[0], &params).expect("square should fit");

        assert!(polygon_area(&quad.corners) > 0.0);
        assert!(!quad.reversed_border);

        // All corners within a pixel of the physical square boundary
        // (dark spans columns 24..=71, edges at 23.5 / 71.5).
        for p in &quad.corners {
            let near_x = (p[0] - 23.5).abs() < 1.0 || (p[0] - 71.5).abs() < 1.0;
            let near_y = (p[1] - 23.5).abs() < 1.0 || (p[1] - 71.5).abs() < 1.0;
            assert!(near_x && near_y, "corner {p:?} off the square outline");
        }
    }

    #[test]
    fn light_square_on_dark_is_reversed_border() {
        let mut tri = Image8::new(96, 96);
        for y in 0..96 {
            tri.row_mut(y).fill(DARK);
        }
        for y in 30..66 {
            for x in 30..66 {
                tri.set_pixel(x, y, LIGHT);
            }
        }
        let gray = gray_of(&tri);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let clusters = crate::cluster::gradient_clusters(&tri, &mut uf, 4);
        let params = default_params(96, 96);
        let quad = fit_quad(&gray, &clusters[0], &params).expect("square should fit");
        assert!(quad.reversed_border);
    }

    #[test]
    fn undersized_cluster_is_rejected() {
        let tri = dark_square_tri(32, 14, 14, 3);
        let gray = gray_of(&tri);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let clusters = crate::cluster::gradient_clusters(&tri, &mut uf, 2);
        let params = default_params(32, 32);
        for c in &clusters {
            assert!(fit_quad(&gray, c, &params).is_none());
        }
    }

    #[test]
    fn intersection_of_perpendicular_lines() {
        let p = line_intersection([0.0, 5.0], [1.0, 0.0], [3.0, 0.0], [0.0, 1.0]).unwrap();
        assert!((p[0] - 3.0).abs() < 1e-12);
        assert!((p[1] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn parallel_lines_do_not_intersect() {
        assert!(line_intersection([0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 0.0]).is_none());
    }

    #[test]
    fn fit_points_line_recovers_diagonal() {
        let pts: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, i as f64]).collect();
        let (point, dir) = fit_points_line(&pts).unwrap();
        assert!((point[0] - 4.5).abs() < 1e-9);
        assert!((dir[0].abs() - dir[1].abs()).abs() < 1e-9);
    }
}
