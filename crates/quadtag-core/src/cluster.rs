//! Gradient clustering of DARK/LIGHT boundaries.
//!
//! Wherever a dark pixel touches a light pixel, the half-pixel midpoint
//! between them is an edge sample carrying the dark-to-light direction.
//! Samples are grouped by the identity of the two components they sit
//! between, so every (dark component, light component) contact produces one
//! cluster. A tag border generates exactly one such cluster per side of the
//! contact: the candidate input for quad fitting.
//!
//! Edge sample coordinates are stored doubled so the half-pixel midpoints
//! stay integral.

use std::collections::HashMap;

use crate::image::Image8;
use crate::segmentation::UnionFind;
use crate::threshold::{LIGHT, SKIP};

/// One boundary sample in doubled pixel coordinates.
#[derive(Clone, Copy, Debug)]
pub struct EdgePoint {
    /// Doubled x coordinate of the midpoint.
    pub x: u16,
    /// Doubled y coordinate of the midpoint.
    pub y: u16,
    /// Dark-to-light direction, x component (-1, 0 or 1).
    pub gx: i8,
    /// Dark-to-light direction, y component (-1, 0 or 1).
    pub gy: i8,
}

/// All edge samples between one dark and one light component.
pub struct Cluster {
    /// Samples in scan order.
    pub points: Vec<EdgePoint>,
}

/// Offsets probed from each pixel: right, down, down-left, down-right.
/// The two diagonals keep staircase edges in one cluster.
const OFFSETS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 1), (1, 1)];

/// Collect gradient clusters from the threshold image and component roots.
///
/// Components smaller than `min_component` pixels are ignored on either
/// side of the boundary; this drops single-pixel speckle before the more
/// expensive fitting stages. The returned clusters are in a deterministic
/// order (scan order of their first sample).
pub fn gradient_clusters(
    tri: &Image8,
    uf: &mut UnionFind<'_>,
    min_component: u32,
) -> Vec<Cluster> {
    let w = tri.width();
    let h = tri.height();
    let mut map: HashMap<u64, Vec<EdgePoint>> = HashMap::new();

    for y in 0..h.saturating_sub(1) {
        let row = tri.row(y);
        for x in 0..w {
            let v0 = row[x];
            if v0 == SKIP {
                continue;
            }
            let idx0 = (y * w + x) as u32;
            for (dx, dy) in OFFSETS {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx < 0 || nx >= w as i32 || ny >= h as i32 {
                    continue;
                }
                let v1 = tri.pixel(nx as usize, ny as usize);
                // One DARK and one LIGHT; anything else is not an edge.
                if u16::from(v0) + u16::from(v1) != 255 {
                    continue;
                }
                let idx1 = (ny as usize * w + nx as usize) as u32;
                if uf.set_size(idx0) < min_component || uf.set_size(idx1) < min_component {
                    continue;
                }
                let (dark, light) = if v1 == LIGHT {
                    (uf.find(idx0), uf.find(idx1))
                } else {
                    (uf.find(idx1), uf.find(idx0))
                };
                let key = (u64::from(dark) << 32) | u64::from(light);

                // Dark-to-light direction along the probe.
                let (gx, gy) = if v1 == LIGHT {
                    (dx as i8, dy as i8)
                } else {
                    (-dx as i8, -dy as i8)
                };
                map.entry(key).or_default().push(EdgePoint {
                    x: (2 * x as i32 + dx) as u16,
                    y: (2 * y as i32 + dy) as u16,
                    gx,
                    gy,
                });
            }
        }
    }

    let mut clusters: Vec<Cluster> = map
        .into_values()
        .map(|points| Cluster { points })
        .collect();
    // Hash-map iteration order is arbitrary; sort by the earliest sample so
    // downstream stages see a stable sequence.
    clusters.sort_by_key(|c| {
        let p = c.points[0];
        (p.y, p.x, c.points.len())
    });
    clusters
}
