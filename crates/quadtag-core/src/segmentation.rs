//! Connected-component labeling over the three-valued threshold image.
//!
//! Labeling is striped: each horizontal stripe of rows emits the union
//! pairs it observes into its own buffer in parallel, and the pairs are then
//! applied to a single arena-backed union-find in stripe order on the
//! calling thread. The stripe height is fixed, so the pair stream (and with
//! it every component root) is identical for any worker-thread count.

use bumpalo::Bump;
use rayon::prelude::*;

use crate::image::Image8;
use crate::threshold::SKIP;

/// Rows per labeling stripe. Fixed so results do not depend on `nthreads`.
const STRIPE_ROWS: usize = 64;

/// Disjoint-set forest with path halving and union by size.
///
/// Storage lives in the per-call arena; the structure is rebuilt for every
/// frame rather than reset.
pub struct UnionFind<'a> {
    parent: &'a mut [u32],
    size: &'a mut [u32],
}

impl<'a> UnionFind<'a> {
    /// Allocate `len` singleton sets in `arena`.
    #[must_use]
    pub fn new_in(arena: &'a Bump, len: usize) -> Self {
        let parent = arena.alloc_slice_fill_with(len, |i| i as u32);
        let size = arena.alloc_slice_fill_copy(len, 1u32);
        Self { parent, size }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// True when the structure holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Representative of `i`'s set.
    #[inline]
    pub fn find(&mut self, i: u32) -> u32 {
        let mut root = i;
        while self.parent[root as usize] != root {
            // Path halving: point every other node at its grandparent.
            self.parent[root as usize] = self.parent[self.parent[root as usize] as usize];
            root = self.parent[root as usize];
        }
        root
    }

    /// Merge the sets containing `i` and `j`.
    #[inline]
    pub fn union(&mut self, i: u32, j: u32) {
        let ri = self.find(i);
        let rj = self.find(j);
        if ri == rj {
            return;
        }
        if self.size[ri as usize] < self.size[rj as usize] {
            self.parent[ri as usize] = rj;
            self.size[rj as usize] += self.size[ri as usize];
        } else {
            self.parent[rj as usize] = ri;
            self.size[ri as usize] += self.size[rj as usize];
        }
    }

    /// Size of the set containing `i`.
    #[inline]
    pub fn set_size(&mut self, i: u32) -> u32 {
        let r = self.find(i);
        self.size[r as usize]
    }
}

/// Label same-valued 4-connected DARK/LIGHT pixels of `tri`.
///
/// SKIP pixels are wildcards: they join nothing and split nothing that is
/// not already split.
pub fn connected_components<'a>(arena: &'a Bump, tri: &Image8) -> UnionFind<'a> {
    let w = tri.width();
    let h = tri.height();
    let mut uf = UnionFind::new_in(arena, w * h);
    if w == 0 || h == 0 {
        return uf;
    }

    let stripes: Vec<(usize, usize)> = (0..h)
        .step_by(STRIPE_ROWS)
        .map(|y0| (y0, (y0 + STRIPE_ROWS).min(h)))
        .collect();

    let pair_lists: Vec<Vec<(u32, u32)>> = stripes
        .par_iter()
        .map(|&(y0, y1)| {
            let mut pairs = Vec::with_capacity((y1 - y0) * w);
            for y in y0..y1 {
                let row = tri.row(y);
                let below = if y + 1 < h { Some(tri.row(y + 1)) } else { None };
                let base = (y * w) as u32;
                for x in 0..w {
                    let v = row[x];
                    if v == SKIP {
                        continue;
                    }
                    if x + 1 < w && row[x + 1] == v {
                        pairs.push((base + x as u32, base + x as u32 + 1));
                    }
                    if let Some(below) = below {
                        if below[x] == v {
                            pairs.push((base + x as u32, base + x as u32 + w as u32));
                        }
                    }
                }
            }
            pairs
        })
        .collect();

    // Single-threaded combine in stripe order keeps roots deterministic.
    for pairs in &pair_lists {
        for &(a, b) in pairs {
            uf.union(a, b);
        }
    }
    uf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{DARK, LIGHT};
    use proptest::prelude::*;

    fn tri_from(rows: &[&[u8]]) -> Image8 {
        let h = rows.len();
        let w = rows[0].len();
        let mut img = Image8::new(w, h);
        for (y, r) in rows.iter().enumerate() {
            img.row_mut(y).copy_from_slice(r);
        }
        img
    }

    #[test]
    fn separate_blobs_get_separate_roots() {
        let d = DARK;
        let l = LIGHT;
        let tri = tri_from(&[
            &[d, d, l, d, d],
            &[d, d, l, d, d],
            &[l, l, l, l, l],
        ]);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        let left = uf.find(0);
        let right = uf.find(3);
        assert_ne!(left, right);
        assert_eq!(uf.find(5), left);
        assert_eq!(uf.find(8), right);
        assert_eq!(uf.set_size(0), 4);
    }

    #[test]
    fn skip_pixels_join_nothing() {
        let d = DARK;
        let s = SKIP;
        let tri = tri_from(&[&[d, s, d]]);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        assert_ne!(uf.find(0), uf.find(2));
        assert_eq!(uf.set_size(1), 1);
    }

    #[test]
    fn dark_and_light_never_merge() {
        let tri = tri_from(&[&[DARK, LIGHT], &[DARK, LIGHT]]);
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &tri);
        assert_eq!(uf.find(0), uf.find(2));
        assert_eq!(uf.find(1), uf.find(3));
        assert_ne!(uf.find(0), uf.find(1));
    }

    #[test]
    fn roots_are_stable_across_stripe_boundaries() {
        // A component spanning more than one stripe must still be one set.
        let mut img = Image8::new(3, 200);
        for y in 0..200 {
            img.row_mut(y).fill(DARK);
        }
        let arena = Bump::new();
        let mut uf = connected_components(&arena, &img);
        let root = uf.find(0);
        assert_eq!(uf.find((199 * 3 + 2) as u32), root);
        assert_eq!(uf.set_size(0), 600);
    }

    proptest! {
        #[test]
        fn union_find_partitions(ops in prop::collection::vec((0u32..64, 0u32..64), 0..128)) {
            let arena = Bump::new();
            let mut uf = UnionFind::new_in(&arena, 64);
            for &(a, b) in &ops {
                uf.union(a, b);
            }
            // find is idempotent and roots are self-parented.
            for i in 0..64u32 {
                let r = uf.find(i);
                prop_assert_eq!(uf.find(r), r);
                prop_assert_eq!(uf.find(i), r);
            }
            // sizes of roots sum to the element count.
            let mut total = 0u32;
            for i in 0..64u32 {
                if uf.find(i) == i {
                    total += uf.set_size(i);
                }
            }
            prop_assert_eq!(total, 64);
        }
    }
}
