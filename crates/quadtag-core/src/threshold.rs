//! Tile-based adaptive thresholding.
//!
//! The image is split into small tiles; each tile records its intensity
//! extrema, which are then dilated across the 3x3 tile neighbourhood so the
//! threshold transitions smoothly between lighting regions. Pixels in tiles
//! with too little contrast are marked [`SKIP`] and act as wildcards: they
//! neither seed nor break components downstream.
//!
//! The dilated tile grid outlives classification; the decoder reuses it to
//! threshold sampled payload bits against the same local lighting model.

use multiversion::multiversion;
use rayon::prelude::*;

use crate::image::Image8;

/// Classified dark pixel.
pub const DARK: u8 = 0;
/// Classified light pixel.
pub const LIGHT: u8 = 255;
/// Low-contrast pixel excluded from labeling.
pub const SKIP: u8 = 127;

/// Intensity extrema of one tile.
#[derive(Clone, Copy, Debug)]
pub struct TileStats {
    /// Minimum intensity in the (dilated) tile neighbourhood.
    pub min: u8,
    /// Maximum intensity in the (dilated) tile neighbourhood.
    pub max: u8,
}

impl Default for TileStats {
    fn default() -> Self {
        Self { min: 255, max: 0 }
    }
}

/// Dilated per-tile statistics retained for decoder reuse.
pub struct TileGrid {
    tile_size: usize,
    tiles_wide: usize,
    tiles_high: usize,
    min_contrast: u8,
    dilated: Vec<TileStats>,
}

impl TileGrid {
    #[inline]
    fn tile_index(&self, x: usize, y: usize) -> usize {
        let tx = (x / self.tile_size).min(self.tiles_wide - 1);
        let ty = (y / self.tile_size).min(self.tiles_high - 1);
        ty * self.tiles_wide + tx
    }

    /// Local midpoint threshold at a pixel position, or `None` when the
    /// neighbourhood has too little contrast to classify reliably.
    #[must_use]
    pub fn threshold_at(&self, x: f64, y: f64) -> Option<f64> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let s = self.dilated[self.tile_index(x as usize, y as usize)];
        if s.max.saturating_sub(s.min) < self.min_contrast {
            None
        } else {
            Some(f64::midpoint(f64::from(s.min), f64::from(s.max)))
        }
    }
}

/// Adaptive thresholder configuration and entry point.
pub struct ThresholdEngine {
    /// Tile side length in (post-decimation) pixels.
    pub tile_size: usize,
    /// Minimum `max - min` over the dilated neighbourhood for a tile to
    /// produce DARK/LIGHT labels.
    pub min_contrast: u8,
}

impl ThresholdEngine {
    /// Create an engine with the given tile size and contrast floor.
    #[must_use]
    pub fn new(tile_size: usize, min_contrast: u8) -> Self {
        Self {
            tile_size,
            min_contrast,
        }
    }

    /// Classify `img` into the three-valued image `tri` and return the
    /// dilated tile grid for later reuse.
    pub fn classify(&self, img: &Image8, tri: &mut Image8) -> TileGrid {
        let t = self.tile_size;
        let w = img.width();
        let h = img.height();
        let tiles_wide = w.div_ceil(t).max(1);
        let tiles_high = h.div_ceil(t).max(1);

        // Pass 1: raw per-tile extrema.
        let mut raw = vec![TileStats::default(); tiles_wide * tiles_high];
        raw.par_chunks_mut(tiles_wide)
            .enumerate()
            .for_each(|(ty, stats_row)| {
                let y0 = ty * t;
                let y1 = (y0 + t).min(h);
                for y in y0..y1 {
                    let src_row = img.row(y);
                    for (tx, stats) in stats_row.iter_mut().enumerate() {
                        let x0 = tx * t;
                        let x1 = (x0 + t).min(w);
                        let (rmin, rmax) = row_min_max(&src_row[x0..x1]);
                        stats.min = stats.min.min(rmin);
                        stats.max = stats.max.max(rmax);
                    }
                }
            });

        // Pass 2: dilate extrema across the 3x3 tile neighbourhood.
        let mut dilated = vec![TileStats::default(); tiles_wide * tiles_high];
        dilated
            .par_chunks_mut(tiles_wide)
            .enumerate()
            .for_each(|(ty, out_row)| {
                let y0 = ty.saturating_sub(1);
                let y1 = (ty + 1).min(tiles_high - 1);
                for (tx, out) in out_row.iter_mut().enumerate() {
                    let x0 = tx.saturating_sub(1);
                    let x1 = (tx + 1).min(tiles_wide - 1);
                    let mut nmin = 255u8;
                    let mut nmax = 0u8;
                    for ny in y0..=y1 {
                        for nx in x0..=x1 {
                            let s = raw[ny * tiles_wide + nx];
                            nmin = nmin.min(s.min);
                            nmax = nmax.max(s.max);
                        }
                    }
                    *out = TileStats {
                        min: nmin,
                        max: nmax,
                    };
                }
            });

        // Pass 3: per-pixel classification against the dilated midpoint.
        tri.reshape(w, h);
        let min_contrast = self.min_contrast;
        let grid = TileGrid {
            tile_size: t,
            tiles_wide,
            tiles_high,
            min_contrast,
            dilated,
        };

        // Expand the tile thresholds for each pixel row, then run the
        // branch-light row kernel.
        (0..h).for_each(|y| {
            let mut thresholds = vec![0u8; w];
            let mut valid = vec![0u8; w];
            let ty = (y / t).min(tiles_high - 1);
            for tx in 0..tiles_wide {
                let s = grid.dilated[ty * tiles_wide + tx];
                let ok = s.max.saturating_sub(s.min) >= min_contrast;
                let mid = ((u16::from(s.min) + u16::from(s.max)) >> 1) as u8;
                let x0 = tx * t;
                let x1 = (x0 + t).min(w);
                thresholds[x0..x1].fill(mid);
                valid[x0..x1].fill(u8::from(ok));
            }
            classify_row(img.row(y), tri.row_mut(y), &thresholds, &valid);
        });

        grid
    }
}

#[multiversion(targets = "simd")]
fn row_min_max(data: &[u8]) -> (u8, u8) {
    let mut min = 255u8;
    let mut max = 0u8;
    for &v in data {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

#[multiversion(targets = "simd")]
fn classify_row(src: &[u8], dst: &mut [u8], thresholds: &[u8], valid: &[u8]) {
    for i in 0..src.len() {
        let lit = if src[i] > thresholds[i] { LIGHT } else { DARK };
        dst[i] = if valid[i] != 0 { lit } else { SKIP };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn checkerboard(size: usize, cell: usize) -> Image8 {
        let mut img = Image8::new(size, size);
        for y in 0..size {
            for x in 0..size {
                let v = if ((x / cell) + (y / cell)) % 2 == 0 {
                    230
                } else {
                    20
                };
                img.set_pixel(x, y, v);
            }
        }
        img
    }

    #[test]
    fn flat_image_is_all_skip() {
        let mut img = Image8::new(32, 32);
        for y in 0..32 {
            img.row_mut(y).fill(128);
        }
        let engine = ThresholdEngine::new(4, 5);
        let mut tri = Image8::default();
        let grid = engine.classify(&img, &mut tri);
        for y in 0..32 {
            assert!(tri.row(y).iter().all(|&v| v == SKIP));
        }
        assert!(grid.threshold_at(10.0, 10.0).is_none());
    }

    #[test]
    fn checkerboard_splits_dark_and_light() {
        let img = checkerboard(64, 16);
        let engine = ThresholdEngine::new(4, 5);
        let mut tri = Image8::default();
        let grid = engine.classify(&img, &mut tri);

        // Pixels near a cell boundary see contrast through the dilated
        // neighbourhood and split on the midpoint; deep cell interiors
        // are wildcards.
        assert_eq!(tri.pixel(14, 2), LIGHT);
        assert_eq!(tri.pixel(18, 2), DARK);
        assert_eq!(tri.pixel(8, 8), SKIP);
        // Midpoint of 20/230 lands near 125 along the boundaries.
        let t = grid.threshold_at(16.0, 16.0).unwrap();
        assert!((t - 125.0).abs() < 2.0);
    }

    #[test]
    fn non_multiple_dimensions_classify_every_pixel() {
        let img = checkerboard(61, 13);
        let engine = ThresholdEngine::new(4, 5);
        let mut tri = Image8::default();
        engine.classify(&img, &mut tri);
        assert_eq!(tri.width(), 61);
        assert_eq!(tri.height(), 61);
        // The bottom-right corner must still be classified, not left at 0.
        let v = tri.pixel(60, 60);
        assert!(v == DARK || v == LIGHT || v == SKIP);
        let mut seen_dark = false;
        let mut seen_light = false;
        for y in 0..61 {
            for &p in tri.row(y) {
                seen_dark |= p == DARK;
                seen_light |= p == LIGHT;
            }
        }
        assert!(seen_dark && seen_light);
    }

    proptest! {
        #[test]
        fn row_min_max_matches_iterator(data in prop::collection::vec(0..=255u8, 1..64)) {
            let (min, max) = row_min_max(&data);
            prop_assert_eq!(min, *data.iter().min().unwrap());
            prop_assert_eq!(max, *data.iter().max().unwrap());
        }

        #[test]
        fn classify_row_is_exhaustive(
            src in prop::collection::vec(0..=255u8, 32),
            thresh in 0..=255u8,
        ) {
            let thresholds = vec![thresh; 32];
            let valid = vec![1u8; 32];
            let mut dst = vec![0u8; 32];
            classify_row(&src, &mut dst, &thresholds, &valid);
            for (i, &s) in src.iter().enumerate() {
                prop_assert_eq!(dst[i], if s > thresh { LIGHT } else { DARK });
            }
        }
    }
}
