//! Detector configuration.
//!
//! All values have working defaults; the builder exists for the common case
//! of overriding one or two of them. Validation happens once, when the
//! configuration is handed to [`crate::Detector::with_config`].

use crate::error::DetectorError;

/// Tunable parameters of the detection pipeline.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    /// Integer decimation factor applied before quad detection; 1 disables.
    pub quad_decimate: f32,
    /// Gaussian sigma applied to the (decimated) working image. Negative
    /// values sharpen with an unsharp mask instead.
    pub quad_sigma: f32,
    /// Worker threads for the parallel stages.
    pub nthreads: usize,
    /// Re-fit quad edges against the full-resolution gradient.
    pub refine_edges: bool,
    /// Retry decoding with nudged sample grids when bits had to be
    /// corrected.
    pub refine_decode: bool,
    /// Polish poses with a reprojection Gauss-Newton pass.
    pub refine_pose: bool,
    /// Use contour tracing instead of gradient clustering for quad
    /// extraction.
    pub use_contours: bool,
    /// Log stage timings and rejection counters.
    pub debug: bool,

    /// Side length of the adaptive-threshold tiles.
    pub threshold_tile_size: usize,
    /// Minimum tile contrast before pixels are classified.
    pub threshold_min_contrast: u8,

    /// Minimum edge samples for a cluster to be fit.
    pub min_cluster_pixels: usize,
    /// Candidate corner cap inside the quad fitter.
    pub max_nmaxima: usize,
    /// Critical corner angle in radians; flatter corners are rejected.
    pub critical_angle_rad: f64,
    /// Maximum mean squared line-fit error per quad side.
    pub max_line_fit_mse: f64,
    /// Minimum quad perimeter in (decimated) pixels.
    pub min_quad_perimeter: f64,
    /// Minimum quad area in (decimated) square pixels.
    pub min_quad_area: f64,
    /// Maximum quad bounding-box aspect ratio.
    pub max_aspect_ratio: f64,

    /// Same-id detections with centers closer than this are duplicates.
    pub dedup_radius: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            quad_decimate: 1.0,
            quad_sigma: 0.0,
            nthreads: 1,
            refine_edges: true,
            refine_decode: false,
            refine_pose: false,
            use_contours: false,
            debug: false,
            threshold_tile_size: 4,
            threshold_min_contrast: 5,
            min_cluster_pixels: 24,
            max_nmaxima: 10,
            critical_angle_rad: 10.0f64.to_radians(),
            max_line_fit_mse: 10.0,
            min_quad_perimeter: 24.0,
            min_quad_area: 64.0,
            max_aspect_ratio: 10.0,
            dedup_radius: 5.0,
        }
    }
}

impl DetectorConfig {
    /// Create a builder over the defaults.
    #[must_use]
    pub fn builder() -> DetectorConfigBuilder {
        DetectorConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DetectorError> {
        if !self.quad_decimate.is_finite() || self.quad_decimate < 1.0 {
            return Err(DetectorError::config(format!(
                "quad_decimate must be >= 1, got {}",
                self.quad_decimate
            )));
        }
        if !self.quad_sigma.is_finite() {
            return Err(DetectorError::config("quad_sigma must be finite"));
        }
        if self.nthreads == 0 {
            return Err(DetectorError::config("nthreads must be at least 1"));
        }
        if self.threshold_tile_size < 2 {
            return Err(DetectorError::config(format!(
                "threshold_tile_size must be at least 2, got {}",
                self.threshold_tile_size
            )));
        }
        if self.min_cluster_pixels < 8 {
            return Err(DetectorError::config(
                "min_cluster_pixels below 8 cannot bound a quad",
            ));
        }
        if self.max_nmaxima < 4 {
            return Err(DetectorError::config("max_nmaxima must be at least 4"));
        }
        if !(0.0..std::f64::consts::FRAC_PI_4).contains(&self.critical_angle_rad) {
            return Err(DetectorError::config(
                "critical_angle_rad must be in (0, pi/4)",
            ));
        }
        Ok(())
    }

    /// Effective integer decimation factor.
    #[must_use]
    pub(crate) fn decimation_factor(&self) -> usize {
        (self.quad_decimate.round() as usize).max(1)
    }
}

/// Builder for [`DetectorConfig`].
pub struct DetectorConfigBuilder {
    config: DetectorConfig,
}

impl DetectorConfigBuilder {
    /// Set the decimation factor.
    #[must_use]
    pub fn quad_decimate(mut self, v: f32) -> Self {
        self.config.quad_decimate = v;
        self
    }

    /// Set the blur sigma (negative sharpens).
    #[must_use]
    pub fn quad_sigma(mut self, v: f32) -> Self {
        self.config.quad_sigma = v;
        self
    }

    /// Set the worker thread count.
    #[must_use]
    pub fn nthreads(mut self, v: usize) -> Self {
        self.config.nthreads = v;
        self
    }

    /// Toggle edge refinement.
    #[must_use]
    pub fn refine_edges(mut self, v: bool) -> Self {
        self.config.refine_edges = v;
        self
    }

    /// Toggle decode refinement.
    #[must_use]
    pub fn refine_decode(mut self, v: bool) -> Self {
        self.config.refine_decode = v;
        self
    }

    /// Toggle pose refinement.
    #[must_use]
    pub fn refine_pose(mut self, v: bool) -> Self {
        self.config.refine_pose = v;
        self
    }

    /// Select the contour-based quad extractor.
    #[must_use]
    pub fn use_contours(mut self, v: bool) -> Self {
        self.config.use_contours = v;
        self
    }

    /// Toggle debug logging.
    #[must_use]
    pub fn debug(mut self, v: bool) -> Self {
        self.config.debug = v;
        self
    }

    /// Set the adaptive-threshold tile size.
    #[must_use]
    pub fn threshold_tile_size(mut self, v: usize) -> Self {
        self.config.threshold_tile_size = v;
        self
    }

    /// Set the tile contrast floor.
    #[must_use]
    pub fn threshold_min_contrast(mut self, v: u8) -> Self {
        self.config.threshold_min_contrast = v;
        self
    }

    /// Set the cluster size floor.
    #[must_use]
    pub fn min_cluster_pixels(mut self, v: usize) -> Self {
        self.config.min_cluster_pixels = v;
        self
    }

    /// Set the minimum quad area.
    #[must_use]
    pub fn min_quad_area(mut self, v: f64) -> Self {
        self.config.min_quad_area = v;
        self
    }

    /// Set the duplicate-suppression radius.
    #[must_use]
    pub fn dedup_radius(mut self, v: f64) -> Self {
        self.config.dedup_radius = v;
        self
    }

    /// Finish, yielding the configuration.
    #[must_use]
    pub fn build(self) -> DetectorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides_single_field() {
        let config = DetectorConfig::builder().nthreads(4).build();
        assert_eq!(config.nthreads, 4);
        assert_eq!(config.quad_decimate, 1.0);
    }

    #[test]
    fn bad_decimate_is_rejected() {
        let config = DetectorConfig::builder().quad_decimate(0.5).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let config = DetectorConfig::builder().nthreads(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn decimation_factor_rounds() {
        let config = DetectorConfig::builder().quad_decimate(2.4).build();
        assert_eq!(config.decimation_factor(), 2);
        let config = DetectorConfig::builder().quad_decimate(3.0).build();
        assert_eq!(config.decimation_factor(), 3);
    }
}
