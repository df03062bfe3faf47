//! Pipeline orchestration.
//!
//! A [`Detector`] owns its configuration, worker pool, scratch arena and
//! family registrations, and exposes the single [`Detector::detect`] entry
//! point. Per-call scratch is arena-allocated and reset (not freed) at the
//! start of every call; registered families are shared read-only with the
//! workers.
//!
//! The emitted list is sorted by `(id, center.y, center.x)` and the striped
//! labeling stage produces thread-count-independent roots, so results are
//! bitwise identical for any `nthreads`.

use std::sync::Arc;

use bumpalo::Bump;
use rayon::prelude::*;

use crate::cluster::gradient_clusters;
use crate::config::DetectorConfig;
use crate::contour::contour_quads;
use crate::decoder::{decode_quad, Homography, ThresholdLookup};
use crate::error::DetectorError;
use crate::families::TagFamily;
use crate::image::{Image8, ImageF32, ImageView};
use crate::pose::{estimate_pose, CameraIntrinsics, TagPose};
use crate::preprocess::{decimate, gaussian_blur, sharpen};
use crate::profile::{DetectStats, TimeProfile};
use crate::quad::{fit_quad, FitParams, Quad};
use crate::refine::refine_edges;
use crate::segmentation::connected_components;
use crate::threshold::ThresholdEngine;

/// One decoded tag.
#[derive(Clone, Debug)]
pub struct Detection {
    /// The family the codeword belongs to.
    pub family: Arc<TagFamily>,
    /// Codeword index within the family.
    pub id: u32,
    /// Bit errors corrected during decoding.
    pub hamming: u32,
    /// Opaque non-negative quad quality score.
    pub goodness: f64,
    /// Soft-decision separation from the best non-matching codeword.
    pub decision_margin: f64,
    /// Row-major homography mapping the canonical square onto `corners`.
    pub homography: [[f64; 3]; 3],
    /// Tag center in image pixels.
    pub center: [f64; 2],
    /// Corners in canonical order; `corners[0]` is the tag's physical
    /// top-left regardless of how the tag is rotated in the image.
    pub corners: [[f64; 2]; 4],
}

/// The detector: configuration plus per-call scratch.
pub struct Detector {
    config: DetectorConfig,
    families: Vec<Arc<TagFamily>>,
    pool: rayon::ThreadPool,
    arena: Bump,
    work: Image8,
    tri: Image8,
    blur_scratch: ImageF32,
    profile: TimeProfile,
    stats: DetectStats,
}

impl Detector {
    /// Create a detector with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DetectorConfig::default()).expect("default configuration is valid")
    }

    /// Create a detector, validating the configuration.
    pub fn with_config(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nthreads)
            .build()
            .map_err(|e| DetectorError::config(format!("thread pool: {e}")))?;
        Ok(Self {
            config,
            families: Vec::new(),
            pool,
            arena: Bump::new(),
            work: Image8::default(),
            tri: Image8::default(),
            blur_scratch: ImageF32::default(),
            profile: TimeProfile::new(),
            stats: DetectStats::default(),
        })
    }

    /// Register a family. Detection attempts families in registration
    /// order; the same detector can search several at once.
    pub fn add_family(&mut self, family: TagFamily) {
        self.families.push(Arc::new(family));
    }

    /// Register a family by registry name.
    pub fn add_family_by_name(&mut self, name: &str) -> Result<(), DetectorError> {
        let family = TagFamily::for_name(name)
            .ok_or_else(|| DetectorError::UnknownFamily(name.to_string()))?;
        self.add_family(family);
        Ok(())
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Stage timings of the last `detect` call.
    #[must_use]
    pub fn time_profile(&self) -> &TimeProfile {
        &self.profile
    }

    /// Candidate counters of the last `detect` call.
    #[must_use]
    pub fn stats(&self) -> DetectStats {
        self.stats
    }

    /// Estimate the pose of a detection, honouring `refine_pose`.
    #[must_use]
    pub fn estimate_pose(
        &self,
        det: &Detection,
        intrinsics: &CameraIntrinsics,
        tag_size: f64,
    ) -> Option<TagPose> {
        estimate_pose(&det.corners, intrinsics, tag_size, self.config.refine_pose)
    }

    /// Detect all registered families in a grayscale image.
    ///
    /// Returns an empty list when no families are registered. The call is
    /// atomic: there is no way to observe or cancel a partial result.
    pub fn detect(&mut self, img: &ImageView<'_>) -> Result<Vec<Detection>, DetectorError> {
        self.arena.reset();
        self.profile.reset();
        self.stats = DetectStats::default();

        if self.families.is_empty() {
            return Ok(Vec::new());
        }
        let min_side = self
            .families
            .iter()
            .map(|f| f.min_image_side())
            .min()
            .unwrap_or(0);
        if img.width < min_side || img.height < min_side {
            return Err(DetectorError::ImageTooSmall {
                width: img.width,
                height: img.height,
                min: min_side,
            });
        }

        let factor = self.config.decimation_factor();
        decimate(img, factor, &mut self.work);
        self.profile.stamp("decimate");

        if self.config.quad_sigma > 0.0 {
            gaussian_blur(&mut self.work, self.config.quad_sigma, &mut self.blur_scratch);
        } else if self.config.quad_sigma < 0.0 {
            sharpen(&mut self.work, -self.config.quad_sigma, &mut self.blur_scratch);
        }
        self.profile.stamp("blur");

        let engine = ThresholdEngine::new(
            self.config.threshold_tile_size,
            self.config.threshold_min_contrast,
        );
        let tiles = self
            .pool
            .install(|| engine.classify(&self.work, &mut self.tri));
        self.profile.stamp("threshold");

        let fit_params = FitParams {
            min_cluster_pixels: self.config.min_cluster_pixels,
            max_nmaxima: self.config.max_nmaxima,
            cos_critical_rad: self.config.critical_angle_rad.cos(),
            max_line_fit_mse: self.config.max_line_fit_mse,
            min_perimeter: self.config.min_quad_perimeter,
            max_perimeter: 4.0 * (self.work.width() + self.work.height()) as f64,
            min_area: self.config.min_quad_area,
            max_aspect_ratio: self.config.max_aspect_ratio,
        };

        let mut uf = connected_components(&self.arena, &self.tri);
        self.profile.stamp("components");

        let mut quads: Vec<Quad> = if self.config.use_contours {
            let quads = contour_quads(
                &self.tri,
                &mut uf,
                self.config.min_cluster_pixels as u32 / 4,
                &fit_params,
            );
            self.stats.clusters = quads.len();
            quads
        } else {
            let clusters = gradient_clusters(
                &self.tri,
                &mut uf,
                (self.config.min_cluster_pixels as u32 / 4).max(1),
            );
            self.stats.edge_points = clusters.iter().map(|c| c.points.len()).sum();
            self.stats.clusters = clusters.len();
            let work = &self.work;
            self.pool.install(|| {
                clusters
                    .par_iter()
                    .filter_map(|c| fit_quad(work, c, &fit_params))
                    .collect()
            })
        };
        self.stats.quads = quads.len();
        self.profile.stamp("quads");

        // Back to full-resolution coordinates before refinement/decoding.
        if factor > 1 {
            let f = factor as f64;
            for quad in &mut quads {
                for p in &mut quad.corners {
                    p[0] *= f;
                    p[1] *= f;
                }
            }
        }

        if self.config.refine_edges {
            let image = *img;
            self.pool.install(|| {
                quads
                    .par_iter_mut()
                    .for_each(|quad| refine_edges(&image, &mut quad.corners));
            });
        }
        self.profile.stamp("refine");

        let lookup = ThresholdLookup::new(&tiles, factor as f64);
        let lookup = &lookup;
        let families = &self.families;
        let refine_decode = self.config.refine_decode;
        let image = *img;
        let mut detections: Vec<Detection> = self.pool.install(|| {
            quads
                .par_iter()
                .flat_map_iter(|quad| {
                    families.iter().filter_map(move |family| {
                        if quad.reversed_border != family.reversed_border {
                            return None;
                        }
                        let decoded = decode_quad(&image, quad, family, lookup, refine_decode)?;
                        build_detection(quad, family, &decoded)
                    })
                })
                .collect()
        });
        self.stats.decoded = detections.len();
        self.stats.rejected_decode = self.stats.quads.saturating_sub(detections.len());
        self.profile.stamp("decode");

        self.deduplicate(&mut detections);
        detections.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| a.center[1].total_cmp(&b.center[1]))
                .then_with(|| a.center[0].total_cmp(&b.center[0]))
        });
        self.stats.detections = detections.len();
        self.profile.stamp("dedup");

        if self.config.debug {
            self.profile.log();
            self.stats.log();
        }
        Ok(detections)
    }

    /// Same-id detections with nearby centers collapse onto the one with
    /// the highest decision margin.
    fn deduplicate(&mut self, detections: &mut Vec<Detection>) {
        let radius = self.config.dedup_radius;
        detections.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| b.decision_margin.total_cmp(&a.decision_margin))
                .then_with(|| a.center[1].total_cmp(&b.center[1]))
                .then_with(|| a.center[0].total_cmp(&b.center[0]))
        });
        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
        for det in detections.drain(..) {
            let duplicate = kept.iter().any(|k| {
                k.id == det.id
                    && k.family.name == det.family.name
                    && (k.center[0] - det.center[0]).hypot(k.center[1] - det.center[1]) < radius
            });
            if duplicate {
                self.stats.deduplicated += 1;
            } else {
                kept.push(det);
            }
        }
        *detections = kept;
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotate the quad corners so index 0 is the tag's canonical top-left,
/// then rebuild the homography and center from the final corner order.
fn build_detection(
    quad: &Quad,
    family: &Arc<TagFamily>,
    decoded: &crate::decoder::Decoded,
) -> Option<Detection> {
    let rot = usize::from(decoded.rotation);
    let mut corners = [[0.0f64; 2]; 4];
    for (i, c) in corners.iter_mut().enumerate() {
        *c = quad.corners[(i + rot) % 4];
    }
    let h = Homography::square_to_quad(&corners)?;
    let center = h.project([0.0, 0.0]);
    Some(Detection {
        family: Arc::clone(family),
        id: decoded.id,
        hamming: decoded.hamming,
        goodness: decoded.goodness,
        decision_margin: decoded.decision_margin,
        homography: h.to_array(),
        center,
        corners,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_family_list_returns_no_detections() {
        let mut det = Detector::new();
        let data = vec![128u8; 100 * 100];
        let img = ImageView::new(&data, 100, 100, 100).unwrap();
        assert!(det.detect(&img).unwrap().is_empty());
    }

    #[test]
    fn undersized_image_is_an_input_error() {
        let mut det = Detector::new();
        det.add_family_by_name("tag36h11").unwrap();
        let data = vec![128u8; 10 * 10];
        let img = ImageView::new(&data, 10, 10, 10).unwrap();
        match det.detect(&img) {
            Err(DetectorError::ImageTooSmall { min, .. }) => assert_eq!(min, 24),
            other => panic!("expected ImageTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn unknown_family_name_errors() {
        let mut det = Detector::new();
        assert!(matches!(
            det.add_family_by_name("tag99h1"),
            Err(DetectorError::UnknownFamily(_))
        ));
    }

    #[test]
    fn blank_image_yields_nothing() {
        let mut det = Detector::new();
        det.add_family_by_name("tag16h5").unwrap();
        let data = vec![200u8; 128 * 128];
        let img = ImageView::new(&data, 128, 128, 128).unwrap();
        let out = det.detect(&img).unwrap();
        assert!(out.is_empty());
        assert_eq!(det.stats().detections, 0);
    }
}
