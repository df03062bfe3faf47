//! Square fiducial marker detection.
//!
//! Given a grayscale image, the detector locates planar square markers,
//! decodes their payload against a family codebook with bounded error
//! correction, and reports identifier, corner locations, center and
//! quality scores; camera intrinsics and the physical tag size optionally
//! turn a detection into a full 6-DoF pose.
//!
//! The pipeline: adaptive tile thresholding, connected components over the
//! three-valued image, gradient clustering of dark/light boundaries (or
//! contour tracing), windowed line fitting into candidate quads, homography
//! projection of the payload grid, codebook matching across all four
//! rotations, and optional gradient-based edge refinement.
//!
//! ```no_run
//! use quadtag_core::{Detector, ImageView};
//!
//! let pixels = vec![255u8; 640 * 480];
//! let image = ImageView::new(&pixels, 640, 480, 640)?;
//! let mut detector = Detector::new();
//! detector.add_family_by_name("tag36h11")?;
//! for det in detector.detect(&image)? {
//!     println!("id {} at {:?}", det.id, det.center);
//! }
//! # Ok::<(), quadtag_core::DetectorError>(())
//! ```

#![warn(missing_docs)]
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod cluster;
pub mod config;
pub mod contour;
pub mod decoder;
pub mod detector;
pub mod error;
pub mod families;
pub mod image;
pub mod pose;
pub mod preprocess;
pub mod profile;
pub mod quad;
pub mod refine;
pub mod segmentation;
pub mod test_utils;
pub mod threshold;

pub use config::DetectorConfig;
pub use detector::{Detection, Detector};
pub use error::DetectorError;
pub use families::TagFamily;
pub use image::ImageView;
pub use pose::{pose_from_detection, CameraIntrinsics, TagPose};
