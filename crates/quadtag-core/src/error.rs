//! Public error taxonomy.
//!
//! Only configuration and input errors surface to the caller. Per-candidate
//! rejections inside the pipeline (undersized clusters, bad line fits,
//! border mismatches, uncorrectable codewords) are silent drops that are
//! counted into [`crate::profile::DetectStats`] instead.

/// Errors surfaced by detector construction and [`crate::Detector::detect`].
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// A configuration value is outside its legal range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description of the offending field.
        reason: String,
    },

    /// The requested family name is not in the registry.
    #[error("unknown tag family `{0}`")]
    UnknownFamily(String),

    /// The input image is smaller than the minimum any registered family
    /// can be decoded from.
    #[error("image {width}x{height} is below the {min}x{min} minimum for the registered families")]
    ImageTooSmall {
        /// Input width in pixels.
        width: usize,
        /// Input height in pixels.
        height: usize,
        /// Minimum side length required.
        min: usize,
    },

    /// The image buffer does not match its declared geometry.
    #[error("stride {stride} is invalid for width {width} (buffer of {len} bytes)")]
    InvalidStride {
        /// Declared row stride.
        stride: usize,
        /// Declared width.
        width: usize,
        /// Actual buffer length.
        len: usize,
    },
}

impl DetectorError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_values() {
        let err = DetectorError::ImageTooSmall {
            width: 10,
            height: 12,
            min: 24,
        };
        let msg = err.to_string();
        assert!(msg.contains("10x12"));
        assert!(msg.contains("24x24"));

        let err = DetectorError::UnknownFamily("tag99h1".into());
        assert!(err.to_string().contains("tag99h1"));

        let err = DetectorError::config("nthreads must be at least 1");
        assert!(err.to_string().contains("nthreads"));
    }
}
