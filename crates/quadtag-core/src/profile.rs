//! Stage timing and candidate accounting.
//!
//! Workers never touch the profile; stages are stamped on the orchestrator
//! thread at stage boundaries, so no synchronization is needed.

use std::time::{Duration, Instant};

/// Wall-clock durations of the pipeline stages of the last `detect` call.
#[derive(Debug)]
pub struct TimeProfile {
    entries: Vec<(&'static str, Duration)>,
    last: Instant,
}

impl TimeProfile {
    /// Start a fresh profile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last: Instant::now(),
        }
    }

    /// Clear entries and restart the clock.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last = Instant::now();
    }

    /// Record the time since the previous stamp under `name`.
    pub fn stamp(&mut self, name: &'static str) {
        let now = Instant::now();
        self.entries.push((name, now - self.last));
        self.last = now;
    }

    /// Recorded `(stage, duration)` pairs in stage order.
    #[must_use]
    pub fn entries(&self) -> &[(&'static str, Duration)] {
        &self.entries
    }

    /// Sum of all recorded stages.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.entries.iter().map(|&(_, d)| d).sum()
    }

    /// Emit the profile through the `log` facade.
    pub fn log(&self) {
        for (name, d) in &self.entries {
            log::debug!("{name:>20}: {:9.3} ms", d.as_secs_f64() * 1e3);
        }
        log::debug!(
            "{:>20}: {:9.3} ms",
            "total",
            self.total().as_secs_f64() * 1e3
        );
    }
}

impl Default for TimeProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Candidate counts from the last `detect` call.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectStats {
    /// Edge samples produced by gradient clustering.
    pub edge_points: usize,
    /// Clusters handed to the quad fitter.
    pub clusters: usize,
    /// Quads surviving the geometric filters.
    pub quads: usize,
    /// Quads whose payload matched a codeword.
    pub decoded: usize,
    /// Quads dropped by border polarity or codeword distance.
    pub rejected_decode: usize,
    /// Detections removed as duplicates.
    pub deduplicated: usize,
    /// Final emitted detections.
    pub detections: usize,
}

impl DetectStats {
    /// Emit the counters through the `log` facade.
    pub fn log(&self) {
        log::debug!(
            "edges: {}, clusters: {}, quads: {}, decoded: {}, rejected: {}, deduped: {}, detections: {}",
            self.edge_points,
            self.clusters,
            self.quads,
            self.decoded,
            self.rejected_decode,
            self.deduplicated,
            self.detections,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_accumulate_in_order() {
        let mut tp = TimeProfile::new();
        tp.stamp("first");
        tp.stamp("second");
        assert_eq!(tp.entries().len(), 2);
        assert_eq!(tp.entries()[0].0, "first");
        assert_eq!(tp.entries()[1].0, "second");
        assert!(tp.total() >= tp.entries()[0].1);
    }

    #[test]
    fn reset_clears_entries() {
        let mut tp = TimeProfile::new();
        tp.stamp("stage");
        tp.reset();
        assert!(tp.entries().is_empty());
    }
}
