//! Profile assembly for one sampling burst
//!
//! [`ProfileBuilder`] collects completed samples and hands out the
//! [`MetadataRecorder`] the sampler calls while the target is suspended. The
//! finished [`CallStackProfile`] owns the burst's module list; every frame's
//! [`ModuleIndex`](stacksnap_common::ModuleIndex) refers into it.

use crate::sampler::SampleAnnotator;
use serde::{Deserialize, Serialize};
use stacksnap_common::{Module, Sample, SampleAnnotation};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Samples of one burst plus the modules they reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackProfile {
    pub samples: Vec<Sample>,
    pub modules: Vec<Module>,
    pub sampling_period: Duration,
    pub profile_duration: Duration,
    /// Ticks whose capture failed; each is still present as an empty sample
    pub dropped_samples: usize,
}

impl CallStackProfile {
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.samples.iter().map(|sample| sample.frames.len()).sum()
    }

    /// Frames that resolved to no module
    #[must_use]
    pub fn unknown_frame_count(&self) -> usize {
        self.samples
            .iter()
            .flat_map(|sample| &sample.frames)
            .filter(|frame| !frame.module_index.is_known())
            .count()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_depth(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.frame_count() as f64 / self.samples.len() as f64
    }
}

/// Process-wide context stamped onto samples during suspension
///
/// Atomics only: [`record_metadata`](Self::record_metadata) runs inside the
/// suspension window.
#[derive(Debug, Default)]
pub struct MetadataRecorder {
    milestones: AtomicU32,
    records: AtomicU32,
}

impl MetadataRecorder {
    /// Note that the process reached `milestone` (0-31)
    pub fn mark_milestone(&self, milestone: u32) {
        debug_assert!(milestone < u32::BITS);
        self.milestones.fetch_or(1 << milestone, Ordering::Relaxed);
    }

    /// Copy the current milestones into `annotation`
    pub fn record_metadata(&self, annotation: &mut SampleAnnotation) {
        annotation.process_milestones = self.milestones.load(Ordering::Relaxed);
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of [`record_metadata`](Self::record_metadata) calls so far
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.records.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ProfileBuilder {
    samples: Vec<Sample>,
    dropped_samples: usize,
    metadata: Arc<MetadataRecorder>,
}

impl ProfileBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metadata_recorder(&self) -> Arc<MetadataRecorder> {
        Arc::clone(&self.metadata)
    }

    /// Annotation callback for [`NativeStackSampler`](crate::sampler::NativeStackSampler)
    #[must_use]
    pub fn annotator(&self) -> SampleAnnotator {
        let metadata = Arc::clone(&self.metadata);
        Box::new(move |annotation| metadata.record_metadata(annotation))
    }

    pub fn on_sample_completed(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn on_sample_dropped(&mut self) {
        self.dropped_samples += 1;
    }

    /// Seal the burst
    #[must_use]
    pub fn on_profile_completed(
        self,
        modules: Vec<Module>,
        profile_duration: Duration,
        sampling_period: Duration,
    ) -> CallStackProfile {
        CallStackProfile {
            samples: self.samples,
            modules,
            sampling_period,
            profile_duration,
            dropped_samples: self.dropped_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stacksnap_common::{Frame, ModuleIndex};

    fn sample(depth: usize, unknown_leaf: bool) -> Sample {
        let mut sample = Sample::new();
        for i in 0..depth {
            let index = if unknown_leaf && i == 0 { ModuleIndex::UNKNOWN } else { ModuleIndex(0) };
            sample.frames.push(Frame::new(0x1000 + i, index));
        }
        sample
    }

    #[test]
    fn test_annotator_counts_and_stamps() {
        let builder = ProfileBuilder::new();
        let recorder = builder.metadata_recorder();
        recorder.mark_milestone(3);
        let annotate = builder.annotator();

        let mut annotation = SampleAnnotation::default();
        annotate(&mut annotation);
        annotate(&mut annotation);

        assert!(annotation.has_milestone(3));
        assert_eq!(recorder.record_count(), 2);
    }

    #[test]
    fn test_profile_statistics() {
        let mut builder = ProfileBuilder::new();
        builder.on_sample_completed(sample(3, false));
        builder.on_sample_completed(sample(5, true));
        builder.on_sample_dropped();

        let profile = builder.on_profile_completed(
            Vec::new(),
            Duration::from_millis(250),
            Duration::from_millis(100),
        );

        assert_eq!(profile.sample_count(), 2);
        assert_eq!(profile.frame_count(), 8);
        assert_eq!(profile.unknown_frame_count(), 1);
        assert_eq!(profile.dropped_samples, 1);
        assert!((profile.mean_depth() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_profile_depth() {
        assert!(CallStackProfile::default().mean_depth().abs() < f64::EPSILON);
    }
}
