//! Single-burst sampling driver
//!
//! Takes up to `samples_per_profile` samples at a fixed rate on the calling
//! thread and assembles them into one [`CallStackProfile`]. Ticks are
//! scheduled from the burst start, so a slow walk shortens the next wait
//! instead of shifting every later sample.

use crate::capture::StackBuffer;
use crate::modules::ModuleLoader;
use crate::profile::{CallStackProfile, ProfileBuilder};
use crate::sampler::NativeStackSampler;
use crate::suspend::ThreadDelegate;
use crate::unwind::Unwinder;
use log::{debug, info};
use stacksnap_common::Sample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep between stop-flag checks
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingParams {
    /// Wait before the first sample
    pub initial_delay: Duration,
    /// Spacing between sample starts
    pub sampling_interval: Duration,
    pub samples_per_profile: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            sampling_interval: Duration::from_millis(100),
            samples_per_profile: 300,
        }
    }
}

/// Run one burst against `sampler`'s target
///
/// Returns early (with the samples taken so far) once `stop` is set. The
/// sampler's annotator is replaced by the builder's for the burst and
/// removed afterwards.
pub fn collect_profile<D, L, U>(
    sampler: &mut NativeStackSampler<D, L, U>,
    buffer: &mut StackBuffer,
    params: &SamplingParams,
    stop: &AtomicBool,
) -> CallStackProfile
where
    D: ThreadDelegate,
    L: ModuleLoader,
    U: Unwinder,
{
    let mut builder = ProfileBuilder::new();
    sampler.set_annotator(Some(builder.annotator()));
    sampler.profile_recording_starting();

    if !sleep_until(Instant::now() + params.initial_delay, stop) {
        debug!("Stopped during initial delay");
    }

    let start = Instant::now();
    let mut sample = Sample::new();
    for tick in 0..params.samples_per_profile {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let due = start + params.sampling_interval.saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX));
        if !sleep_until(due, stop) {
            break;
        }

        // A failed capture still occupies its tick, as an empty sample.
        if sampler.record_stack_sample(buffer, &mut sample).is_err() {
            builder.on_sample_dropped();
        }
        builder.on_sample_completed(std::mem::take(&mut sample));
    }
    let duration = start.elapsed();

    sampler.set_annotator(None);
    let modules = sampler.profile_recording_stopped();
    let profile = builder.on_profile_completed(modules, duration, params.sampling_interval);
    info!(
        "Collected {} samples ({} dropped, {} modules) in {:.1?}",
        profile.sample_count(),
        profile.dropped_samples,
        profile.modules.len(),
        duration
    );
    profile
}

/// Sleep until `deadline`; false if `stop` was set first
fn sleep_until(deadline: Instant, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::FixedModuleLoader;
    use crate::suspend::tests::CountingDelegate;
    use crate::capture::RegisterContext;
    use crate::unwind::FramePointerUnwinder;
    use std::cell::Cell;

    #[test]
    fn test_defaults() {
        let params = SamplingParams::default();
        assert_eq!(params.initial_delay, Duration::ZERO);
        assert_eq!(params.sampling_interval, Duration::from_millis(100));
        assert_eq!(params.samples_per_profile, 300);
    }

    #[test]
    fn test_failed_ticks_leave_empty_samples() {
        let mut sampler = NativeStackSampler::new(
            CountingDelegate::default(),
            FixedModuleLoader::default(),
            FramePointerUnwinder::new(),
        );
        let mut buffer = StackBuffer::new(1024);
        let params = SamplingParams {
            initial_delay: Duration::ZERO,
            sampling_interval: Duration::from_millis(1),
            samples_per_profile: 5,
        };

        let profile = collect_profile(&mut sampler, &mut buffer, &params, &AtomicBool::new(false));

        assert_eq!(profile.sample_count(), 5);
        assert!(profile.samples.iter().all(|sample| sample.frames.is_empty()));
        assert_eq!(profile.dropped_samples, 5);
        assert_eq!(profile.sampling_period, Duration::from_millis(1));
    }

    /// Suspends on even ticks only; the register read always fails
    #[derive(Default)]
    struct AlternatingDelegate {
        attempts: Cell<u32>,
    }

    impl ThreadDelegate for AlternatingDelegate {
        fn suspend(&self) -> bool {
            let attempt = self.attempts.get();
            self.attempts.set(attempt + 1);
            attempt % 2 == 0
        }

        fn resume(&self) -> bool {
            true
        }

        fn thread_context(&self, _context: &mut RegisterContext) -> bool {
            false
        }

        fn stack_base_address(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_one_sample_per_tick_whatever_fails() {
        let mut sampler = NativeStackSampler::new(
            AlternatingDelegate::default(),
            FixedModuleLoader::default(),
            FramePointerUnwinder::new(),
        );
        let mut buffer = StackBuffer::new(1024);
        let params = SamplingParams {
            initial_delay: Duration::ZERO,
            sampling_interval: Duration::from_millis(1),
            samples_per_profile: 4,
        };

        let profile = collect_profile(&mut sampler, &mut buffer, &params, &AtomicBool::new(false));

        assert_eq!(sampler.delegate().attempts.get(), 4);
        assert_eq!(profile.sample_count(), 4);
        assert_eq!(profile.dropped_samples, 4);
    }

    #[test]
    fn test_stop_flag_ends_burst_immediately() {
        let mut sampler = NativeStackSampler::new(
            CountingDelegate { allow_suspend: true, ..Default::default() },
            FixedModuleLoader::default(),
            FramePointerUnwinder::new(),
        );
        let mut buffer = StackBuffer::new(1024);
        let params = SamplingParams { initial_delay: Duration::from_secs(60), ..SamplingParams::default() };

        let started = Instant::now();
        let profile = collect_profile(&mut sampler, &mut buffer, &params, &AtomicBool::new(true));

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(profile.sample_count() + profile.dropped_samples, 0);
    }
}
