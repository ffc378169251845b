//! # Per-sample orchestration
//!
//! [`NativeStackSampler`] owns everything needed to sample one target thread:
//! its [`ThreadDelegate`], the session's [`ModuleRegistry`], an [`Unwinder`]
//! and the walker. One sample is:
//!
//! ```text
//! suspend ─▶ registers ─▶ bounds ─▶ annotate ─▶ copy ─▶ resume ─▶ log ─▶ walk
//!          └──────────── suspension window ─────────────┘
//! ```
//!
//! Inside the window nothing allocates, logs or locks. Failures there are a
//! `Copy` [`CaptureError`] carried out of the window and logged after resume.

use crate::capture::{check_bounds, copy_stack, RegisterContext, StackBuffer, StackExtent};
use crate::domain::CaptureError;
use crate::modules::{ModuleLoader, ModuleRegistry};
use crate::suspend::{ScopedSuspendThread, ThreadDelegate};
use crate::unwind::trampoline::signal_trampoline_range;
use crate::unwind::{StackWalker, Unwinder, WalkEnd};
use log::{debug, trace};
use stacksnap_common::{Module, Sample, SampleAnnotation};

/// Callback stamping per-sample context onto the annotation
///
/// Runs while the target is suspended: it must not allocate, log or lock.
pub type SampleAnnotator = Box<dyn Fn(&mut SampleAnnotation) + Send>;

/// Observation points for tests
pub trait SamplerTestHook: Send {
    /// Called after the target resumed, before the copy is walked
    fn on_pre_stack_walk(&mut self) {}
}

/// Samples one thread with platform primitives `D`, `L` and `U`
pub struct NativeStackSampler<D, L, U>
where
    D: ThreadDelegate,
    L: ModuleLoader,
    U: Unwinder,
{
    delegate: D,
    registry: ModuleRegistry<L>,
    unwinder: U,
    walker: StackWalker,
    stack_base: usize,
    annotator: Option<SampleAnnotator>,
    test_hook: Option<Box<dyn SamplerTestHook>>,
}

impl<D, L, U> NativeStackSampler<D, L, U>
where
    D: ThreadDelegate,
    L: ModuleLoader,
    U: Unwinder,
{
    pub fn new(delegate: D, loader: L, unwinder: U) -> Self {
        let stack_base = delegate.stack_base_address();
        Self {
            delegate,
            registry: ModuleRegistry::new(loader),
            unwinder,
            walker: StackWalker::new(signal_trampoline_range()),
            stack_base,
            annotator: None,
            test_hook: None,
        }
    }

    #[must_use]
    pub fn with_annotator(mut self, annotator: SampleAnnotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// Install or remove the annotation callback
    pub fn set_annotator(&mut self, annotator: Option<SampleAnnotator>) {
        self.annotator = annotator;
    }

    pub fn set_test_hook(&mut self, hook: Box<dyn SamplerTestHook>) {
        self.test_hook = Some(hook);
    }

    #[must_use]
    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Highest address (exclusive) of the target's stack, read once at construction
    #[must_use]
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    /// Modules resolved so far in this session
    #[must_use]
    pub fn modules(&self) -> &[Module] {
        self.registry.modules()
    }

    /// Start a session: forget resolved modules and unwind caches
    pub fn profile_recording_starting(&mut self) {
        self.registry.reset();
        self.unwinder.reset();
    }

    /// Take one sample of the target into `sample`
    ///
    /// `sample` is cleared first. On success it holds the walked frames, leaf
    /// first, and the annotation stamped during suspension.
    ///
    /// # Errors
    ///
    /// Returns the [`CaptureError`] that dropped this tick; `sample` is then
    /// empty. The target has been resumed either way.
    pub fn record_stack_sample(
        &mut self,
        buffer: &mut StackBuffer,
        sample: &mut Sample,
    ) -> Result<WalkEnd, CaptureError> {
        sample.clear();

        let mut context = RegisterContext::new();
        let captured = capture_suspended(
            &self.delegate,
            self.stack_base,
            self.annotator.as_deref(),
            &mut context,
            buffer,
            &mut sample.annotation,
        );

        // Resumed; logging is allowed again.
        let extent = match captured {
            Ok(extent) => extent,
            Err(err) => {
                debug!("Sample dropped: {err}");
                sample.clear();
                return Err(err);
            }
        };
        trace!(
            "Copied {} bytes of stack {} (sp {:#x})",
            extent.original.len(),
            extent.original,
            extent.original.start
        );

        if let Some(hook) = self.test_hook.as_mut() {
            hook.on_pre_stack_walk();
        }

        let stack = extent.view(buffer);
        let end = self.walker.walk(
            &context,
            &stack,
            &mut self.registry,
            &mut self.unwinder,
            &mut sample.frames,
        );
        trace!("Walked {} frames ({end:?})", sample.frames.len());
        Ok(end)
    }

    /// End a session and hand over its module list
    pub fn profile_recording_stopped(&mut self) -> Vec<Module> {
        self.registry.take_modules()
    }
}

/// Everything that happens while the target is frozen
#[allow(unsafe_code)] // copy_stack reads the frozen thread's stack
fn capture_suspended<D: ThreadDelegate>(
    delegate: &D,
    stack_base: usize,
    annotator: Option<&(dyn Fn(&mut SampleAnnotation) + Send)>,
    context: &mut RegisterContext,
    buffer: &mut StackBuffer,
    annotation: &mut SampleAnnotation,
) -> Result<StackExtent, CaptureError> {
    let guard = ScopedSuspendThread::new(delegate);
    if !guard.was_successful() {
        return Err(CaptureError::SuspendFailed);
    }
    if !delegate.thread_context(context) {
        return Err(CaptureError::ContextUnavailable);
    }
    check_bounds(context.stack_pointer(), stack_base, buffer.size())?;

    if let Some(annotate) = annotator {
        annotate(annotation);
    }

    // SAFETY: the guard keeps the target frozen, so `[sp, stack_base)` is
    // readable and stable until it drops.
    unsafe { copy_stack(context, stack_base, buffer) }
}

#[cfg(any(target_os = "linux", target_os = "macos", all(windows, target_arch = "x86_64")))]
mod native {
    use super::NativeStackSampler;
    use crate::domain::SamplerError;
    use crate::modules::NativeModuleLoader;
    use crate::suspend::{NativeThreadDelegate, SamplingThreadToken};
    use crate::unwind::NativeUnwinder;

    /// Sampler wired to this platform's primitives
    pub type DefaultStackSampler = NativeStackSampler<NativeThreadDelegate, NativeModuleLoader, NativeUnwinder>;

    impl DefaultStackSampler {
        /// Sampler for the thread `token` describes
        ///
        /// # Errors
        ///
        /// Fails if the platform suspension primitive cannot be set up for
        /// the thread (signal handler installation, thread handle).
        pub fn for_thread(token: SamplingThreadToken) -> Result<Self, SamplerError> {
            let delegate = NativeThreadDelegate::new(token)?;
            Ok(Self::new(delegate, NativeModuleLoader::new(), NativeUnwinder::new()))
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", all(windows, target_arch = "x86_64")))]
pub use native::DefaultStackSampler;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::FixedModuleLoader;
    use crate::suspend::tests::CountingDelegate;
    use crate::unwind::FramePointerUnwinder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_sampler(
        delegate: CountingDelegate,
    ) -> NativeStackSampler<CountingDelegate, FixedModuleLoader, FramePointerUnwinder> {
        NativeStackSampler::new(delegate, FixedModuleLoader::default(), FramePointerUnwinder::new())
    }

    #[test]
    fn test_failed_suspend_yields_empty_sample() {
        let mut sampler = counting_sampler(CountingDelegate::default());
        let mut buffer = StackBuffer::new(1024);
        let mut sample = Sample::new();
        sample.frames.push(stacksnap_common::Frame::new(1, stacksnap_common::ModuleIndex(0)));

        let result = sampler.record_stack_sample(&mut buffer, &mut sample);

        assert_eq!(result, Err(CaptureError::SuspendFailed));
        assert!(sample.is_empty());
        assert_eq!(sampler.delegate.resumes.get(), 0);
    }

    #[test]
    fn test_context_failure_still_resumes() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut sampler = counting_sampler(CountingDelegate { allow_suspend: true, ..Default::default() })
            .with_annotator(Box::new(move |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            }));
        let mut buffer = StackBuffer::new(1024);
        let mut sample = Sample::new();

        let result = sampler.record_stack_sample(&mut buffer, &mut sample);

        assert_eq!(result, Err(CaptureError::ContextUnavailable));
        assert!(sample.is_empty());
        assert_eq!(sampler.delegate.suspends.get(), 1);
        assert_eq!(sampler.delegate.resumes.get(), 1);
        // Annotation runs only once the capture is known to proceed.
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_session_reset_clears_modules() {
        let mut sampler = counting_sampler(CountingDelegate::default());
        sampler.profile_recording_starting();
        assert!(sampler.modules().is_empty());
        assert!(sampler.profile_recording_stopped().is_empty());
    }
}
