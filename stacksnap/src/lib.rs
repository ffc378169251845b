//! # stacksnap - In-Process Stack Sampling Profiler
//!
//! stacksnap captures call stacks of another thread of the same process
//! without that thread's cooperation. The target is frozen just long enough
//! to copy its registers and live stack; the copy is then walked with the
//! platform's unwind metadata after the target is running again.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Scheduler / session driver                   │
//! └───────────────────────┬──────────────────────────────────────────┘
//!                         │ record_stack_sample(buffer, sample)
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       NativeStackSampler                         │
//! │                                                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │   Suspend    │──▶│   Capture    │──▶│    Resume    │          │
//! │  │  (delegate)  │   │ (copy+reloc) │   │   (guard)    │          │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘          │
//! │                                               ▼                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │   Module     │◀──│    Stack     │──▶│   Unwinder   │          │
//! │  │   Registry   │   │    Walker    │   │ (FP/CFI/x64) │          │
//! │  └──────────────┘   └──────────────┘   └──────────────┘          │
//! └───────────────────────┬──────────────────────────────────────────┘
//!                         │ Sample (frames + annotation)
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │          ProfileBuilder ──▶ CallStackProfile ──▶ JSON export      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`suspend`]: freeze and release one thread ([`suspend::ThreadDelegate`],
//!   [`suspend::ScopedSuspendThread`])
//!   - Linux: signal parking with `SIGURG`
//!   - macOS: Mach `thread_suspend`
//!   - Windows: `SuspendThread`, priority boost preserved
//! - [`capture`]: stack buffer, typed register context, copy and relocation
//! - [`modules`]: address to module resolution and build ids
//! - [`unwind`]: unwinders and the stack walker
//! - [`sampler`]: per-sample orchestration
//! - [`profile`] / [`session`]: burst assembly and the single-burst driver
//! - [`export`]: JSON profile output
//! - [`cli`]: command-line arguments of the `stacksnap` binary
//! - [`domain`]: core types (Tid, `AddressRange`) and error enums
//!
//! ## The Suspension Window
//!
//! Between suspend and resume the target may hold any lock in the process,
//! including the allocator's. Code running in the window therefore never
//! allocates, logs or locks: everything it needs is allocated up front and
//! failures leave it as a `Copy` [`domain::CaptureError`].
//!
//! ## Typical Usage
//!
//! ```bash
//! # Sample the built-in workload thread, 50 samples 10 ms apart
//! stacksnap --samples 50 --interval-ms 10
//!
//! # Save the profile for offline symbolization
//! stacksnap --export profile.json
//! ```

pub mod capture;
pub mod cli;
pub mod domain;
pub mod export;
pub mod modules;
pub mod profile;
pub mod sampler;
pub mod session;
pub mod suspend;
pub mod unwind;
#[cfg(any(target_os = "linux", target_os = "macos", all(windows, target_arch = "x86_64")))]
pub mod workload;
