//! Linux thread "suspension" by signal parking
//!
//! Linux offers no way to stop one thread of the own process from another.
//! Instead the sampler sends `SIGURG` to the target with `tgkill`; the handler,
//! running on the target, publishes its `ucontext_t` and spins until the
//! sampler releases it. While parked the target executes nothing but the spin
//! loop, which lives on the stack *below* the interrupted stack pointer, so
//! `[sp, stack_base)` is frozen for the copy.
//!
//! ## Slot state machine
//!
//! ```text
//! IDLE ──sampler──▶ REQUESTED ──handler──▶ PARKING ──▶ PARKED
//!   ▲                   │                                 │
//!   │◀──── timeout ─────┘                    sampler: RELEASED
//!   │                                                     │
//!   └──────────────────── handler leaves ◀────────────────┘
//! ```
//!
//! The slot packs the target tid next to the state in one word, so the
//! handler claims a request only if it is addressed to its own thread. The
//! slot is process-wide: at most one thread is parked at a time, and a
//! second sampler racing for it simply gets a failed suspend.
//!
//! `SIGURG` is ignored by default and only raised for out-of-band socket
//! data, which makes it safe to claim. The handler restores `errno` and
//! ignores deliveries not addressed to the current target.

#![allow(unsafe_code)] // signal handling and pthread stack queries

use super::ThreadDelegate;
use crate::capture::RegisterContext;
use crate::domain::{SamplerError, Tid};
use log::debug;
use std::io;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub(crate) const PARK_SIGNAL: libc::c_int = libc::SIGURG;
const PARK_SIGNAL_NAME: &str = "SIGURG";

/// How long an unanswered park request stays open
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const PARKING: u8 = 2;
const PARKED: u8 = 3;
const RELEASED: u8 = 4;

/// Slot word: target tid in the upper bits, state in the low byte
const IDLE_SLOT: u64 = pack(0, IDLE);

static SLOT: AtomicU64 = AtomicU64::new(IDLE_SLOT);
static SLOT_CONTEXT: AtomicPtr<libc::ucontext_t> = AtomicPtr::new(std::ptr::null_mut());

/// Identity of a thread that can be sampled
///
/// Must be created on the thread it describes, then handed to the sampling
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingThreadToken {
    tid: Tid,
    stack_base: usize,
}

impl SamplingThreadToken {
    /// Describe the calling thread
    ///
    /// # Errors
    ///
    /// Fails if the pthread stack attributes of the calling thread cannot be
    /// read.
    pub fn current() -> Result<Self, SamplerError> {
        let tid = current_tid();
        let stack_base = current_stack_base()
            .ok_or(SamplerError::StackBoundsUnavailable(Tid(tid.unsigned_abs())))?;
        Ok(Self { tid: Tid(tid.unsigned_abs()), stack_base })
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Highest address (exclusive) of the thread's stack
    #[must_use]
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }
}

/// Parks one target thread through [`PARK_SIGNAL`]
#[derive(Debug)]
pub struct LinuxThreadDelegate {
    token: SamplingThreadToken,
}

impl LinuxThreadDelegate {
    /// # Errors
    ///
    /// Fails if the park signal handler cannot be installed.
    pub fn new(token: SamplingThreadToken) -> Result<Self, SamplerError> {
        install_park_handler()?;
        debug!("Sampling {} (stack base 0x{:x})", token.tid, token.stack_base);
        Ok(Self { token })
    }

    fn target(&self) -> libc::pid_t {
        libc::pid_t::try_from(self.token.tid.0).unwrap_or(0)
    }
}

#[allow(clippy::cast_sign_loss)]
const fn pack(tid: libc::pid_t, state: u8) -> u64 {
    ((tid as u32 as u64) << 8) | state as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn state_of(slot: u64) -> u8 {
    slot as u8
}

/// Move `slot` from REQUESTED to PARKING if the request names `tid`
fn claim(slot: &AtomicU64, tid: libc::pid_t) -> bool {
    slot.compare_exchange(pack(tid, REQUESTED), pack(tid, PARKING), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl ThreadDelegate for LinuxThreadDelegate {
    fn suspend(&self) -> bool {
        let target = self.target();
        // The handler would park the only thread able to release it.
        if target == current_tid() {
            debug!("Refusing to park the sampling thread itself");
            return false;
        }
        if SLOT
            .compare_exchange(IDLE_SLOT, pack(target, REQUESTED), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let sent = unsafe {
            libc::syscall(libc::SYS_tgkill, libc::getpid(), target, PARK_SIGNAL)
        } == 0;
        let deadline = if sent { Instant::now() + PARK_TIMEOUT } else { Instant::now() };

        await_parked(target, deadline)
    }

    fn resume(&self) -> bool {
        let released = pack(self.target(), RELEASED);
        if SLOT
            .compare_exchange(pack(self.target(), PARKED), released, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // The handler returns the slot to IDLE once it stops touching it.
        while SLOT.load(Ordering::Acquire) == released {
            std::hint::spin_loop();
        }
        true
    }

    fn thread_context(&self, context: &mut RegisterContext) -> bool {
        if SLOT.load(Ordering::Acquire) != pack(self.target(), PARKED) {
            return false;
        }
        let ucontext = SLOT_CONTEXT.load(Ordering::Acquire);
        if ucontext.is_null() {
            return false;
        }
        // The handler keeps the ucontext alive until it leaves PARKED.
        unsafe { read_mcontext(&(*ucontext).uc_mcontext, context) };
        true
    }

    fn stack_base_address(&self) -> usize {
        self.token.stack_base
    }
}

/// Wait for the handler to park, cancelling the request at `deadline`
fn await_parked(target: libc::pid_t, deadline: Instant) -> bool {
    let requested = pack(target, REQUESTED);
    loop {
        match state_of(SLOT.load(Ordering::Acquire)) {
            PARKED => return true,
            REQUESTED if Instant::now() >= deadline => {
                if SLOT
                    .compare_exchange(requested, IDLE_SLOT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return false;
                }
            }
            _ => {}
        }
        std::thread::yield_now();
    }
}

pub(crate) fn install_park_handler() -> Result<(), SamplerError> {
    static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();

    let result = INSTALLED.get_or_init(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = park_handler as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        // Block everything else while parked.
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(PARK_SIGNAL, &action, std::ptr::null_mut()) == 0 {
            debug!("Installed {PARK_SIGNAL_NAME} park handler");
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        }
    });

    result.map_err(|errno| SamplerError::SignalHandlerInstallFailed {
        signal: PARK_SIGNAL_NAME,
        source: io::Error::from_raw_os_error(errno),
    })
}

extern "C" fn park_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let saved_errno = unsafe { *libc::__errno_location() };

    let tid = current_tid();
    if claim(&SLOT, tid) {
        SLOT_CONTEXT.store(ucontext.cast(), Ordering::Release);
        SLOT.store(pack(tid, PARKED), Ordering::Release);

        while SLOT.load(Ordering::Acquire) != pack(tid, RELEASED) {
            unsafe { libc::sched_yield() };
        }

        SLOT_CONTEXT.store(std::ptr::null_mut(), Ordering::Release);
        SLOT.store(IDLE_SLOT, Ordering::Release);
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

/// Kernel thread id of the caller (async-signal-safe)
fn current_tid() -> libc::pid_t {
    #[allow(clippy::cast_possible_truncation)]
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    tid
}

fn current_stack_base() -> Option<usize> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || stack_addr.is_null() {
            return None;
        }
        Some(stack_addr as usize + stack_size)
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn read_mcontext(mcontext: &libc::mcontext_t, context: &mut RegisterContext) {
    use gimli::X86_64;

    let reg = |index: libc::c_int| mcontext.gregs[index as usize] as usize;

    context.set(X86_64::RAX, reg(libc::REG_RAX));
    context.set(X86_64::RDX, reg(libc::REG_RDX));
    context.set(X86_64::RCX, reg(libc::REG_RCX));
    context.set(X86_64::RBX, reg(libc::REG_RBX));
    context.set(X86_64::RSI, reg(libc::REG_RSI));
    context.set(X86_64::RDI, reg(libc::REG_RDI));
    context.set(X86_64::RBP, reg(libc::REG_RBP));
    context.set(X86_64::RSP, reg(libc::REG_RSP));
    context.set(X86_64::R8, reg(libc::REG_R8));
    context.set(X86_64::R9, reg(libc::REG_R9));
    context.set(X86_64::R10, reg(libc::REG_R10));
    context.set(X86_64::R11, reg(libc::REG_R11));
    context.set(X86_64::R12, reg(libc::REG_R12));
    context.set(X86_64::R13, reg(libc::REG_R13));
    context.set(X86_64::R14, reg(libc::REG_R14));
    context.set(X86_64::R15, reg(libc::REG_R15));
    context.set_instruction_pointer(reg(libc::REG_RIP));
}

#[cfg(target_arch = "aarch64")]
#[allow(clippy::cast_possible_truncation)]
fn read_mcontext(mcontext: &libc::mcontext_t, context: &mut RegisterContext) {
    for (number, &value) in (0u16..).zip(mcontext.regs.iter()) {
        context.set(gimli::Register(number), value as usize);
    }
    context.set_stack_pointer(mcontext.sp as usize);
    context.set_instruction_pointer(mcontext.pc as usize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::ScopedSuspendThread;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};

    #[test]
    fn test_token_describes_current_thread() {
        let token = SamplingThreadToken::current().unwrap();
        let local = 0u8;
        let local_address = std::ptr::addr_of!(local) as usize;

        assert!(token.stack_base() > local_address);
        assert_eq!(token.tid().0, current_tid().unsigned_abs());
    }

    #[test]
    fn test_park_and_release_spinning_thread() {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let worker_stop = Arc::clone(&stop);
        let worker = std::thread::spawn(move || {
            tx.send(SamplingThreadToken::current().unwrap()).unwrap();
            let mut counter = 0u64;
            while !worker_stop.load(Ordering::Relaxed) {
                counter = std::hint::black_box(counter.wrapping_add(1));
            }
            counter
        });

        let token = rx.recv().unwrap();
        let delegate = LinuxThreadDelegate::new(token).unwrap();
        {
            let guard = ScopedSuspendThread::new(&delegate);
            assert!(guard.was_successful());

            let mut context = RegisterContext::new();
            assert!(delegate.thread_context(&mut context));
            assert!(context.stack_pointer() < token.stack_base());
            assert_ne!(context.instruction_pointer(), 0);
        }

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        assert_eq!(state_of(SLOT.load(Ordering::Acquire)), IDLE);
    }

    #[test]
    fn test_request_claimed_only_by_its_target() {
        let slot = AtomicU64::new(pack(4242, REQUESTED));

        assert!(!claim(&slot, 4243));
        assert_eq!(slot.load(Ordering::Acquire), pack(4242, REQUESTED));

        assert!(claim(&slot, 4242));
        assert_eq!(slot.load(Ordering::Acquire), pack(4242, PARKING));
        assert!(!claim(&slot, 4242));
    }

    #[test]
    fn test_idle_slot_cannot_be_claimed() {
        let slot = AtomicU64::new(IDLE_SLOT);
        assert!(!claim(&slot, current_tid()));
        assert_eq!(state_of(slot.load(Ordering::Acquire)), IDLE);
    }

    #[test]
    fn test_refuses_to_suspend_calling_thread() {
        let delegate = LinuxThreadDelegate::new(SamplingThreadToken::current().unwrap()).unwrap();

        let started = Instant::now();
        assert!(!delegate.suspend());
        assert!(started.elapsed() < PARK_TIMEOUT);
        assert!(!delegate.resume());
    }
}
