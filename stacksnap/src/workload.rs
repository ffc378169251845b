//! Built-in sampling target
//!
//! A thread that recurses to a fixed depth and spins at the bottom until
//! told to stop, so its stack has a known shape. Used by the CLI demo and
//! the live sampling tests.

use crate::domain::SamplerError;
use crate::suspend::SamplingThreadToken;
use crossbeam_channel::bounded;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A running workload thread
pub struct Workload {
    token: SamplingThreadToken,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl Workload {
    /// Spawn the thread and wait until it has described itself
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot create its [`SamplingThreadToken`] or
    /// cannot be spawned.
    pub fn spawn(depth: usize) -> Result<Self, SamplerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(1);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new().name("stacksnap-workload".into()).spawn(move || {
            let token = SamplingThreadToken::current();
            let ok = token.is_ok();
            let _ = tx.send(token);
            if ok {
                recurse(depth, &thread_stop)
            } else {
                0
            }
        })?;

        let token = rx
            .recv()
            .map_err(|_| SamplerError::Io(std::io::Error::other("workload thread exited early")))??;
        Ok(Self { token, stop, handle: Some(handle) })
    }

    #[must_use]
    pub fn token(&self) -> SamplingThreadToken {
        self.token
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[inline(never)]
fn recurse(depth: usize, stop: &AtomicBool) -> u64 {
    if depth == 0 {
        return spin(stop);
    }
    // The addition after the call keeps this from becoming a tail call.
    black_box(recurse(black_box(depth - 1), stop)) + 1
}

#[inline(never)]
fn spin(stop: &AtomicBool) -> u64 {
    let mut acc = 0u64;
    while !stop.load(Ordering::Relaxed) {
        for i in 0..1_000u64 {
            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_stop() {
        let workload = Workload::spawn(4).expect("spawn workload");
        assert_ne!(workload.token().stack_base(), 0);
        workload.stop();
    }
}
