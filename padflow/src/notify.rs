// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Deadline-bounded wait on a shared notification object.
//!
//! Producers call [`Notify::notify`] after changing state that a waiter may
//! be interested in. The waiter evaluates its predicate without holding the
//! notification lock, so the predicate is free to take any other lock. A
//! generation counter closes the gap between evaluating the predicate and
//! parking: a notification in between bumps the generation and the waiter
//! re-evaluates instead of sleeping.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Result of [`Notify::wait_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate returned true.
    Ready,
    /// The deadline passed first.
    TimedOut,
}

/// Shared wake-up object.
#[derive(Debug, Default)]
pub struct Notify {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notify {
    /// Creates a notification object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until `ready` returns true or `deadline` passes. `None` waits
    /// without deadline. Once the deadline expired the wait returns without
    /// checking the predicate again.
    pub fn wait_until(&self, deadline: Option<Instant>, mut ready: impl FnMut() -> bool) -> WaitOutcome {
        loop {
            let seen = *self.generation.lock();
            if ready() {
                return WaitOutcome::Ready;
            }
            let mut generation = self.generation.lock();
            if *generation != seen {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn times_out_when_nothing_happens() {
        let notify = Notify::new();
        let start = Instant::now();
        let outcome = notify.wait_until(Some(start + Duration::from_millis(20)), || false);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wakes_up_on_notification() {
        let notify = Arc::new(Notify::new());
        let flag = Arc::new(AtomicBool::new(false));
        let handle = {
            let (notify, flag) = (notify.clone(), flag.clone());
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
                notify.notify();
            })
        };
        let outcome = notify.wait_until(Some(Instant::now() + Duration::from_secs(10)), || {
            flag.load(Ordering::SeqCst)
        });
        assert_eq!(outcome, WaitOutcome::Ready);
        handle.join().unwrap();
    }

    #[test]
    fn past_deadline_still_checks_predicate_once() {
        let notify = Notify::new();
        let deadline = Instant::now() - Duration::from_millis(1);
        assert_eq!(notify.wait_until(Some(deadline), || true), WaitOutcome::Ready);
        assert_eq!(notify.wait_until(Some(deadline), || false), WaitOutcome::TimedOut);
    }
}
