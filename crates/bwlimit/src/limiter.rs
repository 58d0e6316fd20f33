//! Pairing a read and a write scheduler into one connection-class budget.

use std::sync::Arc;

use futures::task::Spawn;
use tor_rtcompat::SleepProvider;

use crate::clock::Clock;
use crate::provider::LimitedProvider;
use crate::scheduler::{Direction, Scheduler};
use crate::stream::LimitedStream;
use crate::Result;

/// One read-direction and one write-direction [`Scheduler`] representing a
/// single connection-class budget.
///
/// Cloning a `Limiter` yields another handle to the same budget; identity
/// (as used for double-wrap suppression, see
/// [`LimitedProvider::also_limited`]) is handle identity, tested with
/// [`same_as`](Limiter::same_as).  When the last handle is dropped —
/// counting the streams and providers decorated with it — both schedulers
/// are stopped.
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct Limiter {
    /// The shared scheduler pair.
    shared: Arc<Pair>,
}

/// The schedulers owned by a [`Limiter`].
#[derive(Debug)]
struct Pair {
    /// Scheduler for data read from the peer.
    reads: Scheduler,
    /// Scheduler for data written to the peer.
    writes: Scheduler,
}

impl Drop for Pair {
    fn drop(&mut self) {
        // Last handle gone: shut the background tasks down.  Stopping is
        // idempotent, so an explicit earlier stop is fine.
        self.reads.stop();
        self.writes.stop();
    }
}

impl Limiter {
    /// Create a limiter on the process-wide shared clock.
    ///
    /// `read_limit` and `write_limit` are in bytes per second; zero
    /// disables limiting for that direction.
    pub fn new<R>(runtime: &R, read_limit: u64, write_limit: u64) -> Result<Self>
    where
        R: SleepProvider + Spawn,
    {
        let clock = Clock::shared(runtime)?;
        Self::with_clock(runtime, &clock, read_limit, write_limit)
    }

    /// Create a limiter driven by `clock`.
    ///
    /// Use this when a private clock is wanted: isolation in tests, or a
    /// group of limiters with a lifetime of its own.
    pub fn with_clock<R: Spawn>(
        runtime: &R,
        clock: &Clock,
        read_limit: u64,
        write_limit: u64,
    ) -> Result<Self> {
        Ok(Limiter {
            shared: Arc::new(Pair {
                reads: Scheduler::new(runtime, clock, Direction::Read, read_limit)?,
                writes: Scheduler::new(runtime, clock, Direction::Write, write_limit)?,
            }),
        })
    }

    /// Return the scheduler for the read direction.
    pub fn reads(&self) -> &Scheduler {
        &self.shared.reads
    }

    /// Return the scheduler for the write direction.
    pub fn writes(&self) -> &Scheduler {
        &self.shared.writes
    }

    /// Stop both schedulers.
    ///
    /// Every transfer blocked on either direction is released; see
    /// [`Scheduler::stop`].  Each stop is independently idempotent.
    pub fn stop(&self) {
        self.shared.reads.stop();
        self.shared.writes.stop();
    }

    /// Attach this limiter to every connection opened or accepted through
    /// `inner`.
    ///
    /// To layer several limiters onto one provider, chain with
    /// [`LimitedProvider::also_limited`], which skips limiters that are
    /// already attached.
    pub fn wrap<P>(&self, inner: P) -> LimitedProvider<P> {
        LimitedProvider::new(inner, self.clone())
    }

    /// Route the reads and writes of `stream` through this limiter.
    pub fn limit_stream<S>(&self, stream: S) -> LimitedStream<S> {
        LimitedStream::new(stream, std::slice::from_ref(self))
    }

    /// Return true if `self` and `other` are handles to the same budget.
    pub fn same_as(&self, other: &Limiter) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tor_rtmock::MockRuntime;

    #[test]
    fn stop_stops_both_directions() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 100, 100).unwrap();

            limiter.stop();
            limiter.stop();

            assert!(limiter.reads().is_stopped());
            assert!(limiter.writes().is_stopped());
        });
    }

    #[test]
    fn dropping_the_last_handle_stops_the_schedulers() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 100, 100).unwrap();
            let reads = limiter.reads().clone();

            let clone = limiter.clone();
            drop(limiter);
            assert!(!reads.is_stopped());

            drop(clone);
            assert!(reads.is_stopped());
        });
    }

    #[test]
    fn identity_is_per_budget_not_per_handle() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let l1 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();
            let l2 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();

            assert!(l1.same_as(&l1.clone()));
            assert!(!l1.same_as(&l2));
        });
    }
}
