//! A shared clock that drives scheduler timing.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{FusedFuture, Shared};
use futures::task::{Spawn, SpawnExt};
use futures::{pin_mut, FutureExt};
use oneshot_fused_workaround as oneshot;
use tor_rtcompat::SleepProvider;
use tracing::debug;

use crate::{Error, Result};

/// Number of scheduling ticks per second.
pub const TICKS_PER_SECOND: usize = 10;

/// Duration of one scheduling tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1000 / TICKS_PER_SECOND as u64);

/// A handle for one upcoming tick of a [`Clock`].
///
/// Becomes ready exactly once, when the next tick fires; every handle taken
/// before that tick is released at the same moment, like a broadcast on a
/// condition variable.  A handle is spent once it completes: call
/// [`Clock::wait_for_tick`] again for the tick after.
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct Tick {
    /// Broadcast endpoint for this tick.
    #[educe(Debug(ignore))]
    rx: Shared<oneshot::Receiver<()>>,
}

impl Future for Tick {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().rx.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::ClockStopped)),
        }
    }
}

impl FusedFuture for Tick {
    fn is_terminated(&self) -> bool {
        self.rx.is_terminated()
    }
}

/// A clock service producing one broadcast tick per [`TICK_INTERVAL`].
///
/// Every scheduler sharing one clock has its one-second rate window
/// phase-aligned with the others, and the timer cost is paid once for all
/// of them.  A process-wide instance is available from [`Clock::shared`];
/// construct private instances with [`Clock::new`] when isolation matters
/// (tests, or a group of limiters with its own lifetime).
///
/// Dropping a `Clock` handle does not stop the driving task; call
/// [`stop`](Clock::stop).
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct Clock {
    /// State shared with the driving task and every clone.
    #[educe(Debug(ignore))]
    inner: Arc<ClockInner>,
}

/// Callback installed with [`Clock::set_on_tick`].
type OnTickFn = Arc<dyn Fn() + Send + Sync>;

/// Inner state of a [`Clock`], shared with its driving task.
struct ClockInner {
    /// Broadcast endpoint for the next tick.
    ///
    /// Replaced wholesale at every tick: firing consumes the sender and
    /// installs a fresh pair for the tick after.
    slot: Mutex<TickSlot>,
    /// Observer invoked once per tick.
    on_tick: Mutex<Option<OnTickFn>>,
    /// Signal used to shut down the driving task.  Consumed by `stop`.
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// The sender/receiver pair behind the [`Tick`] handles for one tick.
struct TickSlot {
    /// Completing this releases every outstanding handle.  `None` once the
    /// clock has stopped.
    tx: Option<oneshot::Sender<()>>,
    /// The endpoint cloned out to handles.
    rx: Shared<oneshot::Receiver<()>>,
}

impl Clock {
    /// Create a new clock and spawn its driving task on `runtime`.
    pub fn new<R>(runtime: &R) -> Result<Self>
    where
        R: SleepProvider + Spawn,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::new(ClockInner {
            slot: Mutex::new(TickSlot {
                tx: Some(tx),
                rx: rx.shared(),
            }),
            on_tick: Mutex::new(None),
            stop: Mutex::new(Some(stop_tx)),
        });
        runtime
            .spawn(run(Arc::clone(&inner), runtime.clone(), stop_rx))
            .map_err(|e| Error::from_spawn("tick clock task", e))?;
        Ok(Clock { inner })
    }

    /// Return the process-wide shared clock, creating it on first use.
    ///
    /// The first caller's runtime hosts the driving task; later callers get
    /// handles to the same instance.  The shared clock is never stopped.
    pub fn shared<R>(runtime: &R) -> Result<Self>
    where
        R: SleepProvider + Spawn,
    {
        /// The process-wide instance, created by the first caller.
        static SHARED: Mutex<Option<Clock>> = Mutex::new(None);
        let mut guard = SHARED.lock().expect("poisoned lock");
        if let Some(clock) = &*guard {
            return Ok(clock.clone());
        }
        let clock = Clock::new(runtime)?;
        *guard = Some(clock.clone());
        Ok(clock)
    }

    /// Return a handle that resolves at the next tick.
    pub fn wait_for_tick(&self) -> Tick {
        Tick {
            rx: self.inner.slot.lock().expect("poisoned lock").rx.clone(),
        }
    }

    /// Install an observer called once per tick, replacing any previous one.
    ///
    /// Mostly useful to make timing observable in tests.
    pub fn set_on_tick<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_tick.lock().expect("poisoned lock") = Some(Arc::new(f));
    }

    /// Stop the clock.
    ///
    /// Outstanding and future [`Tick`] handles resolve with
    /// [`Error::ClockStopped`], and schedulers driven by this clock shut
    /// down as if stopped themselves.  Calling `stop` again is a no-op.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.stop.lock().expect("poisoned lock").take() {
            let _ = tx.send(());
        }
    }
}

impl ClockInner {
    /// Fire one tick: release current waiters and install the next slot.
    fn fire(&self) {
        let (tx, rx) = oneshot::channel();
        let prev = {
            let mut slot = self.slot.lock().expect("poisoned lock");
            let prev = slot.tx.replace(tx);
            slot.rx = rx.shared();
            prev
        };
        if let Some(prev) = prev {
            let _ = prev.send(());
        }
        let hook = self.on_tick.lock().expect("poisoned lock").clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Drive a clock: fire one tick per [`TICK_INTERVAL`] until stopped.
async fn run<R: SleepProvider>(
    inner: Arc<ClockInner>,
    runtime: R,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!("tick clock started");
    let mut next = runtime.now() + TICK_INTERVAL;
    loop {
        let delay = next.saturating_duration_since(runtime.now());
        let sleep = runtime.sleep(delay);
        pin_mut!(sleep);
        let mut sleep = sleep.fuse();
        futures::select! {
            () = sleep => {}
            _ = stop_rx => break,
        }
        // A late wakeup shortens the following interval instead of shifting
        // every later tick.
        next += TICK_INTERVAL;
        inner.fire();
    }
    // Dropping the pending sender resolves every outstanding handle with
    // `ClockStopped`.
    inner.slot.lock().expect("poisoned lock").tx = None;
    debug!("tick clock stopped");
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tor_rtmock::MockRuntime;

    /// Advance mock time by one tick and let every woken task run.
    async fn one_tick(rt: &MockRuntime) {
        rt.progress_until_stalled().await;
        rt.advance_by(TICK_INTERVAL).await;
        rt.progress_until_stalled().await;
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let mut t1 = clock.wait_for_tick();
            let mut t2 = clock.wait_for_tick();
            assert!((&mut t1).now_or_never().is_none());
            assert!((&mut t2).now_or_never().is_none());

            one_tick(&rt).await;

            // Both handles were released by the same tick.
            (&mut t1).now_or_never().unwrap().unwrap();
            (&mut t2).now_or_never().unwrap().unwrap();

            // A handle is spent after its tick; a fresh one waits again.
            let mut t3 = clock.wait_for_tick();
            assert!((&mut t3).now_or_never().is_none());
            one_tick(&rt).await;
            (&mut t3).now_or_never().unwrap().unwrap();
        });
    }

    #[test]
    fn on_tick_observer_fires_once_per_tick() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            clock.set_on_tick({
                let hits = Arc::clone(&hits);
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });

            rt.progress_until_stalled().await;
            assert_eq!(hits.load(Ordering::SeqCst), 0);
            for expected in 1..=3 {
                one_tick(&rt).await;
                assert_eq!(hits.load(Ordering::SeqCst), expected);
            }
        });
    }

    #[test]
    fn stop_is_idempotent_and_fails_waiters() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let mut t = clock.wait_for_tick();
            clock.stop();
            clock.stop();
            rt.progress_until_stalled().await;

            assert!(matches!(
                (&mut t).now_or_never(),
                Some(Err(Error::ClockStopped))
            ));

            // Handles requested after stop fail as well.
            let mut t2 = clock.wait_for_tick();
            assert!(matches!(
                (&mut t2).now_or_never(),
                Some(Err(Error::ClockStopped))
            ));

            // And no further ticks fire.
            one_tick(&rt).await;
            let mut t3 = clock.wait_for_tick();
            assert!(matches!(
                (&mut t3).now_or_never(),
                Some(Err(Error::ClockStopped))
            ));
        });
    }
}
