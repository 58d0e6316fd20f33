//! Per-direction token-bucket scheduling and rate measurement.

use std::cmp;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::poll_fn;
use futures::task::{Spawn, SpawnExt};
use futures::{pin_mut, FutureExt, SinkExt, Stream};
use oneshot_fused_workaround as oneshot;
use postage::dispatch;
use tracing::debug;

use crate::clock::{Clock, TICKS_PER_SECOND};
use crate::{Error, Result};

/// Upper bound on the size of a single grant, in bytes.
///
/// Keeps individual transfers small even under very large limits, so that
/// enforcement keeps its tick-level granularity instead of letting one
/// consumer run far ahead of the meter.
pub const GRANT_MAX: u64 = 1024;

/// The traffic direction a [`Scheduler`] governs.
///
/// The direction decides what a short transfer means: a read shorter than
/// requested says "no more data available right now" and ends the call,
/// while a write is expected to drain its whole buffer or explain why not.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Direction {
    /// Data flowing from the peer to us.
    Read,
    /// Data flowing from us to the peer.
    Write,
}

/// A token-bucket scheduler and rate meter for one traffic direction.
///
/// A scheduler turns a mutable bytes/sec [`limit`](Scheduler::limit) into
/// per-tick byte budgets, handed to consumers as bounded-size grants
/// through a token queue.  Unused grant remainder is reclaimed into later
/// budgets, and a trailing one-second [`rate`](Scheduler::rate) is
/// recomputed every tick.  One background task per scheduler mints the
/// budgets; it runs from construction until [`stop`](Scheduler::stop), the
/// clock stopping, or the last handle going away.
///
/// Cloning yields another handle to the same scheduler.  Any number of
/// consumers may call the consumption methods concurrently: the queue
/// hands each grant to exactly one of them, with no fairness guarantee
/// beyond that.
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct Scheduler {
    /// State shared with the background task and every clone.
    state: Arc<State>,
    /// Consumer endpoint of the grant queue.
    #[educe(Debug(ignore))]
    queue: dispatch::Receiver<u64>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Scheduler {
            state: Arc::clone(&self.state),
            queue: self.queue.clone(),
        }
    }
}

/// Shared scheduler state.
///
/// Everything here is updated with atomic operations; no lock is held
/// across a transfer.
#[derive(educe::Educe)]
#[educe(Debug)]
struct State {
    /// Configured limit in bytes per second.  Zero disables limiting.
    limit: AtomicU64,
    /// Measured throughput over the trailing second.
    rate: AtomicU64,
    /// Lifetime transferred bytes.
    count: AtomicU64,
    /// Bytes transferred since the last tick boundary.
    tick_bytes: AtomicU64,
    /// Unused grant remainder returned by consumers, reclaimed into the
    /// next budget the task minting sees.
    avail: AtomicU64,
    /// Set once `stop` has been called (or the clock died).
    stopped: AtomicBool,
    /// Which direction this scheduler governs.
    direction: Direction,
    /// Signal used to shut down the background task.  Consumed by `stop`.
    #[educe(Debug(ignore))]
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// Convert a buffer length to `u64`.
pub(crate) fn to_u64(x: usize) -> u64 {
    x.try_into().expect("failed usize to u64 conversion")
}

/// Convert a grant to a buffer length, saturating if `usize` is smaller.
pub(crate) fn to_usize_saturating(x: u64) -> usize {
    x.try_into().unwrap_or(usize::MAX)
}

impl Scheduler {
    /// Create a new scheduler and spawn its background task on `runtime`.
    ///
    /// The task mints one budget per tick of `clock` until the scheduler
    /// or the clock is stopped.
    pub fn new<R: Spawn>(
        runtime: &R,
        clock: &Clock,
        direction: Direction,
        limit: u64,
    ) -> Result<Self> {
        let (tx, rx) = dispatch::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let state = Arc::new(State {
            limit: AtomicU64::new(limit),
            rate: AtomicU64::new(0),
            count: AtomicU64::new(0),
            tick_bytes: AtomicU64::new(0),
            avail: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            direction,
            stop: Mutex::new(Some(stop_tx)),
        });
        runtime
            .spawn(run(Arc::clone(&state), clock.clone(), tx, stop_rx))
            .map_err(|e| Error::from_spawn("bandwidth scheduler task", e))?;
        Ok(Scheduler { state, queue: rx })
    }

    /// Return the direction this scheduler governs.
    pub fn direction(&self) -> Direction {
        self.state.direction
    }

    /// Return the configured limit in bytes per second (zero = unlimited).
    pub fn limit(&self) -> u64 {
        self.state.limit.load(Ordering::Relaxed)
    }

    /// Set the limit in bytes per second; zero disables limiting.
    ///
    /// Safe to call from any thread at any time.  The scheduler samples
    /// the limit once per tick, so a change takes effect at the next tick
    /// boundary, never mid-tick.
    pub fn set_limit(&self, limit: u64) {
        self.state.limit.store(limit, Ordering::Relaxed);
    }

    /// Return the measured throughput over the trailing second, in
    /// bytes per second.
    pub fn rate(&self) -> u64 {
        self.state.rate.load(Ordering::Relaxed)
    }

    /// Return the lifetime number of transferred bytes.
    pub fn count(&self) -> u64 {
        self.state.count.load(Ordering::Relaxed)
    }

    /// Return true once [`stop`](Scheduler::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Stop the scheduler.
    ///
    /// The first call shuts down the background task and closes the grant
    /// queue, releasing every consumer currently blocked on a grant; they
    /// observe end-of-stream.  Further calls, from any number of threads,
    /// are no-ops.  Consumption with a zero limit never touches the queue
    /// and is unaffected.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            if let Some(tx) = self.state.stop.lock().expect("poisoned lock").take() {
                let _ = tx.send(());
            }
        }
    }

    /// Record `done` transferred bytes in the lifetime and per-tick
    /// counters.
    pub(crate) fn record(&self, done: usize) {
        let done = to_u64(done);
        self.state.count.fetch_add(done, Ordering::Relaxed);
        self.state.tick_bytes.fetch_add(done, Ordering::Relaxed);
    }

    /// Return the unused portion of a grant for the task to reclaim.
    pub(crate) fn refund(&self, unused: u64) {
        if unused > 0 {
            self.state.avail.fetch_add(unused, Ordering::Relaxed);
        }
    }

    /// Poll the grant queue for one grant.
    ///
    /// `Ready(None)` means the scheduler has stopped; a grant still
    /// sitting in the queue when `stop` was called is discarded here too,
    /// so stopping takes effect even for tokens already minted.
    pub(crate) fn poll_grant(&mut self, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        match Pin::new(&mut self.queue).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(_)) if self.is_stopped() => Poll::Ready(None),
            Poll::Ready(grant) => Poll::Ready(grant),
        }
    }

    /// Transfer up to `buf.len()` bytes through `transfer`, enforcing this
    /// scheduler's limit.
    ///
    /// `transfer` is a poll-style read primitive: it is handed sub-slices
    /// of `buf` no larger than the current grant, and reports how many
    /// bytes it produced.  The returned future blocks while waiting for
    /// budget.  The call ends at the first short read (the source has no
    /// more data right now — which includes the source's end-of-stream,
    /// an ordinary `Ok(0)`), when `buf` is full, or on an error with no
    /// prior progress.  A stopped scheduler reads as end-of-stream.
    ///
    /// An empty `buf` returns `Ok(0)` immediately, without touching the
    /// scheduler.  While the limit is zero, the whole remaining buffer is
    /// handed to `transfer` in a single call; the result still feeds the
    /// byte counters so `rate` and `count` stay accurate.  The limit is
    /// sampled afresh on every iteration of the loop.
    pub async fn consume_read<F>(&self, mut transfer: F, buf: &mut [u8]) -> IoResult<usize>
    where
        F: FnMut(&mut Context<'_>, &mut [u8]) -> Poll<IoResult<usize>>,
    {
        debug_assert_eq!(self.state.direction, Direction::Read);
        if buf.is_empty() {
            return Ok(0);
        }
        let mut this = self.clone();
        let mut grant: Option<u64> = None;
        let mut n = 0_usize;
        poll_fn(|cx| loop {
            if n == buf.len() {
                return Poll::Ready(Ok(n));
            }
            if this.limit() == 0 {
                // Unlimited: hand the rest of the buffer straight to the
                // transfer, still recording the bytes for telemetry.
                return match transfer(cx, &mut buf[n..]) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(done)) => {
                        this.record(done);
                        Poll::Ready(Ok(n + done))
                    }
                    Poll::Ready(Err(e)) if n == 0 => Poll::Ready(Err(e)),
                    Poll::Ready(Err(_)) => Poll::Ready(Ok(n)),
                };
            }
            let g = match grant.take() {
                Some(g) => g,
                None => match this.poll_grant(cx) {
                    Poll::Pending => return Poll::Pending,
                    // Stopped: end-of-stream, surfacing whatever already
                    // arrived in this call.
                    Poll::Ready(None) => return Poll::Ready(Ok(n)),
                    Poll::Ready(Some(g)) => g,
                },
            };
            let todo = cmp::min(to_usize_saturating(g), buf.len() - n);
            match transfer(cx, &mut buf[n..n + todo]) {
                Poll::Pending => {
                    // Keep the grant for the retry: the budget stays
                    // claimed while the transfer is in flight.
                    grant = Some(g);
                    return Poll::Pending;
                }
                Poll::Ready(Ok(done)) => {
                    this.refund(g.saturating_sub(to_u64(done)));
                    this.record(done);
                    n += done;
                    if done < todo {
                        // Short read: nothing more available right now.
                        return Poll::Ready(Ok(n));
                    }
                }
                Poll::Ready(Err(e)) => {
                    this.refund(g);
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Ready(Err(e))
                    };
                }
            }
        })
        .await
    }

    /// Transfer all of `buf` through `transfer`, enforcing this
    /// scheduler's limit.
    ///
    /// The write-direction counterpart of
    /// [`consume_read`](Scheduler::consume_read): the call keeps going
    /// until the whole buffer has been accepted or an error occurs.  A
    /// stopped scheduler fails the write with [`Error::Stopped`] (as an
    /// `io::Error`) even when part of the buffer was already written,
    /// since an incomplete write is itself a failure; a transfer that
    /// accepts no bytes without reporting an error fails with
    /// [`WriteZero`](std::io::ErrorKind::WriteZero).
    ///
    /// Empty-buffer and zero-limit behavior are as for `consume_read`.
    pub async fn consume_write<F>(&self, mut transfer: F, buf: &[u8]) -> IoResult<usize>
    where
        F: FnMut(&mut Context<'_>, &[u8]) -> Poll<IoResult<usize>>,
    {
        debug_assert_eq!(self.state.direction, Direction::Write);
        if buf.is_empty() {
            return Ok(0);
        }
        let mut this = self.clone();
        let mut grant: Option<u64> = None;
        let mut n = 0_usize;
        poll_fn(|cx| loop {
            if n == buf.len() {
                return Poll::Ready(Ok(n));
            }
            if this.limit() == 0 {
                return match transfer(cx, &buf[n..]) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(done)) => {
                        this.record(done);
                        Poll::Ready(Ok(n + done))
                    }
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                };
            }
            let g = match grant.take() {
                Some(g) => g,
                None => match this.poll_grant(cx) {
                    Poll::Pending => return Poll::Pending,
                    // An unfinished write is a failure no matter how far
                    // it got.
                    Poll::Ready(None) => return Poll::Ready(Err(Error::Stopped.into())),
                    Poll::Ready(Some(g)) => g,
                },
            };
            let todo = cmp::min(to_usize_saturating(g), buf.len() - n);
            match transfer(cx, &buf[n..n + todo]) {
                Poll::Pending => {
                    grant = Some(g);
                    return Poll::Pending;
                }
                Poll::Ready(Ok(0)) => {
                    this.refund(g);
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(done)) => {
                    this.refund(g.saturating_sub(to_u64(done)));
                    this.record(done);
                    n += done;
                }
                Poll::Ready(Err(e)) => {
                    this.refund(g);
                    return Poll::Ready(Err(e));
                }
            }
        })
        .await
    }
}

/// Drive a scheduler: one budget per clock tick.
async fn run(
    state: Arc<State>,
    clock: Clock,
    mut tx: dispatch::Sender<u64>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!(direction = ?state.direction, "bandwidth scheduler started");
    let mut ring = [0_u64; TICKS_PER_SECOND];
    let mut slot = 0_usize;
    loop {
        let mut tick = clock.wait_for_tick();
        let mut ticked = false;
        let mut clock_dead = false;
        let limit = state.limit.load(Ordering::Relaxed);
        if limit > 0 {
            let mut todo = cmp::max(1, limit / TICKS_PER_SECOND as u64)
                .saturating_add(state.avail.swap(0, Ordering::Relaxed));
            let grant = cmp::min(GRANT_MAX, todo);
            while todo >= grant && !ticked {
                let offer = tx.send(grant);
                pin_mut!(offer);
                let mut offer = offer.fuse();
                futures::select! {
                    r = offer => match r {
                        Ok(()) => {
                            todo -= grant;
                            // Unused allowance returned by consumers goes
                            // back into this tick's remaining budget.
                            todo = todo.saturating_add(state.avail.swap(0, Ordering::Relaxed));
                        }
                        // Every consumer handle is gone.
                        Err(_) => return,
                    },
                    r = tick => {
                        ticked = true;
                        clock_dead = r.is_err();
                    }
                    _ = stop_rx => return,
                }
            }
        }
        if !ticked {
            futures::select! {
                r = tick => clock_dead = r.is_err(),
                _ = stop_rx => return,
            }
        }
        if clock_dead {
            debug!(direction = ?state.direction, "clock stopped; shutting down scheduler");
            state.stopped.store(true, Ordering::SeqCst);
            return;
        }
        if state.stopped.load(Ordering::SeqCst) {
            return;
        }
        // Rate bookkeeping: fold this tick's bytes into the ring and
        // publish the trailing-second sum.
        ring[slot] = state.tick_bytes.swap(0, Ordering::Relaxed);
        slot = (slot + 1) % TICKS_PER_SECOND;
        state.rate.store(ring.iter().sum::<u64>(), Ordering::Relaxed);
    }
}
