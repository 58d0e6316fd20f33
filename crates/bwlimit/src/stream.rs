//! Decorating async streams so that their transfers consume grants.

use std::cmp;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use tor_rtcompat::StreamOps;

use crate::limiter::Limiter;
use crate::scheduler::{to_u64, to_usize_saturating, Scheduler};
use crate::Error;

/// Grant-acquisition state for one limiter in one direction.
#[derive(educe::Educe)]
#[educe(Debug)]
struct Flow {
    /// Handle on the scheduler (carries its own queue endpoint).
    sched: Scheduler,
    /// A grant received but not yet spent, kept across `Pending` polls.
    grant: Option<u64>,
}

/// Outcome of readying one flow for a transfer.
enum FlowReady {
    /// Transfer may proceed; `Some(n)` caps it at `n` bytes.
    Go(Option<u64>),
    /// The scheduler has stopped.
    Stopped,
}

impl Flow {
    /// Make sure a grant is held if the scheduler enforces a limit.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<FlowReady> {
        if self.sched.limit() == 0 {
            // Unlimited right now: return any held grant so that budget is
            // not stranded if the limit was just cleared.
            if let Some(g) = self.grant.take() {
                self.sched.refund(g);
            }
            return Poll::Ready(FlowReady::Go(None));
        }
        if let Some(g) = self.grant {
            return Poll::Ready(FlowReady::Go(Some(g)));
        }
        match self.sched.poll_grant(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(FlowReady::Stopped),
            Poll::Ready(Some(g)) => {
                self.grant = Some(g);
                Poll::Ready(FlowReady::Go(Some(g)))
            }
        }
    }

    /// Settle accounts after a transfer of `done` bytes.
    fn settle(&mut self, done: usize) {
        if let Some(g) = self.grant.take() {
            self.sched.refund(g.saturating_sub(to_u64(done)));
        }
        self.sched.record(done);
    }

    /// Give a held grant back untouched (the transfer failed).
    fn abandon(&mut self) {
        if let Some(g) = self.grant.take() {
            self.sched.refund(g);
        }
    }
}

/// A stream decorator that routes reads and writes through the schedulers
/// of every limiter attached to it.
///
/// Obtained from [`Limiter::limit_stream`], or by connecting through a
/// [`LimitedProvider`](crate::LimitedProvider).  The decorator holds the
/// inner stream and forwards everything it does not meter — `poll_flush`,
/// `poll_close`, and [`StreamOps`] — explicitly to it.
///
/// Reads on a stopped limiter behave like a remote-closed stream
/// (`Ok(0)`); writes fail with [`Error::Stopped`] as an IO error.  A poll
/// that has already transferred some bytes when it would otherwise block
/// reports the partial progress, per the `AsyncRead`/`AsyncWrite`
/// contracts; grants acquired but not yet spent are kept for the next
/// poll.
#[pin_project]
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct LimitedStream<S> {
    /// The stream whose transfers are being metered.
    #[educe(Debug(ignore))]
    #[pin]
    inner: S,
    /// Read-direction flows, one per attached limiter.
    reads: Vec<Flow>,
    /// Write-direction flows, one per attached limiter.
    writes: Vec<Flow>,
}

impl<S> LimitedStream<S> {
    /// Wrap `inner`, metering it against every limiter in `limiters`.
    pub(crate) fn new(inner: S, limiters: &[Limiter]) -> Self {
        LimitedStream {
            inner,
            reads: limiters
                .iter()
                .map(|l| Flow {
                    sched: l.reads().clone(),
                    grant: None,
                })
                .collect(),
            writes: limiters
                .iter()
                .map(|l| Flow {
                    sched: l.writes().clone(),
                    grant: None,
                })
                .collect(),
        }
    }

    /// Return a reference to the inner stream.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for LimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let mut this = self.project();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut n = 0_usize;
        loop {
            // A transfer needs a grant from every limited flow, and is
            // capped by the smallest one.
            let mut todo = buf.len() - n;
            for flow in this.reads.iter_mut() {
                match flow.poll_ready(cx) {
                    Poll::Pending => {
                        return if n > 0 {
                            Poll::Ready(Ok(n))
                        } else {
                            Poll::Pending
                        };
                    }
                    // Stopped: reads see an ordinary end-of-stream.
                    Poll::Ready(FlowReady::Stopped) => return Poll::Ready(Ok(n)),
                    Poll::Ready(FlowReady::Go(Some(g))) => {
                        todo = cmp::min(todo, to_usize_saturating(g));
                    }
                    Poll::Ready(FlowReady::Go(None)) => {}
                }
            }
            match this.inner.as_mut().poll_read(cx, &mut buf[n..n + todo]) {
                Poll::Pending => {
                    // Held grants stay claimed while the inner stream is
                    // not ready.
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Pending
                    };
                }
                Poll::Ready(Ok(done)) => {
                    for flow in this.reads.iter_mut() {
                        flow.settle(done);
                    }
                    n += done;
                    if done < todo || n == buf.len() {
                        // Short read: nothing more available right now.
                        return Poll::Ready(Ok(n));
                    }
                }
                Poll::Ready(Err(e)) => {
                    for flow in this.reads.iter_mut() {
                        flow.abandon();
                    }
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Ready(Err(e))
                    };
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let mut this = self.project();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut n = 0_usize;
        loop {
            let mut todo = buf.len() - n;
            for flow in this.writes.iter_mut() {
                match flow.poll_ready(cx) {
                    Poll::Pending => {
                        return if n > 0 {
                            Poll::Ready(Ok(n))
                        } else {
                            Poll::Pending
                        };
                    }
                    // A write on a stopped limiter is a failure.
                    Poll::Ready(FlowReady::Stopped) => {
                        return if n > 0 {
                            Poll::Ready(Ok(n))
                        } else {
                            Poll::Ready(Err(Error::Stopped.into()))
                        };
                    }
                    Poll::Ready(FlowReady::Go(Some(g))) => {
                        todo = cmp::min(todo, to_usize_saturating(g));
                    }
                    Poll::Ready(FlowReady::Go(None)) => {}
                }
            }
            match this.inner.as_mut().poll_write(cx, &buf[n..n + todo]) {
                Poll::Pending => {
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Pending
                    };
                }
                Poll::Ready(Ok(0)) => {
                    for flow in this.writes.iter_mut() {
                        flow.abandon();
                    }
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()))
                    };
                }
                Poll::Ready(Ok(done)) => {
                    for flow in this.writes.iter_mut() {
                        flow.settle(done);
                    }
                    n += done;
                    if n == buf.len() {
                        return Poll::Ready(Ok(n));
                    }
                }
                Poll::Ready(Err(e)) => {
                    for flow in this.writes.iter_mut() {
                        flow.abandon();
                    }
                    return if n > 0 {
                        Poll::Ready(Ok(n))
                    } else {
                        Poll::Ready(Err(e))
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl<S: StreamOps> StreamOps for LimitedStream<S> {
    fn set_tcp_notsent_lowat(&self, notsent_lowat: u32) -> IoResult<()> {
        self.inner.set_tcp_notsent_lowat(notsent_lowat)
    }

    fn new_handle(&self) -> Box<dyn StreamOps + Send + Unpin> {
        self.inner.new_handle()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::clock::TICK_INTERVAL;
    use crate::Clock;
    use futures::task::SpawnExt;
    use futures::{AsyncReadExt, AsyncWriteExt, FutureExt};
    use std::time::Duration;
    use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
    use tor_rtcompat::SleepProvider;
    use tor_rtmock::MockRuntime;

    /// Spawn a task driving mock time forward `ticks` ticks.
    fn drive(rt: &MockRuntime, ticks: u32) {
        let rt2 = rt.clone();
        rt.spawn(async move {
            for _ in 0..ticks * 2 {
                rt2.progress_until_stalled().await;
                rt2.advance_by(TICK_INTERVAL / 2).await;
            }
        })
        .unwrap();
    }

    #[test]
    fn paces_writes_through_a_pipe() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 0, 100).unwrap();
            drive(&rt, 5);

            let (w, r) = tokio::io::duplex(1000);
            let mut writer = limiter.limit_stream(w.compat_write());
            let mut reader = r.compat();

            let start = rt.now();
            writer.write_all(&[9_u8; 25]).await.unwrap();
            let elapsed = rt.now().saturating_duration_since(start);

            // 10 bytes per tick: the last 5 bytes need the third tick.
            assert!(
                elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(400),
                "elapsed {elapsed:?}"
            );
            assert_eq!(limiter.writes().count(), 25);

            let mut buf = [0_u8; 25];
            reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [9_u8; 25]);
        });
    }

    #[test]
    fn read_after_stop_is_eof() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 100, 0).unwrap();

            let (near, far) = tokio::io::duplex(1000);
            let mut limited = limiter.limit_stream(near.compat());
            let mut far = far.compat();

            // Put 30 bytes on the wire, unmetered.
            far.write_all(&[5_u8; 30]).await.unwrap();
            rt.progress_until_stalled().await;

            let mut buf = [0_u8; 10];
            assert_eq!(limited.read(&mut buf).await.unwrap(), 10);

            limiter.stop();
            rt.progress_until_stalled().await;

            // Data is still buffered in the pipe, but the limiter is gone:
            // the stream looks remotely closed.
            assert_eq!(limited.read(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn write_after_stop_is_an_error() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 0, 100).unwrap();

            let (near, _far) = tokio::io::duplex(1000);
            let mut limited = limiter.limit_stream(near.compat_write());

            limiter.stop();
            rt.progress_until_stalled().await;

            let err = limited.write_all(&[1_u8; 10]).await.unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        });
    }

    #[test]
    fn empty_transfers_bypass_the_scheduler() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let limiter = Limiter::with_clock(&rt, &clock, 100, 100).unwrap();

            let (near, _far) = tokio::io::duplex(1000);
            let mut limited = limiter.limit_stream(near.compat());

            // No budget has been minted yet and none is needed.
            assert_eq!(
                limited.read(&mut []).now_or_never().unwrap().unwrap(),
                0
            );
            assert_eq!(limited.write(&[]).now_or_never().unwrap().unwrap(), 0);
        });
    }

    #[test]
    fn chained_limiters_all_account() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let l1 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();
            let l2 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();

            let (near, _far) = tokio::io::duplex(1000);
            // l2 layered around l1's output: traffic through the outer
            // layer is seen by the inner one as well.
            let mut limited = l2.limit_stream(l1.limit_stream(near.compat_write()));

            limited.write_all(&[2_u8; 500]).await.unwrap();

            assert_eq!(l1.writes().count(), 500);
            assert_eq!(l2.writes().count(), 500);
            assert!(l1.writes().count() >= l2.writes().count());
        });
    }
}
