//! Decorating connection providers and listeners.

use std::io::Result as IoResult;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use pin_project::pin_project;
use tor_rtcompat::{NetStreamListener, NetStreamProvider};

use crate::limiter::Limiter;
use crate::stream::LimitedStream;

/// A connection-provider decorator that attaches one or more [`Limiter`]s
/// to every stream it opens or accepts.
///
/// Built with [`Limiter::wrap`]; further limiters are chained with
/// [`also_limited`](LimitedProvider::also_limited).  The decorator holds
/// the wrapped provider and forwards every operation through the
/// [`NetStreamProvider`] interface, wrapping the resulting streams.
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct LimitedProvider<P> {
    /// The provider whose streams are decorated.
    #[educe(Debug(ignore))]
    inner: P,
    /// Every limiter applied to this decorator, in application order.
    limiters: Vec<Limiter>,
}

impl<P> LimitedProvider<P> {
    /// Wrap `inner` with `limiter`.
    pub(crate) fn new(inner: P, limiter: Limiter) -> Self {
        LimitedProvider {
            inner,
            limiters: vec![limiter],
        }
    }

    /// Attach a further limiter to this decorator.
    ///
    /// Walks the limiters already applied and, if `limiter` is among them,
    /// returns the decorator unchanged: wrapping twice with one limiter
    /// would meter the same bytes twice against the same budget and
    /// silently halve its effective throughput.  The check is by budget
    /// identity ([`Limiter::same_as`]), so any clone of an applied limiter
    /// is recognized.
    ///
    /// The check is deliberately conservative: it only sees limiters
    /// recorded on this decorator.  A limiter hidden behind some other
    /// provider type stacked in between is not detected, and will simply
    /// keep throttling as a layer of its own.
    #[must_use]
    pub fn also_limited(mut self, limiter: &Limiter) -> Self {
        if !self.limiters.iter().any(|l| l.same_as(limiter)) {
            self.limiters.push(limiter.clone());
        }
        self
    }

    /// Return the limiters applied to this decorator, in application order.
    pub fn limiters(&self) -> &[Limiter] {
        &self.limiters
    }

    /// Return a reference to the wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P, A> NetStreamProvider<A> for LimitedProvider<P>
where
    P: NetStreamProvider<A>,
    A: Send + Sync + 'static,
{
    type Stream = LimitedStream<P::Stream>;
    type Listener = LimitedListener<P::Listener>;

    async fn connect(&self, addr: &A) -> IoResult<Self::Stream> {
        let inner = self.inner.connect(addr).await?;
        Ok(LimitedStream::new(inner, &self.limiters))
    }

    async fn listen(&self, addr: &A) -> IoResult<Self::Listener> {
        let inner = self.inner.listen(addr).await?;
        Ok(LimitedListener {
            inner,
            limiters: self.limiters.clone(),
        })
    }
}

/// A listener decorator: every accepted stream is wrapped in a
/// [`LimitedStream`].
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct LimitedListener<L> {
    /// The listener whose accepted streams are decorated.
    #[educe(Debug(ignore))]
    inner: L,
    /// Limiters to attach to each accepted stream.
    limiters: Vec<Limiter>,
}

impl<L, A> NetStreamListener<A> for LimitedListener<L>
where
    L: NetStreamListener<A>,
{
    type Stream = LimitedStream<L::Stream>;
    type Incoming = LimitedIncoming<L::Incoming>;

    fn incoming(self) -> Self::Incoming {
        LimitedIncoming {
            inner: self.inner.incoming(),
            limiters: self.limiters,
        }
    }

    fn local_addr(&self) -> IoResult<A> {
        self.inner.local_addr()
    }
}

/// Stream of accepted connections, each wrapped in a [`LimitedStream`].
#[pin_project]
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct LimitedIncoming<I> {
    /// The underlying stream of accepted connections.
    #[educe(Debug(ignore))]
    #[pin]
    inner: I,
    /// Limiters to attach to each accepted stream.
    limiters: Vec<Limiter>,
}

impl<I, S, A> Stream for LimitedIncoming<I>
where
    I: Stream<Item = IoResult<(S, A)>>,
{
    type Item = IoResult<(LimitedStream<S>, A)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok((stream, addr)))) => Poll::Ready(Some(Ok((
                LimitedStream::new(stream, this.limiters),
                addr,
            )))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::Clock;
    use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
    use tor_rtcompat::{PreferredRuntime, ToplevelBlockOn};
    use tor_rtmock::MockRuntime;

    #[test]
    fn wrapping_twice_with_one_limiter_is_a_no_op() {
        MockRuntime::test_with_various(|rt| async move {
            let clock = Clock::new(&rt).unwrap();
            let l1 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();
            let l2 = Limiter::with_clock(&rt, &clock, 0, 0).unwrap();

            let p = l1.wrap(rt.clone());
            assert_eq!(p.limiters().len(), 1);

            // Re-applying the same budget, through any clone, changes
            // nothing.
            let p = p.also_limited(&l1.clone());
            assert_eq!(p.limiters().len(), 1);

            // A different limiter chains normally, once.
            let p = p.also_limited(&l2);
            let p = p.also_limited(&l2);
            assert_eq!(p.limiters().len(), 2);
            assert!(p.limiters()[0].same_as(&l1));
            assert!(p.limiters()[1].same_as(&l2));
        });
    }

    #[test]
    fn provider_wraps_connect_and_accept() {
        let rt = PreferredRuntime::create().unwrap();
        let rt2 = rt.clone();
        rt.block_on(async move {
            let clock = Clock::new(&rt2).unwrap();
            let l1 = Limiter::with_clock(&rt2, &clock, 0, 0).unwrap();
            let l2 = Limiter::with_clock(&rt2, &clock, 0, 0).unwrap();
            let provider = l1.wrap(rt2.clone()).also_limited(&l2);

            let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
            let listener = provider.listen(&addr).await.unwrap();
            let local = listener.local_addr().unwrap();
            let mut incoming = listener.incoming();

            let (client, accepted) = futures::join!(provider.connect(&local), incoming.next());
            let mut client = client.unwrap();
            let (mut server, _peer) = accepted.unwrap().unwrap();

            client.write_all(b"hello").await.unwrap();
            let mut buf = [0_u8; 5];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");

            // Both chained limiters observed the client's write and the
            // server's read.
            assert_eq!(l1.writes().count(), 5);
            assert_eq!(l2.writes().count(), 5);
            assert!(l1.writes().count() >= l2.writes().count());
            assert_eq!(l1.reads().count(), 5);
            assert_eq!(l2.reads().count(), 5);

            l1.stop();
            l2.stop();
            clock.stop();
        });
    }
}
