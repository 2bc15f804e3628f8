//! Client connection deadlines
//!
//! `DeadlineIo` wraps an accepted stream and fails it with `TimedOut` when it
//! stalls:
//! - reads: no inbound byte for `read_timeout` while no request is in flight
//!   (idle keep-alive, a silent TCP connect, an idle HTTP/2 session)
//! - writes: a pending write or flush makes no progress for `write_timeout`
//!   (a client that stopped reading)
//!
//! `InFlight` is shared with the connection's service. While any request is
//! being answered, or a response body is still streaming, the read deadline
//! is suspended; a `101` response suspends it for the rest of the connection.

use crate::proxy::ProxyBody;
use http_body_util::BodyExt;
use hyper::{Response, StatusCode};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

#[derive(Debug, Default)]
struct Shared {
    count: AtomicUsize,
    /// Reader to wake when the connection turns idle
    idle_waker: Mutex<Option<Waker>>,
}

/// Count of requests a connection is currently answering
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<Shared>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a request as started
    pub fn enter(&self) -> InFlightGuard {
        self.0.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.0.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.0.count.load(Ordering::SeqCst) > 0
    }

    fn park(&self, waker: &Waker) {
        *self.0.idle_waker.lock() = Some(waker.clone());
    }
}

/// Held while a request is outstanding; dropping it ends the request
#[derive(Debug)]
pub struct InFlightGuard(Arc<Shared>);

impl InFlightGuard {
    /// Keep the request outstanding until the response body is done, or
    /// for the connection's lifetime once it switches protocols
    pub fn hold_for(self, response: Response<ProxyBody>) -> Response<ProxyBody> {
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            self.0.count.fetch_add(1, Ordering::SeqCst);
            return response;
        }

        response.map(move |body| {
            body.map_frame(move |frame| {
                let _held = &self;
                frame
            })
            .boxed()
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(waker) = self.0.idle_waker.lock().take() {
                waker.wake();
            }
        }
    }
}

/// Stream wrapper enforcing read and write stall deadlines
#[derive(Debug)]
pub struct DeadlineIo<I> {
    inner: I,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    in_flight: InFlight,
}

impl<I> DeadlineIo<I> {
    pub fn new(
        inner: I,
        read_timeout: Duration,
        write_timeout: Duration,
        in_flight: InFlight,
    ) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
            in_flight,
        }
    }

    /// Outbound progress counts as activity for the read side too
    fn wrote(&mut self) {
        self.write_deadline = None;
        if let Some(deadline) = self.read_deadline.as_mut() {
            deadline.as_mut().reset(Instant::now() + self.read_timeout);
        }
    }

    fn write_stalled(&mut self, cx: &mut Context<'_>) -> bool {
        expired(&mut self.write_deadline, self.write_timeout, cx)
    }
}

/// Arm `slot` if needed and report whether it has fired
fn expired(slot: &mut Option<Pin<Box<Sleep>>>, timeout: Duration, cx: &mut Context<'_>) -> bool {
    let deadline = slot.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    deadline.as_mut().poll(cx).is_ready()
}

fn timed_out(what: &str, after: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("client {} stalled for {:?}", what, after),
    )
}

impl<I: AsyncRead + Unpin> AsyncRead for DeadlineIo<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        match polled {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                // Park before checking so a request finishing in between
                // still re-polls this read and arms the deadline
                this.in_flight.park(cx.waker());
                if this.in_flight.is_busy() {
                    this.read_deadline = None;
                    return Poll::Pending;
                }

                if expired(&mut this.read_deadline, this.read_timeout, cx) {
                    this.read_deadline = None;
                    return Poll::Ready(Err(timed_out("read", this.read_timeout)));
                }
                Poll::Pending
            }
        }
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for DeadlineIo<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        match polled {
            Poll::Ready(result) => {
                this.wrote();
                Poll::Ready(result)
            }
            Poll::Pending if this.write_stalled(cx) => {
                Poll::Ready(Err(timed_out("write", this.write_timeout)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        match polled {
            Poll::Ready(result) => {
                this.wrote();
                Poll::Ready(result)
            }
            Poll::Pending if this.write_stalled(cx) => {
                Poll::Ready(Err(timed_out("write", this.write_timeout)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        match polled {
            Poll::Ready(result) => {
                this.wrote();
                Poll::Ready(result)
            }
            Poll::Pending if this.write_stalled(cx) => {
                Poll::Ready(Err(timed_out("write", this.write_timeout)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
