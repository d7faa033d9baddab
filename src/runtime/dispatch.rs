//! Completion pairs bridging a host thread back to the caller.
//!
//! [`channel`] returns a [`Dispatch`] that the host thread invokes exactly
//! once, and a [`Pending`] the caller awaits or blocks on.

use crate::runtime::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub fn channel<T>() -> (Dispatch<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Dispatch { tx }, Pending { rx })
}

/// Sending half. Consumed by [`dispatch`](Self::dispatch); dropping it
/// without dispatching resolves the pending side to [`Error::Abandoned`].
#[must_use = "a dispatcher that is dropped abandons its pending result"]
pub struct Dispatch<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Dispatch<T> {
    pub fn dispatch(self, value: T) {
        // The receiver may already be gone; nobody is waiting then.
        let _ = self.tx.send(value);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, usable as a future or through [`wait`](Self::wait).
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Block the calling thread until the value is dispatched.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.map_err(|_| Error::Abandoned))
    }
}
