//! The burst rate limiter contract shared by every limiter in the crate.
//!
//! A limiter hands out [`Acquire`] futures. `acquire()` never blocks: it returns at once with a
//! future that is either already resolved or parked on the limiter's FIFO queue. Whoever
//! resolves a parked future (a throttle task granting permission, or `close()` cancelling it)
//! does so exactly once, through a oneshot channel.

use crate::RateLimitError;
use pin_project::pin_project;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Common interface of the global limiter, windowed limiters and REST buckets.
pub trait BurstRateLimiter: Send + Sync + fmt::Debug {
    /// Name used in logs and in [`RateLimitError::Closed`].
    fn name(&self) -> &str;

    /// Request permission to perform one rate limited operation.
    ///
    /// Returns immediately. The returned future resolves to `Ok(())` once the caller may
    /// proceed, or to [`RateLimitError::Closed`] if the limiter is closed first. Must be called
    /// from within a Tokio runtime, since it may start a background throttle task.
    fn acquire(&self) -> Acquire;

    /// Cancel every pending acquisition and mark the limiter unusable. Idempotent.
    fn close(&self);

    /// `true` if no acquisition is waiting on this limiter.
    fn is_empty(&self) -> bool;

    /// `true` once [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

#[pin_project(project = AcquireStateProj)]
#[derive(Debug)]
enum AcquireState {
    Ready(Option<Result<(), RateLimitError>>),
    Pending {
        limiter: Arc<str>,
        #[pin]
        rx: oneshot::Receiver<()>,
    },
}

/// Permission handle returned by [`BurstRateLimiter::acquire`].
///
/// Dropping it before it resolves gives up the place in the queue; the slot is skipped without
/// consuming any of the limiter's budget.
#[pin_project]
#[derive(Debug)]
#[must_use = "permission is only granted once the Acquire future resolves"]
pub struct Acquire {
    #[pin]
    state: AcquireState,
}

impl Acquire {
    pub(crate) fn granted() -> Self {
        Self { state: AcquireState::Ready(Some(Ok(()))) }
    }

    pub(crate) fn failed(err: RateLimitError) -> Self {
        Self { state: AcquireState::Ready(Some(Err(err))) }
    }

    fn pending(limiter: Arc<str>, rx: oneshot::Receiver<()>) -> Self {
        Self { state: AcquireState::Pending { limiter, rx } }
    }

    /// `true` if this handle was resolved at creation time, without queueing.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, AcquireState::Ready(_))
    }
}

impl Future for Acquire {
    type Output = Result<(), RateLimitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            AcquireStateProj::Ready(result) => {
                Poll::Ready(result.take().expect("Acquire polled after completion"))
            }
            AcquireStateProj::Pending { limiter, rx } => {
                rx.poll(cx).map(|granted| granted.map_err(|_| RateLimitError::closed(&**limiter)))
            }
        }
    }
}

/// Queue of pending acquisitions plus the lifecycle every burst limiter shares.
///
/// Lives inside the owning limiter's mutex; none of its methods lock anything.
#[derive(Debug, Default)]
pub(crate) struct BurstQueue {
    waiters: VecDeque<oneshot::Sender<()>>,
    throttle_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl BurstQueue {
    /// Park a new acquisition at the back of the queue.
    pub(crate) fn enqueue(&mut self, limiter: &Arc<str>) -> Acquire {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Acquire::pending(limiter.clone(), rx)
    }

    /// Resolve the head of the queue.
    ///
    /// Returns `None` when the queue is empty, `Some(false)` when the head had already been
    /// dropped by its caller, `Some(true)` when permission was delivered.
    pub(crate) fn grant_next(&mut self) -> Option<bool> {
        let waiter = self.waiters.pop_front()?;
        Some(waiter.send(()).is_ok())
    }

    /// Resolve the whole queue in FIFO order, returning how many callers were released.
    pub(crate) fn grant_all(&mut self) -> usize {
        let mut released = 0;
        while let Some(delivered) = self.grant_next() {
            if delivered {
                released += 1;
            }
        }
        released
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.iter().all(oneshot::Sender::is_closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_throttling(&self) -> bool {
        self.throttle_task.is_some()
    }

    pub(crate) fn set_throttle_task(&mut self, task: JoinHandle<()>) {
        self.throttle_task = Some(task);
    }

    pub(crate) fn take_throttle_task(&mut self) -> Option<JoinHandle<()>> {
        self.throttle_task.take()
    }

    /// Called by a throttle task on its way out. Drops abandoned waiters so a later
    /// `acquire()` starts from a clean queue.
    pub(crate) fn finish_throttle(&mut self) {
        self.waiters.retain(|tx| !tx.is_closed());
        self.throttle_task = None;
    }

    /// Abort the throttle task and cancel every waiter. Returns `false` if already closed.
    pub(crate) fn close(&mut self, limiter: &str) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        if let Some(task) = self.throttle_task.take() {
            task.abort();
        }

        let pending = self.waiters.iter().filter(|tx| !tx.is_closed()).count();
        // Dropping the senders is what resolves each Acquire to `Closed`.
        self.waiters.clear();

        if pending > 0 {
            tracing::warn!(target: "bucketeer::limiter", limiter, pending, "rate limiter closed with pending acquisitions");
        } else {
            tracing::debug!(target: "bucketeer::limiter", limiter, "rate limiter closed");
        }
        true
    }
}
