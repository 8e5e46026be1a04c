use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

use futures::Future;
use parking_lot::Mutex;
use pin_project::{pin_project, pinned_drop};

use crate::dispatcher::DispatchError;
use crate::gas::NodeId;

pub(crate) type ReqResult = Result<Vec<u8>, DispatchError>;

pub(crate) struct RequestInner {
    pub(crate) id: u64,
    pub(crate) dst: NodeId,
    ready: AtomicBool,
    waker: Mutex<Option<Waker>>,
    data: Mutex<Option<ReqResult>>,
    user_handle: AtomicU8,
}

impl std::fmt::Debug for RequestInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RequestInner {{ id: {}, dst: {}, ready: {:?}, user_handle: {:?} }}",
            self.id,
            self.dst,
            self.ready.load(Ordering::Relaxed),
            self.user_handle.load(Ordering::Relaxed)
        )
    }
}

impl RequestInner {
    fn add_result(&self, data: ReqResult) {
        *self.data.lock() = Some(data);
        self.ready.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    fn user_held(&self) -> bool {
        self.user_handle.load(Ordering::SeqCst) > 0
    }
}

/// Outstanding requests issued by one node, keyed by request id.
///
/// Each entry is counted in the world wide in-flight counter until its reply is received.
#[derive(Debug)]
pub(crate) struct RequestTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Arc<RequestInner>>>,
    inflight: Arc<AtomicUsize>,
}

impl RequestTable {
    pub(crate) fn new(inflight: Arc<AtomicUsize>) -> RequestTable {
        RequestTable {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            inflight,
        }
    }

    /// Reserve an id for a request about to be sent to `dst`.
    ///
    /// A `held` request starts with the caller's handle reference already taken, so a reply that
    /// races ahead of [InvokeHandle::pending] is still delivered to the caller rather than logged.
    pub(crate) fn issue(&self, dst: NodeId, held: bool) -> Arc<RequestInner> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Arc::new(RequestInner {
            id,
            dst,
            ready: AtomicBool::new(false),
            waker: Mutex::new(None),
            data: Mutex::new(None),
            user_handle: AtomicU8::new(held as u8),
        });
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(id, req.clone());
        req
    }

    /// Retire a request that never left this node
    pub(crate) fn cancel(&self, id: u64) {
        if self.pending.lock().remove(&id).is_some() {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn complete(&self, id: u64, data: ReqResult) {
        let req = self.pending.lock().remove(&id);
        match req {
            Some(req) => {
                if let Err(e) = &data {
                    if !req.user_held() {
                        tracing::warn!("request {} to node {} failed: {}", id, req.dst, e);
                    }
                }
                req.add_result(data);
                self.inflight.fetch_sub(1, Ordering::SeqCst);
            }
            None => tracing::error!("reply for unknown request {}", id),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

#[derive(Debug)]
enum HandleState {
    Ready(Option<ReqResult>),
    Pending(Arc<RequestInner>),
}

/// A handle to a request whose result is produced on (possibly) another node.
///
/// Awaiting the handle yields the raw result bytes; dropping it does not cancel the request.
#[derive(Debug)]
#[must_use = "dropping the handle detaches the request, failures are only logged"]
#[pin_project(PinnedDrop)]
pub struct InvokeHandle {
    state: HandleState,
}

#[pinned_drop]
impl PinnedDrop for InvokeHandle {
    fn drop(self: Pin<&mut Self>) {
        if let HandleState::Pending(req) = &self.state {
            req.user_handle.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl InvokeHandle {
    // takes over the reference reserved by `RequestTable::issue(_, true)`
    pub(crate) fn pending(req: Arc<RequestInner>) -> InvokeHandle {
        InvokeHandle {
            state: HandleState::Pending(req),
        }
    }

    pub(crate) fn ready(data: ReqResult) -> InvokeHandle {
        InvokeHandle {
            state: HandleState::Ready(Some(data)),
        }
    }

    /// Whether the result is available without suspending
    pub fn is_ready(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Pending(req) => req.ready.load(Ordering::SeqCst),
        }
    }
}

impl Future for InvokeHandle {
    type Output = Result<Vec<u8>, DispatchError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.state {
            HandleState::Ready(data) => match data.take() {
                Some(data) => Poll::Ready(data),
                None => Poll::Ready(Err(DispatchError::Consumed)),
            },
            HandleState::Pending(req) => {
                let mut waker = req.waker.lock();
                if req.ready.load(Ordering::SeqCst) {
                    drop(waker);
                    match req.data.lock().take() {
                        Some(data) => Poll::Ready(data),
                        None => Poll::Ready(Err(DispatchError::Consumed)),
                    }
                } else {
                    *waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

/// Acknowledgement of a one-sided operation (LCO set/signal, memput).
///
/// Awaiting it is the synchronous form; dropping it is fire-and-forget with failures logged.
#[derive(Debug)]
#[must_use = "dropping the handle detaches the request, failures are only logged"]
#[pin_project]
pub struct AckHandle {
    #[pin]
    inner: InvokeHandle,
}

impl AckHandle {
    pub(crate) fn new(inner: InvokeHandle) -> AckHandle {
        AckHandle { inner }
    }

    pub(crate) fn ready(res: Result<(), DispatchError>) -> AckHandle {
        AckHandle {
            inner: InvokeHandle::ready(res.map(|_| vec![])),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

impl Future for AckHandle {
    type Output = Result<(), DispatchError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx).map(|res| res.map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn completion_wakes_and_retires() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let table = RequestTable::new(inflight.clone());
        let req = table.issue(1, true);
        let mut handle = InvokeHandle::pending(req.clone());
        assert!((&mut handle).now_or_never().is_none());
        assert_eq!(inflight.load(Ordering::SeqCst), 1);
        table.complete(req.id, Ok(vec![4, 2]));
        assert!(handle.is_ready());
        assert_eq!(handle.now_or_never(), Some(Ok(vec![4, 2])));
        assert_eq!(inflight.load(Ordering::SeqCst), 0);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn cancel_only_retires_once() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let table = RequestTable::new(inflight.clone());
        let req = table.issue(0, false);
        table.cancel(req.id);
        table.cancel(req.id);
        assert_eq!(inflight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn early_failure_reaches_the_caller() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let table = RequestTable::new(inflight.clone());
        let req = table.issue(2, true);
        assert!(req.user_held());
        table.complete(req.id, Err(DispatchError::Unreachable(2)));
        let handle = InvokeHandle::pending(req.clone());
        assert_eq!(handle.now_or_never(), Some(Err(DispatchError::Unreachable(2))));
        assert!(!req.user_held());

        let detached = table.issue(2, false);
        assert!(!detached.user_held());
        table.complete(detached.id, Ok(vec![]));
        assert_eq!(inflight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ack_discards_payload() {
        let ack = AckHandle::ready(Err(DispatchError::Unreachable(3)));
        assert_eq!(ack.now_or_never(), Some(Err(DispatchError::Unreachable(3))));
        let ack = AckHandle::new(InvokeHandle::ready(Ok(vec![1])));
        assert_eq!(ack.now_or_never(), Some(Ok(())));
    }
}
