//! Local control objects: synchronization primitives counting arrivals from concurrent invocations.
//!
//! Every LCO lives on the node that created it and is addressed globally by an [LcoAddr].
//! It is created with a fixed expected arrival count and moves `Pending -> Complete` exactly once,
//! when the count is reached. Three kinds are provided:
//! - [AndGate]: fires after `expected` signals, carries no payload
//! - [Reduction]: folds `expected` payloads into an accumulator seeded by a reset operator
//! - [FutureLco]: completes on a single set and holds that value
//!
//! Arrivals are accepted from any node, either through the typed handles, through
//! [NodeHandle::lco_signal][crate::NodeHandle::lco_signal]/[lco_set][crate::NodeHandle::lco_set],
//! or implicitly when an invocation carrying the LCO as its completion target finishes.
//! A failed invocation still counts as an arrival but is recorded as a failure, which `wait` then reports.
use futures::Future;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::gas::NodeId;

pub(crate) mod handle;
pub use handle::{AndGate, FutureLco, Reduction};

/// Global name of a control object: owning node plus per-node id
#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct LcoAddr {
    pub(crate) node: NodeId,
    pub(crate) id: u64,
}

impl LcoAddr {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl std::fmt::Display for LcoAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "lco[node {} id {}]", self.node, self.id)
    }
}

/// Errors raised by control object operations
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LcoError {
    /// signal/set after the object completed
    OverflowSignal { addr: LcoAddr, expected: usize },
    /// `get` before completion
    NotReady { arrived: usize, expected: usize },
    /// `delete` while waiters or arrivals are outstanding
    ObjectInUse { waiters: usize, outstanding: usize },
    /// the operation does not apply to this kind of object
    KindMismatch { addr: LcoAddr, kind: LcoKind },
    /// the object was deleted (or never existed)
    Deleted(LcoAddr),
    /// the object completed but some arrivals were failures
    FailedArrivals { addr: LcoAddr, causes: Vec<String> },
}

impl std::fmt::Display for LcoError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LcoError::OverflowSignal { addr, expected } => write!(
                f,
                "{} already received all {} expected arrivals",
                addr, expected
            ),
            LcoError::NotReady { arrived, expected } => {
                write!(f, "not complete: {} of {} arrivals", arrived, expected)
            }
            LcoError::ObjectInUse {
                waiters,
                outstanding,
            } => write!(
                f,
                "object in use: {} waiters, {} arrivals outstanding",
                waiters, outstanding
            ),
            LcoError::KindMismatch { addr, kind } => {
                write!(f, "operation not supported by {:?} {}", kind, addr)
            }
            LcoError::Deleted(addr) => write!(f, "{} has been deleted", addr),
            LcoError::FailedArrivals { addr, causes } => {
                write!(f, "{} completed with {} failed arrivals", addr, causes.len())?;
                for cause in causes {
                    write!(f, "\n  {}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LcoError {}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcoKind {
    AndGate,
    Reduction,
    Future,
}

/// One arrival at a control object
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub(crate) enum Arrival {
    Signal,
    Set(#[serde(with = "serde_bytes")] Vec<u8>),
    Failed(String),
}

/// Type erased reduction accumulator
pub(crate) trait Accumulator: Send {
    fn combine(&mut self, incoming: &[u8]) -> anyhow::Result<()>;
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct TypedAccumulator<T> {
    pub(crate) value: T,
    pub(crate) combine: Box<dyn Fn(&mut T, &T) + Send + Sync>,
}

impl<T> Accumulator for TypedAccumulator<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    fn combine(&mut self, incoming: &[u8]) -> anyhow::Result<()> {
        let incoming: T = crate::deserialize(incoming)?;
        (self.combine)(&mut self.value, &incoming);
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Holds the single value of a future
pub(crate) struct Slot<T> {
    pub(crate) value: Option<T>,
}

impl<T> Accumulator for Slot<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    fn combine(&mut self, incoming: &[u8]) -> anyhow::Result<()> {
        self.value = Some(crate::deserialize(incoming)?);
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct LcoState {
    arrived: usize,
    failures: Vec<String>,
    payload: Option<Box<dyn Accumulator>>,
    wakers: Vec<Waker>,
    deleted: bool,
}

pub(crate) struct LcoInner {
    addr: LcoAddr,
    kind: LcoKind,
    expected: usize,
    state: Mutex<LcoState>,
    waiters: AtomicUsize,
}

impl LcoInner {
    pub(crate) fn addr(&self) -> LcoAddr {
        self.addr
    }

    pub(crate) fn arrive(&self, arrival: Arrival) -> Result<(), LcoError> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(LcoError::Deleted(self.addr));
        }
        if state.arrived == self.expected {
            return Err(LcoError::OverflowSignal {
                addr: self.addr,
                expected: self.expected,
            });
        }
        match (self.kind, arrival) {
            (LcoKind::AndGate, Arrival::Signal | Arrival::Set(_)) => {}
            (LcoKind::Reduction | LcoKind::Future, Arrival::Signal) => {
                return Err(LcoError::KindMismatch {
                    addr: self.addr,
                    kind: self.kind,
                })
            }
            (LcoKind::Reduction | LcoKind::Future, Arrival::Set(bytes)) => {
                let res = match state.payload.as_mut() {
                    Some(payload) => payload.combine(&bytes),
                    None => Err(anyhow::anyhow!("{:?} without a payload", self.kind)),
                };
                if let Err(e) = res {
                    state.failures.push(format!("undecodable payload: {}", e));
                }
            }
            (_, Arrival::Failed(cause)) => state.failures.push(cause),
        }
        state.arrived += 1;
        tracing::trace!("{} arrival {}/{}", self.addr, state.arrived, self.expected);
        if state.arrived == self.expected {
            for waker in state.wakers.drain(..) {
                waker.wake();
            }
        }
        Ok(())
    }

    pub(crate) fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    pub(crate) fn is_complete(&self) -> bool {
        let state = self.state.lock();
        !state.deleted && state.arrived == self.expected
    }

    pub(crate) fn wait(self: &Arc<Self>) -> LcoWait {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        LcoWait { lco: self.clone() }
    }

    pub(crate) fn with_payload<R>(
        &self,
        op: impl FnOnce(&dyn Accumulator) -> Option<R>,
    ) -> Result<R, LcoError> {
        let state = self.state.lock();
        if state.deleted {
            return Err(LcoError::Deleted(self.addr));
        }
        if state.arrived < self.expected {
            return Err(LcoError::NotReady {
                arrived: state.arrived,
                expected: self.expected,
            });
        }
        match state.payload.as_deref().and_then(op) {
            Some(value) => Ok(value),
            None if !state.failures.is_empty() => Err(LcoError::FailedArrivals {
                addr: self.addr,
                causes: state.failures.clone(),
            }),
            None => Err(LcoError::KindMismatch {
                addr: self.addr,
                kind: self.kind,
            }),
        }
    }

    fn delete(&self) -> Result<(), LcoError> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(LcoError::Deleted(self.addr));
        }
        let waiters = self.waiters.load(Ordering::SeqCst);
        let outstanding = self.expected - state.arrived;
        if waiters > 0 || outstanding > 0 {
            return Err(LcoError::ObjectInUse {
                waiters,
                outstanding,
            });
        }
        state.deleted = true;
        state.payload = None;
        Ok(())
    }
}

impl std::fmt::Debug for LcoInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LcoInner")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("expected", &self.expected)
            .field("arrived", &self.arrived())
            .finish()
    }
}

/// Future returned by `wait`, resolves once the object is complete.
///
/// Completes with [LcoError::FailedArrivals] if any arrival was a failure.
#[must_use = "this future does nothing unless polled"]
#[derive(Debug)]
pub struct LcoWait {
    lco: Arc<LcoInner>,
}

impl Future for LcoWait {
    type Output = Result<(), LcoError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let lco = &self.lco;
        let mut state = lco.state.lock();
        if state.deleted {
            return Poll::Ready(Err(LcoError::Deleted(lco.addr)));
        }
        if state.arrived == lco.expected {
            if state.failures.is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(LcoError::FailedArrivals {
                    addr: lco.addr,
                    causes: state.failures.clone(),
                }))
            }
        } else {
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

impl Drop for LcoWait {
    fn drop(&mut self) {
        self.lco.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The control objects owned by one node
#[derive(Debug)]
pub(crate) struct LcoTable {
    node: NodeId,
    next_id: AtomicU64,
    lcos: RwLock<HashMap<u64, Arc<LcoInner>>>,
}

impl LcoTable {
    pub(crate) fn new(node: NodeId) -> LcoTable {
        LcoTable {
            node,
            next_id: AtomicU64::new(0),
            lcos: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn create(
        &self,
        kind: LcoKind,
        expected: usize,
        payload: Option<Box<dyn Accumulator>>,
    ) -> Arc<LcoInner> {
        let addr = LcoAddr {
            node: self.node,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let lco = Arc::new(LcoInner {
            addr,
            kind,
            expected,
            state: Mutex::new(LcoState {
                arrived: 0,
                failures: vec![],
                payload,
                wakers: vec![],
                deleted: false,
            }),
            waiters: AtomicUsize::new(0),
        });
        self.lcos.write().insert(addr.id, lco.clone());
        tracing::debug!("created {:?} {} expecting {}", kind, addr, expected);
        lco
    }

    pub(crate) fn arrive(&self, addr: LcoAddr, arrival: Arrival) -> Result<(), LcoError> {
        let lco = self.lcos.read().get(&addr.id).cloned();
        match lco {
            Some(lco) if addr.node == self.node => lco.arrive(arrival),
            _ => Err(LcoError::Deleted(addr)),
        }
    }

    pub(crate) fn delete(&self, lco: &LcoInner) -> Result<(), LcoError> {
        lco.delete()?;
        self.lcos.write().remove(&lco.addr.id);
        tracing::debug!("deleted {}", lco.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn sum_table() -> (LcoTable, Arc<LcoInner>) {
        let table = LcoTable::new(0);
        let acc = TypedAccumulator::<i64> {
            value: 0,
            combine: Box::new(|acc, x| *acc += x),
        };
        let lco = table.create(LcoKind::Reduction, 3, Some(Box::new(acc)));
        (table, lco)
    }

    #[test]
    fn and_gate_counts_exactly() {
        let table = LcoTable::new(2);
        let gate = table.create(LcoKind::AndGate, 2, None);
        assert_eq!(gate.addr().node(), 2);
        let mut wait = gate.wait();
        assert!((&mut wait).now_or_never().is_none());
        gate.arrive(Arrival::Signal).unwrap();
        assert!(!gate.is_complete());
        table.arrive(gate.addr(), Arrival::Set(vec![1])).unwrap();
        assert_eq!(wait.now_or_never(), Some(Ok(())));
        assert!(matches!(
            gate.arrive(Arrival::Signal),
            Err(LcoError::OverflowSignal { expected: 2, .. })
        ));
        assert_eq!(gate.arrived(), 2);
    }

    #[test]
    fn failed_arrival_counts_and_is_reported() {
        let (table, lco) = sum_table();
        lco.arrive(Arrival::Set(crate::serialize(&5i64).unwrap()))
            .unwrap();
        lco.arrive(Arrival::Failed("handler exploded".to_owned()))
            .unwrap();
        lco.arrive(Arrival::Set(vec![0xff])).unwrap(); // not an i64
        assert!(lco.is_complete());
        match lco.wait().now_or_never() {
            Some(Err(LcoError::FailedArrivals { causes, .. })) => {
                assert_eq!(causes.len(), 2);
                assert_eq!(causes[0], "handler exploded");
            }
            other => panic!("unexpected {:?}", other),
        }
        let sum = lco.with_payload(|acc| {
            acc.as_any()
                .downcast_ref::<TypedAccumulator<i64>>()
                .map(|a| a.value)
        });
        assert_eq!(sum, Ok(5));
        table.delete(&lco).unwrap();
    }

    #[test]
    fn signal_on_reduction_is_rejected() {
        let (_table, lco) = sum_table();
        assert!(matches!(
            lco.arrive(Arrival::Signal),
            Err(LcoError::KindMismatch { .. })
        ));
        assert_eq!(lco.arrived(), 0);
    }

    #[test]
    fn delete_after_drain_only() {
        let table = LcoTable::new(0);
        let gate = table.create(LcoKind::AndGate, 1, None);
        assert!(matches!(
            table.delete(&gate),
            Err(LcoError::ObjectInUse { outstanding: 1, .. })
        ));
        let wait = gate.wait();
        gate.arrive(Arrival::Signal).unwrap();
        assert!(matches!(
            table.delete(&gate),
            Err(LcoError::ObjectInUse { waiters: 1, .. })
        ));
        drop(wait);
        table.delete(&gate).unwrap();
        assert!(table.lcos.read().is_empty());
        assert_eq!(
            table.arrive(gate.addr(), Arrival::Signal),
            Err(LcoError::Deleted(gate.addr()))
        );
        assert_eq!(
            gate.wait().now_or_never(),
            Some(Err(LcoError::Deleted(gate.addr())))
        );
    }

    #[test]
    fn future_holds_its_single_value() {
        fn slot(lco: &LcoInner) -> Result<String, LcoError> {
            lco.with_payload(|acc| {
                acc.as_any()
                    .downcast_ref::<Slot<String>>()
                    .and_then(|s| s.value.clone())
            })
        }
        let table = LcoTable::new(1);
        let fut = table.create(LcoKind::Future, 1, Some(Box::new(Slot::<String> { value: None })));
        assert!(matches!(slot(&fut), Err(LcoError::NotReady { arrived: 0, expected: 1 })));
        assert!(matches!(
            fut.arrive(Arrival::Signal),
            Err(LcoError::KindMismatch { kind: LcoKind::Future, .. })
        ));
        fut.arrive(Arrival::Set(crate::serialize(&"done".to_owned()).unwrap()))
            .unwrap();
        assert_eq!(fut.wait().now_or_never(), Some(Ok(())));
        assert_eq!(slot(&fut), Ok("done".to_owned()));
        assert!(matches!(
            fut.arrive(Arrival::Set(crate::serialize(&"again".to_owned()).unwrap())),
            Err(LcoError::OverflowSignal { expected: 1, .. })
        ));
        assert_eq!(slot(&fut), Ok("done".to_owned()));

        let failed = table.create(LcoKind::Future, 1, Some(Box::new(Slot::<String> { value: None })));
        failed.arrive(Arrival::Failed("no value".to_owned())).unwrap();
        assert!(matches!(slot(&failed), Err(LcoError::FailedArrivals { .. })));
    }

    #[test]
    fn zero_expected_is_born_complete() {
        let table = LcoTable::new(0);
        let gate = table.create(LcoKind::AndGate, 0, None);
        assert!(gate.is_complete());
        assert_eq!(gate.wait().now_or_never(), Some(Ok(())));
    }
}
