use crate::dispatcher::Dispatcher;
use crate::lco::{Arrival, LcoAddr, LcoError, LcoInner, LcoKind, LcoWait, Slot, TypedAccumulator};

use std::marker::PhantomData;
use std::sync::Arc;

/// Fires once `expected` signals have arrived; carries no payload.
///
/// # Examples
///```
/// let world = amgas::WorldBuilder::new().with_nodes(4).build();
/// let gate = world.new_and_gate(4);
/// for node in 0..4 {
///     world.node(node).lco_signal(gate.addr()); // fire and forget
/// }
/// world.block_on(gate.wait())?;
/// gate.delete()?;
///```
#[derive(Debug, Clone)]
pub struct AndGate {
    pub(crate) lco: Arc<LcoInner>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl AndGate {
    pub(crate) fn new(dispatcher: &Arc<Dispatcher>, expected: usize) -> AndGate {
        AndGate {
            lco: dispatcher.lcos.create(LcoKind::AndGate, expected, None),
            dispatcher: dispatcher.clone(),
        }
    }

    /// Global address of the gate, usable as a completion target from any node
    pub fn addr(&self) -> LcoAddr {
        self.lco.addr()
    }

    /// Record one arrival, fails with [LcoError::OverflowSignal] once complete
    pub fn signal(&self) -> Result<(), LcoError> {
        self.lco.arrive(Arrival::Signal)
    }

    /// Suspend until every expected signal has arrived
    pub fn wait(&self) -> LcoWait {
        self.lco.wait()
    }

    pub fn is_complete(&self) -> bool {
        self.lco.is_complete()
    }

    pub fn arrived(&self) -> usize {
        self.lco.arrived()
    }

    /// Release the gate, only valid once it is complete and every waiter has returned
    pub fn delete(&self) -> Result<(), LcoError> {
        self.dispatcher.lcos.delete(&self.lco)
    }
}

/// Folds `expected` values of type `T` into an accumulator.
///
/// The accumulator starts at `T::default()` passed through the reset operator; each arrival is
/// combined in under mutual exclusion, so the combine operator must be associative and commutative.
///
/// # Examples
///```
/// let world = amgas::WorldBuilder::new().with_nodes(3).build();
/// let sum = world.new_reduction::<f64>(3, |acc| *acc = 0.0, |acc, x| *acc += x);
/// for node in 0..3 {
///     world.node(node).lco_set(sum.addr(), &(node as f64));
/// }
/// world.block_on(sum.wait())?;
/// assert_eq!(sum.get()?, 3.0);
///```
pub struct Reduction<T> {
    pub(crate) lco: Arc<LcoInner>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Reduction<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Default + Send + 'static,
{
    pub(crate) fn new(
        dispatcher: &Arc<Dispatcher>,
        expected: usize,
        reset: impl Fn(&mut T),
        combine: impl Fn(&mut T, &T) + Send + Sync + 'static,
    ) -> Reduction<T> {
        let mut value = T::default();
        reset(&mut value);
        let acc = TypedAccumulator {
            value,
            combine: Box::new(combine),
        };
        Reduction {
            lco: dispatcher
                .lcos
                .create(LcoKind::Reduction, expected, Some(Box::new(acc))),
            dispatcher: dispatcher.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn addr(&self) -> LcoAddr {
        self.lco.addr()
    }

    /// Combine `value` into the accumulator as one arrival
    pub fn set(&self, value: &T) -> Result<(), LcoError> {
        let bytes = crate::serialize(value).map_err(|e| LcoError::FailedArrivals {
            addr: self.addr(),
            causes: vec![e.to_string()],
        })?;
        self.lco.arrive(Arrival::Set(bytes))
    }

    pub fn wait(&self) -> LcoWait {
        self.lco.wait()
    }

    pub fn is_complete(&self) -> bool {
        self.lco.is_complete()
    }

    pub fn arrived(&self) -> usize {
        self.lco.arrived()
    }

    /// The reduced value, fails with [LcoError::NotReady] until every arrival is in
    pub fn get(&self) -> Result<T, LcoError> {
        self.lco.with_payload(|acc| {
            acc.as_any()
                .downcast_ref::<TypedAccumulator<T>>()
                .map(|typed| typed.value.clone())
        })
    }

    pub fn delete(&self) -> Result<(), LcoError> {
        self.dispatcher.lcos.delete(&self.lco)
    }
}

impl<T> Clone for Reduction<T> {
    fn clone(&self) -> Self {
        Reduction {
            lco: self.lco.clone(),
            dispatcher: self.dispatcher.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Reduction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reduction<{}>({:?})", std::any::type_name::<T>(), self.lco)
    }
}

/// A one-shot control object carrying a single value of type `T`.
///
/// Completes on its first set; any later set fails with [LcoError::OverflowSignal]. As the completion
/// target of an invocation it receives that invocation's result, so `T` must match what the handler serializes.
///
/// # Examples
///```
/// let world = amgas::WorldBuilder::new().with_nodes(2).build();
/// let answer = world.new_future::<u64>();
/// world.node(1).lco_set(answer.addr(), &42u64);
/// world.block_on(answer.wait())?;
/// assert_eq!(answer.get()?, 42);
/// answer.delete()?;
///```
pub struct FutureLco<T> {
    pub(crate) lco: Arc<LcoInner>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> FutureLco<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + 'static,
{
    pub(crate) fn new(dispatcher: &Arc<Dispatcher>) -> FutureLco<T> {
        let slot = Slot::<T> { value: None };
        FutureLco {
            lco: dispatcher
                .lcos
                .create(LcoKind::Future, 1, Some(Box::new(slot))),
            dispatcher: dispatcher.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn addr(&self) -> LcoAddr {
        self.lco.addr()
    }

    /// Complete the future with `value`
    pub fn set(&self, value: &T) -> Result<(), LcoError> {
        let bytes = crate::serialize(value).map_err(|e| LcoError::FailedArrivals {
            addr: self.addr(),
            causes: vec![e.to_string()],
        })?;
        self.lco.arrive(Arrival::Set(bytes))
    }

    pub fn wait(&self) -> LcoWait {
        self.lco.wait()
    }

    pub fn is_complete(&self) -> bool {
        self.lco.is_complete()
    }

    /// The value, fails with [LcoError::NotReady] before the set and with
    /// [LcoError::FailedArrivals] if the only arrival was a failure
    pub fn get(&self) -> Result<T, LcoError> {
        self.lco.with_payload(|acc| {
            acc.as_any()
                .downcast_ref::<Slot<T>>()
                .and_then(|slot| slot.value.clone())
        })
    }

    pub fn delete(&self) -> Result<(), LcoError> {
        self.dispatcher.lcos.delete(&self.lco)
    }
}

impl<T> Clone for FutureLco<T> {
    fn clone(&self) -> Self {
        FutureLco {
            lco: self.lco.clone(),
            dispatcher: self.dispatcher.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for FutureLco<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FutureLco<{}>({:?})", std::any::type_name::<T>(), self.lco)
    }
}
