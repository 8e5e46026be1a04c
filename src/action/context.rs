use crate::dispatcher::{AckHandle, Dispatcher, InvokeHandle, Target};
use crate::gas::{GasHandle, GlobalAddress, NodeId, PinGuard};
use crate::lco::{Arrival, LcoAddr};
use crate::world::NodeHandle;

use std::sync::Arc;

/// What a handler sees of the node it is executing on.
///
/// The context is handed to every handler invocation. It exposes the invocation's target,
/// scoped pinning of that target, and the executing node's [NodeHandle] for nested invocations.
#[derive(Clone, Debug)]
pub struct ActionContext {
    dispatcher: Arc<Dispatcher>,
    target: Target,
}

impl ActionContext {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, target: Target) -> ActionContext {
        ActionContext { dispatcher, target }
    }

    /// The node executing this handler
    pub fn node(&self) -> NodeId {
        self.dispatcher.id
    }

    pub fn num_nodes(&self) -> usize {
        self.dispatcher.num_nodes
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The target address, if the action was invoked against one
    pub fn target_addr(&self) -> Option<GlobalAddress> {
        match self.target {
            Target::Addr(addr) => Some(addr),
            Target::Node(_) => None,
        }
    }

    pub fn gas(&self) -> GasHandle {
        GasHandle {
            node: self.dispatcher.id,
            gas: self.dispatcher.gas.clone(),
        }
    }

    /// Pin the invocation target for direct access, the pin is released when the guard drops
    pub fn pin_target(&self) -> anyhow::Result<PinGuard> {
        let addr = self
            .target_addr()
            .ok_or_else(|| anyhow::anyhow!("invocation target {:?} is not an address", self.target))?;
        Ok(self.gas().pin(addr)?)
    }

    /// Run `op` against the pinned target bytes
    ///
    /// # Examples
    ///```
    /// use amgas::{handler, ActionContext, Args};
    ///
    /// let fill = handler(|ctx: ActionContext, args: Args| async move {
    ///     let byte = args.get::<i8>(0)? as u8;
    ///     ctx.with_target(|bytes| bytes.fill(byte))?;
    ///     Ok(vec![])
    /// });
    ///```
    pub fn with_target<R>(&self, op: impl FnOnce(&mut [u8]) -> R) -> anyhow::Result<R> {
        Ok(self.pin_target()?.write(op)?)
    }

    /// The executing node's handle, for nested invocations and control object creation
    pub fn node_handle(&self) -> NodeHandle {
        NodeHandle {
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Signal the AND-gate at `lco`
    pub fn lco_signal(&self, lco: LcoAddr) -> AckHandle {
        self.dispatcher.lco_arrival(lco, Arrival::Signal)
    }

    /// Set the reduction at `lco` with `value`
    pub fn lco_set<T: serde::Serialize>(&self, lco: LcoAddr, value: &T) -> AckHandle {
        match crate::serialize(value) {
            Ok(bytes) => self.dispatcher.lco_arrival(lco, Arrival::Set(bytes)),
            Err(e) => self.dispatcher.lco_arrival(lco, Arrival::Failed(e.to_string())),
        }
    }

    /// Read the bytes at `addr` from whichever node owns it
    pub fn memget(&self, addr: GlobalAddress) -> InvokeHandle {
        self.dispatcher.memget(addr)
    }
}
