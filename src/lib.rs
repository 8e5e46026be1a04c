//! amgas is an asynchronous active-message runtime over a partitioned global address space (GAS).
//!
//! A run consists of a fixed set of nodes, each with its own pool of cooperatively scheduled workers.
//! Nodes communicate exclusively through actions: registered handlers that are invoked by id against
//! a node or against a [GlobalAddress], executing on whichever node owns that address.
//!
//! The runtime provides:
//! - a global address space ([gas]): cyclic and node-local allocation, address arithmetic, and scoped pinning of owned memory
//! - an action registry ([action]) with Fixed (typed positional) and Raw (opaque buffer) argument marshalling
//! - a dispatcher ([dispatcher]) offering synchronous calls, asynchronous invocations completing through a
//!   continuation action or a control object, collective broadcast, and one-sided memget/memput
//! - local control objects ([lco]): AND-gates, typed reductions and one-shot futures counting arrivals from concurrent invocations
//!
//! Nodes are connected by a transport ("lamellae"); the provided backend places every node in the current
//! process but still serializes every message that crosses nodes.
//!
//! EXAMPLES
//! --------
//!
//! # Constructing a world
//! ```
//! let world = amgas::WorldBuilder::new()
//!         .with_nodes(4) // defaults to AMGAS_NODES
//!         .with_threads(2) // worker threads per node, defaults to AMGAS_THREADS
//!         .build();
//! ```
//!
//! # Registering and invoking an action
//! ```
//! use amgas::{handler, ActionDescriptor, ActionId, Args, Marshalling, ParamType, Value};
//!
//! const HELLO: ActionId = ActionId(0);
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let world = amgas::WorldBuilder::new().with_nodes(4).build();
//!     world.register_action(ActionDescriptor::new(
//!         HELLO,
//!         Marshalling::Fixed,
//!         vec![ParamType::Int],
//!         handler(|ctx, args| async move {
//!             let from: i32 = args.get(0)?;
//!             println!("Hello node {} of {}, I'm node {}", ctx.node(), ctx.num_nodes(), from);
//!             Ok(vec![])
//!         }),
//!     ))?;
//!     let gate = world.new_and_gate(world.num_nodes());
//!     for node in 0..world.num_nodes() {
//!         let req = amgas::InvocationRequest::new(node, HELLO, Args::Fixed(vec![Value::Int(0)]));
//!         world.invoke(req.with_lco(gate.addr()))?;
//!     }
//!     world.block_on(gate.wait())?;
//!     gate.delete()?;
//!     Ok(())
//! }
//! ```
//!
//! # Environment
//! - `AMGAS_NODES` default node count
//! - `AMGAS_THREADS` worker threads per node
//! - `AMGAS_HEAP_SIZE` per-node heap capacity in bytes
//! - `AMGAS_DEADLOCK_TIMEOUT` seconds before a blocking wait warns about a possible deadlock
//! - `AMGAS_BACKEND` transport backend (`local`)

pub mod action;
pub mod dispatcher;
pub mod driver;
mod env_var;
pub mod gas;
pub mod lco;
mod scheduler;
mod transport;
mod world;

pub use crate::action::{
    handler, ActionContext, ActionDescriptor, ActionId, ActionRegistry, Args, FromValue, Handler,
    Marshalling, ParamType, RegistryError, Value,
};
pub use crate::dispatcher::{
    AckHandle, Continuation, DispatchError, InvocationRequest, InvokeHandle, Target,
};
pub use crate::env_var::{config, Config};
pub use crate::gas::{GasError, GasHandle, GasResult, GlobalAddress, NodeId, PinGuard};
pub use crate::lco::{AndGate, FutureLco, LcoAddr, LcoError, LcoKind, LcoWait, Reduction};
pub use crate::scheduler::SchedulerType;
pub use crate::transport::Backend;
pub use crate::world::{NodeHandle, World, WorldBuilder};

/// Encode `obj` the way every message and reduction payload is encoded
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}
