use crate::action::{ActionDescriptor, ActionId, ActionRegistry, Args, RegistryError};
use crate::dispatcher::{
    AckHandle, DispatchError, Dispatcher, InvocationRequest, InvokeHandle, RequestTable, Target,
};
use crate::env_var::config;
use crate::gas::{AddressSpace, GasHandle, GlobalAddress, NodeId};
use crate::lco::{AndGate, Arrival, FutureLco, LcoAddr, LcoTable, Reduction};
use crate::scheduler::{create_scheduler, SchedulerQueue, SchedulerStatus, SchedulerType};
use crate::transport::{create_lamellae, Backend, Lamellae, Transport};

use futures::future::join_all;
use futures::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One node of the topology, as seen by driver code or by a handler running on it.
///
/// Cheap to clone; all clones refer to the same node.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl NodeHandle {
    /// Id of this node (`0..num_nodes`)
    pub fn my_node(&self) -> NodeId {
        self.dispatcher.id
    }

    pub fn num_nodes(&self) -> usize {
        self.dispatcher.num_nodes
    }

    /// The address space, with pins resolved relative to this node
    pub fn gas(&self) -> GasHandle {
        GasHandle {
            node: self.dispatcher.id,
            gas: self.dispatcher.gas.clone(),
        }
    }

    /// This node's action registry
    pub fn registry(&self) -> &ActionRegistry {
        &self.dispatcher.registry
    }

    /// Issue an asynchronous invocation and return immediately.
    ///
    /// Registry, routing, and completion errors are reported here; handler failures are reported
    /// through the request's continuation or control object, or logged if it has neither.
    ///
    /// # Examples
    ///```
    /// use amgas::{Args, InvocationRequest, Value};
    /// # let world = amgas::WorldBuilder::new().with_nodes(2).build();
    /// # const WORK: amgas::ActionId = amgas::ActionId(1);
    /// let gate = world.new_and_gate(2);
    /// for node in 0..2 {
    ///     world.invoke(InvocationRequest::new(node, WORK, Args::Fixed(vec![Value::Int(1)])).with_lco(gate.addr()))?;
    /// }
    /// world.block_on(gate.wait())?;
    ///```
    pub fn invoke(&self, req: InvocationRequest) -> Result<(), DispatchError> {
        self.dispatcher.invoke(req)
    }

    /// Invoke `action` on `target` and suspend until its result has been delivered back
    pub fn call_sync(&self, target: impl Into<Target>, action: ActionId, args: Args) -> InvokeHandle {
        self.dispatcher.call_sync(target.into(), action, args)
    }

    /// Invoke `action` with the same arguments on every node, resolving once all of them completed.
    ///
    /// The output holds each node's result, indexed by node id.
    pub fn broadcast(
        &self,
        action: ActionId,
        args: Args,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, DispatchError>> {
        self.dispatcher.clone().broadcast(action, args)
    }

    /// Create an AND-gate owned by this node
    pub fn new_and_gate(&self, expected: usize) -> AndGate {
        AndGate::new(&self.dispatcher, expected)
    }

    /// Create a reduction owned by this node.
    ///
    /// The accumulator starts as `T::default()` passed through `reset`; every arrival is folded in with `combine`.
    pub fn new_reduction<T>(
        &self,
        expected: usize,
        reset: impl Fn(&mut T),
        combine: impl Fn(&mut T, &T) + Send + Sync + 'static,
    ) -> Reduction<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Default + Send + 'static,
    {
        Reduction::new(&self.dispatcher, expected, reset, combine)
    }

    /// Create a one-shot future owned by this node, completed by a single set
    pub fn new_future<T>(&self) -> FutureLco<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + 'static,
    {
        FutureLco::new(&self.dispatcher)
    }

    /// Signal the AND-gate at `lco`, wherever it lives
    pub fn lco_signal(&self, lco: LcoAddr) -> AckHandle {
        self.dispatcher.lco_arrival(lco, Arrival::Signal)
    }

    /// Set the reduction at `lco` with `value`, wherever it lives
    pub fn lco_set<T: serde::Serialize>(&self, lco: LcoAddr, value: &T) -> AckHandle {
        match crate::serialize(value) {
            Ok(bytes) => self.dispatcher.lco_arrival(lco, Arrival::Set(bytes)),
            Err(e) => AckHandle::ready(Err(DispatchError::Encoding(e.to_string()))),
        }
    }

    /// Copy the bytes named by `addr` out of the node that owns them
    pub fn memget(&self, addr: GlobalAddress) -> InvokeHandle {
        self.dispatcher.memget(addr)
    }

    /// Overwrite the bytes named by `addr` on the node that owns them, `data` must be exactly `addr.len()` long
    pub fn memput(&self, addr: GlobalAddress, data: Vec<u8>) -> AckHandle {
        self.dispatcher.memput(addr, data)
    }
}

/// An implementation of the Builder design pattern, used to construct a [World].
///
/// Unset parameters fall back to the `AMGAS_*` environment configuration.
///
/// # Examples
///
///```
/// use amgas::{WorldBuilder, Backend};
///
/// let world = WorldBuilder::new()
///                 .with_nodes(4)
///                 .with_threads(2)
///                 .with_backend(Backend::Local)
///                 .build();
///```
#[derive(Debug, Default)]
pub struct WorldBuilder {
    nodes: Option<usize>,
    threads: Option<usize>,
    heap_size: Option<usize>,
    backend: Backend,
    scheduler: SchedulerType,
}

impl WorldBuilder {
    pub fn new() -> WorldBuilder {
        WorldBuilder::default()
    }

    /// Number of nodes in the topology
    pub fn with_nodes(mut self, nodes: usize) -> WorldBuilder {
        self.nodes = Some(nodes);
        self
    }

    /// Worker threads per node
    pub fn with_threads(mut self, threads: usize) -> WorldBuilder {
        self.threads = Some(threads);
        self
    }

    /// Per-node heap capacity in bytes
    pub fn with_heap_size(mut self, bytes: usize) -> WorldBuilder {
        self.heap_size = Some(bytes);
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> WorldBuilder {
        self.backend = backend;
        self
    }

    pub fn with_scheduler(mut self, sched: SchedulerType) -> WorldBuilder {
        self.scheduler = sched;
        self
    }

    #[tracing::instrument(skip_all)]
    pub fn build(self) -> World {
        let num_nodes = self.nodes.unwrap_or(config().nodes).max(1);
        let threads = self.threads.unwrap_or(config().threads).max(1);
        let heap_size = self.heap_size.unwrap_or(config().heap_size);
        let gas = Arc::new(AddressSpace::new(num_nodes, heap_size));
        let lamellae = Arc::new(create_lamellae(self.backend, num_nodes));
        let inflight = Arc::new(AtomicUsize::new(0));
        let mut nodes = Vec::with_capacity(num_nodes);
        let mut progress = Vec::with_capacity(num_nodes);
        for id in 0..num_nodes {
            let status = Arc::new(AtomicU8::new(SchedulerStatus::Active as u8));
            let scheduler = Arc::new(create_scheduler(self.scheduler, id, threads, status));
            let dispatcher = Arc::new(Dispatcher {
                id,
                num_nodes,
                registry: ActionRegistry::new(),
                lcos: LcoTable::new(id),
                requests: RequestTable::new(inflight.clone()),
                gas: gas.clone(),
                scheduler: scheduler.clone(),
                lamellae: lamellae.clone(),
            });
            match lamellae.inbox(id) {
                Some(inbox) => progress.push(scheduler.spawn_task(dispatcher.clone().progress(inbox))),
                None => tracing::error!("node {} has no inbox, it will not receive messages", id),
            }
            nodes.push(NodeHandle { dispatcher });
        }
        tracing::info!(
            "world of {} nodes x {} threads, {} byte heaps, {:?} backend",
            num_nodes,
            threads,
            heap_size,
            self.backend
        );
        World {
            nodes,
            lamellae,
            inflight,
            progress,
        }
    }
}

/// The fixed set of nodes making up one run.
///
/// Driver code talks to the world as if it were node 0; [World::node] reaches any other node.
/// Dropping the world waits for every outstanding request and then stops each node's dispatch loop and workers.
pub struct World {
    nodes: Vec<NodeHandle>,
    lamellae: Arc<Lamellae>,
    inflight: Arc<AtomicUsize>,
    progress: Vec<async_task::Task<(), usize>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("num_nodes", &self.nodes.len())
            .field("inflight", &self.inflight.load(Ordering::Relaxed))
            .field("lamellae", &self.lamellae)
            .finish()
    }
}

impl World {
    /// The node driver code runs as
    pub fn my_node(&self) -> NodeId {
        0
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Handle to node `node`
    ///
    /// # Panics
    /// if `node` is outside `0..num_nodes`
    pub fn node(&self, node: NodeId) -> NodeHandle {
        self.nodes[node].clone()
    }

    /// Register `desc` under the same id on every node
    pub fn register_action(&self, desc: ActionDescriptor) -> Result<(), RegistryError> {
        ActionRegistry::validate(&desc)?;
        if self.nodes.iter().any(|n| n.registry().contains(desc.id())) {
            return Err(RegistryError::DuplicateAction(desc.id()));
        }
        for node in &self.nodes {
            node.registry().register_descriptor(desc.clone())?;
        }
        Ok(())
    }

    pub fn gas(&self) -> GasHandle {
        self.nodes[0].gas()
    }

    pub fn invoke(&self, req: InvocationRequest) -> Result<(), DispatchError> {
        self.nodes[0].invoke(req)
    }

    pub fn call_sync(&self, target: impl Into<Target>, action: ActionId, args: Args) -> InvokeHandle {
        self.nodes[0].call_sync(target, action, args)
    }

    pub fn broadcast(
        &self,
        action: ActionId,
        args: Args,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, DispatchError>> {
        self.nodes[0].broadcast(action, args)
    }

    pub fn new_and_gate(&self, expected: usize) -> AndGate {
        self.nodes[0].new_and_gate(expected)
    }

    pub fn new_reduction<T>(
        &self,
        expected: usize,
        reset: impl Fn(&mut T),
        combine: impl Fn(&mut T, &T) + Send + Sync + 'static,
    ) -> Reduction<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Default + Send + 'static,
    {
        self.nodes[0].new_reduction(expected, reset, combine)
    }

    pub fn new_future<T>(&self) -> FutureLco<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + 'static,
    {
        self.nodes[0].new_future()
    }

    pub fn lco_signal(&self, lco: LcoAddr) -> AckHandle {
        self.nodes[0].lco_signal(lco)
    }

    pub fn lco_set<T: serde::Serialize>(&self, lco: LcoAddr, value: &T) -> AckHandle {
        self.nodes[0].lco_set(lco, value)
    }

    pub fn memget(&self, addr: GlobalAddress) -> InvokeHandle {
        self.nodes[0].memget(addr)
    }

    pub fn memput(&self, addr: GlobalAddress, data: Vec<u8>) -> AckHandle {
        self.nodes[0].memput(addr, data)
    }

    /// Run `f` to completion, the calling thread helps execute node 0's tasks while it waits
    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.nodes[0].dispatcher.scheduler.block_on(f)
    }

    /// Wait until every request issued by any node has been retired
    #[tracing::instrument(skip_all)]
    pub fn wait_all(&self) {
        let scheduler = &self.nodes[0].dispatcher.scheduler;
        let mut timer = Instant::now();
        while self.inflight.load(Ordering::SeqCst) > 0 {
            if !scheduler.exec_task() {
                std::thread::yield_now();
            }
            if timer.elapsed().as_secs_f64() > config().deadlock_timeout {
                tracing::warn!(
                    "wait_all: {} requests still in flight after {} seconds",
                    self.inflight.load(Ordering::SeqCst),
                    config().deadlock_timeout
                );
                timer = Instant::now();
            }
        }
    }

    /// Make `node` unreachable; there is no way to reconnect it
    pub fn disconnect(&self, node: NodeId) {
        self.lamellae.disconnect(node);
    }

    /// Number of envelopes that crossed the transport so far
    pub fn messages_sent(&self) -> usize {
        self.lamellae.messages_sent()
    }
}

impl Drop for World {
    #[tracing::instrument(skip_all)]
    fn drop(&mut self) {
        self.wait_all();
        self.lamellae.shutdown();
        let progress = std::mem::take(&mut self.progress);
        self.block_on(join_all(progress));
        for node in &self.nodes {
            node.dispatcher.scheduler.shutdown();
        }
        tracing::debug!("world shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{handler, Marshalling, ParamType, Value};

    const ECHO: ActionId = ActionId(1);

    fn world(nodes: usize) -> World {
        WorldBuilder::new()
            .with_nodes(nodes)
            .with_threads(2)
            .with_heap_size(1 << 20)
            .build()
    }

    fn echo() -> ActionDescriptor {
        ActionDescriptor::new(
            ECHO,
            Marshalling::Raw,
            vec![ParamType::Pointer, ParamType::SizeT],
            handler(|_ctx, args| async move { Ok(args.into_bytes()?) }),
        )
    }

    #[test]
    fn registration_reaches_every_node() {
        let world = world(3);
        world.register_action(echo()).unwrap();
        for node in 0..3 {
            assert!(world.node(node).registry().contains(ECHO));
            assert_eq!(world.node(node).my_node(), node);
        }
        assert_eq!(
            world.register_action(echo()),
            Err(RegistryError::DuplicateAction(ECHO))
        );
    }

    #[test]
    fn remote_round_trip_crosses_transport() {
        let world = world(2);
        world.register_action(echo()).unwrap();
        let before = world.messages_sent();
        let res = world.block_on(world.call_sync(1, ECHO, Args::Raw(vec![1, 2, 3])));
        assert_eq!(res, Ok(vec![1, 2, 3]));
        assert!(world.messages_sent() >= before + 2);
        let res = world.block_on(world.call_sync(0, ECHO, Args::Raw(vec![4])));
        assert_eq!(res, Ok(vec![4]));
    }

    #[test]
    fn caller_side_errors_are_synchronous() {
        let world = world(2);
        world.register_action(echo()).unwrap();
        let gate = world.new_and_gate(1);
        assert_eq!(
            world.block_on(world.call_sync(0, ActionId(42), Args::none())),
            Err(DispatchError::Registry(RegistryError::UnknownAction(
                ActionId(42)
            )))
        );
        assert!(matches!(
            world.invoke(InvocationRequest::new(1, ECHO, Args::Fixed(vec![Value::Int(1)]))),
            Err(DispatchError::Registry(RegistryError::ArgumentMismatch { .. }))
        ));
        assert_eq!(
            world.invoke(InvocationRequest::new(5, ECHO, Args::Raw(vec![]))),
            Err(DispatchError::Unreachable(5))
        );
        assert_eq!(
            world.invoke(
                InvocationRequest::new(1, ECHO, Args::Raw(vec![]))
                    .with_lco(gate.addr())
                    .with_continuation(crate::Continuation::new(0, ECHO))
            ),
            Err(DispatchError::AmbiguousCompletion)
        );
    }

    #[test]
    fn drop_waits_for_detached_work() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let world = world(2);
            let counter = hits.clone();
            world
                .register_action(ActionDescriptor::new(
                    ECHO,
                    Marshalling::Fixed,
                    vec![],
                    handler(move |_ctx, _args| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(vec![])
                        }
                    }),
                ))
                .unwrap();
            for i in 0..100 {
                world
                    .invoke(InvocationRequest::new(i % 2, ECHO, Args::none()))
                    .unwrap();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }
}
