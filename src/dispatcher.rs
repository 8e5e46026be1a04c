//! Delivery and execution of action invocations.
//!
//! Every node owns a [Dispatcher]. Invocations addressed to the local node are submitted straight to the
//! node's worker pool; anything else is wrapped in an [Envelope], serialized, and handed to the transport,
//! where the owning node's dispatch loop decodes it and submits it as a task.
//!
//! Once a handler has run, its result is routed according to the invocation's completion mode:
//! - synchronous calls get a `Reply` carrying the result (or the failure)
//! - asynchronous calls either launch a continuation action with the result, signal/set a control object,
//!   or, with no completion target, have failures logged and dropped
//!
//! Every request a node sends is counted in a world wide in-flight counter until the matching
//! reply or acknowledgement comes back, which is what `World::wait_all` waits on.
use crate::action::{ActionContext, ActionId, ActionRegistry, Args, Marshalling, RegistryError};
use crate::gas::{AddressSpace, GasError, GlobalAddress, NodeId};
use crate::lco::{Arrival, LcoAddr, LcoError, LcoTable};
use crate::scheduler::{panic_message, Scheduler, SchedulerQueue};
use crate::transport::{Lamellae, Transport};

use async_std::channel::Receiver;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub(crate) mod handle;
use handle::RequestInner;
pub(crate) use handle::RequestTable;
pub use handle::{AckHandle, InvokeHandle};

/// Errors raised while issuing or completing an invocation
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DispatchError {
    /// both a continuation and a control object were supplied
    AmbiguousCompletion,
    /// the handler failed (or panicked) on `node`
    RemoteExecution { node: NodeId, cause: String },
    /// a broadcast could not be delivered to these nodes
    PartialBroadcast { unreached: Vec<NodeId> },
    /// the node is outside the topology or has been disconnected
    Unreachable(NodeId),
    Gas(GasError),
    Registry(RegistryError),
    Lco(LcoError),
    /// a message could not be encoded or decoded
    Encoding(String),
    /// the result of this handle was already taken
    Consumed,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DispatchError::AmbiguousCompletion => write!(
                f,
                "an invocation may complete through a continuation or a control object, not both"
            ),
            DispatchError::RemoteExecution { node, cause } => {
                write!(f, "handler failed on node {}: {}", node, cause)
            }
            DispatchError::PartialBroadcast { unreached } => {
                write!(f, "broadcast did not reach nodes {:?}", unreached)
            }
            DispatchError::Unreachable(node) => write!(f, "node {} is unreachable", node),
            DispatchError::Gas(e) => write!(f, "{}", e),
            DispatchError::Registry(e) => write!(f, "{}", e),
            DispatchError::Lco(e) => write!(f, "{}", e),
            DispatchError::Encoding(e) => write!(f, "encoding error: {}", e),
            DispatchError::Consumed => write!(f, "result already consumed"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Gas(e) => Some(e),
            DispatchError::Registry(e) => Some(e),
            DispatchError::Lco(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GasError> for DispatchError {
    fn from(e: GasError) -> Self {
        DispatchError::Gas(e)
    }
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        DispatchError::Registry(e)
    }
}

impl From<LcoError> for DispatchError {
    fn from(e: LcoError) -> Self {
        DispatchError::Lco(e)
    }
}

/// Where an invocation executes: a whole node, or the node owning an address
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    Addr(GlobalAddress),
}

impl From<NodeId> for Target {
    fn from(node: NodeId) -> Self {
        Target::Node(node)
    }
}

impl From<GlobalAddress> for Target {
    fn from(addr: GlobalAddress) -> Self {
        Target::Addr(addr)
    }
}

/// An action to launch with the result of another.
///
/// When no arguments are supplied the completed handler's output is forwarded as the Raw buffer of the continuation.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Continuation {
    pub(crate) target: Target,
    pub(crate) action: ActionId,
    pub(crate) args: Option<Args>,
}

impl Continuation {
    pub fn new(target: impl Into<Target>, action: ActionId) -> Continuation {
        Continuation {
            target: target.into(),
            action,
            args: None,
        }
    }

    pub fn with_args(mut self, args: Args) -> Continuation {
        self.args = Some(args);
        self
    }
}

/// A single asynchronous invocation, built up and handed to `invoke`
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub(crate) target: Target,
    pub(crate) action: ActionId,
    pub(crate) args: Args,
    pub(crate) continuation: Option<Continuation>,
    pub(crate) lco: Option<LcoAddr>,
}

impl InvocationRequest {
    pub fn new(target: impl Into<Target>, action: ActionId, args: Args) -> InvocationRequest {
        InvocationRequest {
            target: target.into(),
            action,
            args,
            continuation: None,
            lco: None,
        }
    }

    /// Launch `continuation` once the handler succeeds
    pub fn with_continuation(mut self, continuation: Continuation) -> InvocationRequest {
        self.continuation = Some(continuation);
        self
    }

    /// Set (or signal) `lco` with the handler's result, failures count as failed arrivals
    pub fn with_lco(mut self, lco: LcoAddr) -> InvocationRequest {
        self.lco = Some(lco);
        self
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub(crate) enum Completion {
    Reply,
    Continuation(Continuation),
    Lco(LcoAddr),
    Detached,
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum Message {
    Invoke {
        req_id: u64,
        target: Target,
        action: ActionId,
        args: Args,
        completion: Completion,
    },
    Reply {
        req_id: u64,
        result: Result<Vec<u8>, DispatchError>,
    },
    LcoArrive {
        req_id: u64,
        lco: LcoAddr,
        arrival: Arrival,
    },
    LcoAck {
        req_id: u64,
        result: Result<(), LcoError>,
    },
    Memget {
        req_id: u64,
        addr: GlobalAddress,
    },
    Memput {
        req_id: u64,
        addr: GlobalAddress,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

/// What actually crosses the transport
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) struct Envelope {
    pub(crate) src: NodeId,
    pub(crate) msg: Message,
}

/// A node's runtime state: its actions, control objects, outstanding requests, and worker pool
pub struct Dispatcher {
    pub(crate) id: NodeId,
    pub(crate) num_nodes: usize,
    pub(crate) registry: ActionRegistry,
    pub(crate) lcos: LcoTable,
    pub(crate) requests: RequestTable,
    pub(crate) gas: Arc<AddressSpace>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) lamellae: Arc<Lamellae>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("num_nodes", &self.num_nodes)
            .field("registry", &self.registry)
            .field("outstanding", &self.requests.outstanding())
            .finish()
    }
}

impl Dispatcher {
    fn resolve(&self, target: &Target) -> Result<NodeId, DispatchError> {
        let node = match target {
            Target::Node(node) => *node,
            Target::Addr(addr) => addr.node(),
        };
        if node < self.num_nodes {
            Ok(node)
        } else {
            Err(DispatchError::Unreachable(node))
        }
    }

    fn post(self: &Arc<Self>, dst: NodeId, msg: Message) -> Result<(), DispatchError> {
        if dst == self.id {
            self.scheduler
                .submit_task(self.clone().process(self.id, msg));
            Ok(())
        } else {
            let data = crate::serialize(&Envelope { src: self.id, msg })
                .map_err(|e| DispatchError::Encoding(e.to_string()))?;
            self.lamellae.send(self.id, dst, data)
        }
    }

    fn respond(self: &Arc<Self>, dst: NodeId, msg: Message) {
        if let Err(e) = self.post(dst, msg) {
            tracing::warn!("node {} unable to respond to node {}: {}", self.id, dst, e);
        }
    }

    // `held` requests are handed to the caller as a handle, the reference is taken before posting
    fn request(
        self: &Arc<Self>,
        dst: NodeId,
        held: bool,
        msg: impl FnOnce(u64) -> Message,
    ) -> Result<Arc<RequestInner>, DispatchError> {
        let req = self.requests.issue(dst, held);
        match self.post(dst, msg(req.id)) {
            Ok(()) => Ok(req),
            Err(e) => {
                self.requests.cancel(req.id);
                Err(e)
            }
        }
    }

    // registry and routing errors surface here, before anything is sent
    fn issue_invoke(
        self: &Arc<Self>,
        req: InvocationRequest,
        reply: bool,
    ) -> Result<Arc<RequestInner>, DispatchError> {
        let desc = self.registry.lookup(req.action)?;
        desc.check(&req.args)?;
        if desc.is_pinned() && !matches!(req.target, Target::Addr(_)) {
            return Err(RegistryError::ArgumentMismatch {
                index: 0,
                reason: format!("pinned {} needs an address target", req.action),
            }
            .into());
        }
        let completion = match (req.continuation, req.lco) {
            (Some(_), Some(_)) => return Err(DispatchError::AmbiguousCompletion),
            (Some(cont), None) => {
                let next = self.registry.lookup(cont.action)?;
                match &cont.args {
                    Some(args) => next.check(args)?,
                    None if next.marshalling() != Marshalling::Raw => {
                        return Err(RegistryError::ArgumentMismatch {
                            index: 0,
                            reason: format!(
                                "{} receives the forwarded result and must be Raw",
                                cont.action
                            ),
                        }
                        .into())
                    }
                    None => {}
                }
                self.resolve(&cont.target)?;
                Completion::Continuation(cont)
            }
            (None, Some(lco)) => {
                if lco.node() >= self.num_nodes {
                    return Err(LcoError::Deleted(lco).into());
                }
                Completion::Lco(lco)
            }
            (None, None) if reply => Completion::Reply,
            (None, None) => Completion::Detached,
        };
        let dst = self.resolve(&req.target)?;
        tracing::debug!(
            "node {} -> node {}: {} {:?}",
            self.id,
            dst,
            req.action,
            completion
        );
        let (target, action, args) = (req.target, req.action, req.args);
        self.request(dst, reply, move |req_id| Message::Invoke {
            req_id,
            target,
            action,
            args,
            completion,
        })
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn invoke(self: &Arc<Self>, req: InvocationRequest) -> Result<(), DispatchError> {
        self.issue_invoke(req, false).map(|_| ())
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn call_sync(
        self: &Arc<Self>,
        target: Target,
        action: ActionId,
        args: Args,
    ) -> InvokeHandle {
        match self.issue_invoke(InvocationRequest::new(target, action, args), true) {
            Ok(req) => InvokeHandle::pending(req),
            Err(e) => InvokeHandle::ready(Err(e)),
        }
    }

    pub(crate) async fn broadcast(
        self: Arc<Self>,
        action: ActionId,
        args: Args,
    ) -> Result<Vec<Vec<u8>>, DispatchError> {
        let mut handles = Vec::with_capacity(self.num_nodes);
        let mut unreached = vec![];
        for node in 0..self.num_nodes {
            let req = InvocationRequest::new(Target::Node(node), action, args.clone());
            match self.issue_invoke(req, true) {
                Ok(req) => handles.push(InvokeHandle::pending(req)),
                Err(DispatchError::Unreachable(node)) => unreached.push(node),
                Err(e) => return Err(e),
            }
        }
        let results = join_all(handles).await;
        if !unreached.is_empty() {
            tracing::warn!("broadcast of {} did not reach {:?}", action, unreached);
            return Err(DispatchError::PartialBroadcast { unreached });
        }
        results.into_iter().collect()
    }

    fn arrive(
        self: &Arc<Self>,
        lco: LcoAddr,
        arrival: Arrival,
        held: bool,
    ) -> Result<Option<Arc<RequestInner>>, DispatchError> {
        if lco.node() == self.id {
            self.lcos.arrive(lco, arrival)?;
            Ok(None)
        } else if lco.node() >= self.num_nodes {
            Err(LcoError::Deleted(lco).into())
        } else {
            self.request(lco.node(), held, move |req_id| Message::LcoArrive {
                req_id,
                lco,
                arrival,
            })
            .map(Some)
        }
    }

    pub(crate) fn lco_arrival(self: &Arc<Self>, lco: LcoAddr, arrival: Arrival) -> AckHandle {
        match self.arrive(lco, arrival, true) {
            Ok(Some(req)) => AckHandle::new(InvokeHandle::pending(req)),
            Ok(None) => AckHandle::ready(Ok(())),
            Err(e) => AckHandle::ready(Err(e)),
        }
    }

    fn read_local(&self, addr: GlobalAddress) -> Result<Vec<u8>, DispatchError> {
        Ok(self.gas.pin(self.id, addr)?.to_vec()?)
    }

    fn write_local(&self, addr: GlobalAddress, data: &[u8]) -> Result<(), DispatchError> {
        if data.len() != addr.len() {
            return Err(GasError::OutOfRange {
                offset: addr.offset(),
                len: data.len(),
                extent: addr.len(),
            }
            .into());
        }
        self.gas
            .pin(self.id, addr)?
            .write(|bytes| bytes.copy_from_slice(data))?;
        Ok(())
    }

    pub(crate) fn memget(self: &Arc<Self>, addr: GlobalAddress) -> InvokeHandle {
        if addr.node() == self.id {
            return InvokeHandle::ready(self.read_local(addr));
        }
        match self.request(addr.node(), true, |req_id| Message::Memget { req_id, addr }) {
            Ok(req) => InvokeHandle::pending(req),
            Err(e) => InvokeHandle::ready(Err(e)),
        }
    }

    pub(crate) fn memput(self: &Arc<Self>, addr: GlobalAddress, data: Vec<u8>) -> AckHandle {
        // a length mismatch is rejected by write_local before anything is pinned
        if addr.node() == self.id || data.len() != addr.len() {
            return AckHandle::ready(self.write_local(addr, &data));
        }
        match self.request(addr.node(), true, |req_id| Message::Memput {
            req_id,
            addr,
            data,
        }) {
            Ok(req) => AckHandle::new(InvokeHandle::pending(req)),
            Err(e) => AckHandle::ready(Err(e)),
        }
    }

    async fn execute(
        self: &Arc<Self>,
        target: Target,
        action: ActionId,
        args: Args,
    ) -> Result<Vec<u8>, DispatchError> {
        let desc = self.registry.lookup(action)?;
        desc.check(&args)?;
        if desc.is_pinned() {
            match &target {
                Target::Addr(addr) => self.gas.is_local(self.id, addr)?,
                Target::Node(_) => {
                    return Err(RegistryError::ArgumentMismatch {
                        index: 0,
                        reason: format!("pinned {} needs an address target", action),
                    }
                    .into())
                }
            }
        }
        let ctx = ActionContext::new(self.clone(), target);
        match AssertUnwindSafe((desc.handler)(ctx, args))
            .catch_unwind()
            .await
        {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(DispatchError::RemoteExecution {
                node: self.id,
                cause: format!("{:#}", e),
            }),
            Err(payload) => Err(DispatchError::RemoteExecution {
                node: self.id,
                cause: format!("handler panicked: {}", panic_message(&*payload)),
            }),
        }
    }

    fn route(
        self: &Arc<Self>,
        src: NodeId,
        req_id: u64,
        action: ActionId,
        result: Result<Vec<u8>, DispatchError>,
        completion: Completion,
    ) {
        let reply = match completion {
            Completion::Reply => result,
            Completion::Continuation(cont) => {
                match result {
                    Ok(bytes) => {
                        let args = cont.args.unwrap_or(Args::Raw(bytes));
                        let next = InvocationRequest::new(cont.target, cont.action, args);
                        if let Err(e) = self.invoke(next) {
                            tracing::warn!("continuation of {} not launched: {}", action, e);
                        }
                    }
                    Err(e) => tracing::warn!("{} failed, continuation dropped: {}", action, e),
                }
                Ok(vec![])
            }
            Completion::Lco(lco) => {
                let arrival = match result {
                    Ok(bytes) => Arrival::Set(bytes),
                    Err(e) => Arrival::Failed(e.to_string()),
                };
                if let Err(e) = self.arrive(lco, arrival, false) {
                    tracing::warn!("{} could not reach {}: {}", action, lco, e);
                }
                Ok(vec![])
            }
            Completion::Detached => {
                if let Err(e) = result {
                    tracing::warn!("{} on node {} failed: {}", action, self.id, e);
                }
                Ok(vec![])
            }
        };
        self.respond(src, Message::Reply { req_id, result: reply });
    }

    fn process(self: Arc<Self>, src: NodeId, msg: Message) -> BoxFuture<'static, ()> {
        async move {
            match msg {
                Message::Invoke {
                    req_id,
                    target,
                    action,
                    args,
                    completion,
                } => {
                    tracing::trace!("node {} executing {} for node {}", self.id, action, src);
                    let result = self.execute(target, action, args).await;
                    self.route(src, req_id, action, result, completion);
                }
                Message::Reply { req_id, result } => self.requests.complete(req_id, result),
                Message::LcoArrive {
                    req_id,
                    lco,
                    arrival,
                } => {
                    let result = self.lcos.arrive(lco, arrival);
                    self.respond(src, Message::LcoAck { req_id, result });
                }
                Message::LcoAck { req_id, result } => self.requests.complete(
                    req_id,
                    result.map(|_| vec![]).map_err(DispatchError::Lco),
                ),
                Message::Memget { req_id, addr } => {
                    let result = self.read_local(addr);
                    self.respond(src, Message::Reply { req_id, result });
                }
                Message::Memput { req_id, addr, data } => {
                    let result = self.write_local(addr, &data).map(|_| vec![]);
                    self.respond(src, Message::Reply { req_id, result });
                }
            }
        }
        .boxed()
    }

    /// The node's dispatch loop, runs until the node's inbox is closed
    pub(crate) async fn progress(self: Arc<Self>, inbox: Receiver<Vec<u8>>) {
        while let Ok(data) = inbox.recv().await {
            match crate::deserialize::<Envelope>(&data) {
                Ok(env) => self
                    .scheduler
                    .submit_task(self.clone().process(env.src, env.msg)),
                Err(e) => tracing::error!("node {} dropped undecodable envelope: {}", self.id, e),
            }
        }
        tracing::debug!("node {} dispatch loop exiting", self.id);
    }
}
