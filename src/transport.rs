use crate::dispatcher::DispatchError;
use crate::env_var::config;
use crate::gas::NodeId;

use async_std::channel::Receiver;
use enum_dispatch::enum_dispatch;

pub(crate) mod local;
use local::Local;

/// The available transport backends, used to specify how envelopes move between nodes
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// every node lives in this process, envelopes are serialized and moved over in-memory channels
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "local" => Backend::Local,
            other => {
                tracing::warn!("unknown backend {:?}, using local", other);
                Backend::Local
            }
        }
    }
}

#[enum_dispatch]
pub(crate) trait Transport {
    /// Hand a serialized envelope to `dst`, fails with [DispatchError::Unreachable] if `dst` is gone
    fn send(&self, src: NodeId, dst: NodeId, data: Vec<u8>) -> Result<(), DispatchError>;
    /// The receiving end of `node`'s inbox, taken once by its dispatch loop
    fn inbox(&self, node: NodeId) -> Option<Receiver<Vec<u8>>>;
    /// Make `node` unreachable, its dispatch loop drains what it already received and exits
    fn disconnect(&self, node: NodeId);
    fn shutdown(&self);
    fn messages_sent(&self) -> usize;
}

#[enum_dispatch(Transport)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
}

pub(crate) fn create_lamellae(backend: Backend, num_nodes: usize) -> Lamellae {
    match backend {
        Backend::Local => Lamellae::Local(Local::new(num_nodes)),
    }
}
