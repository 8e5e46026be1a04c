use crate::dispatcher::DispatchError;
use crate::gas::NodeId;
use crate::transport::Transport;

use async_std::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Local {
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Mutex<Vec<Option<Receiver<Vec<u8>>>>>,
    sent: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local({} nodes)", self.senders.len())
    }
}

impl Local {
    pub(crate) fn new(num_nodes: usize) -> Local {
        let (senders, receivers) = (0..num_nodes)
            .map(|_| {
                let (s, r) = unbounded();
                (s, Some(r))
            })
            .unzip();
        Local {
            senders,
            receivers: Mutex::new(receivers),
            sent: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }
}

impl Transport for Local {
    fn send(&self, src: NodeId, dst: NodeId, data: Vec<u8>) -> Result<(), DispatchError> {
        let sender = self
            .senders
            .get(dst)
            .ok_or(DispatchError::Unreachable(dst))?;
        let len = data.len();
        match sender.try_send(data) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                tracing::trace!("{} bytes {} -> {}", len, src, dst);
                Ok(())
            }
            Err(_) => Err(DispatchError::Unreachable(dst)),
        }
    }

    fn inbox(&self, node: NodeId) -> Option<Receiver<Vec<u8>>> {
        self.receivers.lock().get_mut(node).and_then(Option::take)
    }

    fn disconnect(&self, node: NodeId) {
        if let Some(sender) = self.senders.get(node) {
            sender.close();
            tracing::debug!("node {} disconnected", node);
        }
    }

    fn shutdown(&self) {
        for sender in &self.senders {
            sender.close();
        }
        tracing::debug!(
            "local transport shut down after {} messages ({} bytes)",
            self.sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed)
        );
    }

    fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_until_disconnected() {
        let local = Local::new(2);
        let inbox = local.inbox(1).unwrap();
        assert!(local.inbox(1).is_none());
        local.send(0, 1, vec![1, 2, 3]).unwrap();
        local.disconnect(1);
        assert_eq!(
            local.send(0, 1, vec![4]),
            Err(DispatchError::Unreachable(1))
        );
        assert_eq!(
            local.send(0, 5, vec![4]),
            Err(DispatchError::Unreachable(5))
        );
        assert_eq!(async_std::task::block_on(inbox.recv()), Ok(vec![1, 2, 3]));
        assert!(async_std::task::block_on(inbox.recv()).is_err());
        assert_eq!(local.messages_sent(), 1);
    }
}
