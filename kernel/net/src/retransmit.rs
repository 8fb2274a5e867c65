//! Registry of connections with unacknowledged segments.
//!
//! Connections register themselves when they send a segment that expects an
//! acknowledgement, from any thread, and while they linger in `TimeWait`. The worker snapshots the registry once
//! per loop turn and calls [`TcpSocket::retransmit_packets`] on each member
//! under that member's own lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::socket::TcpSocket;
use crate::stack::NetworkStack;

#[derive(Debug, Default)]
pub struct RetransmitRegistry {
    sockets: Mutex<BTreeMap<u64, Arc<TcpSocket>>>,
}

impl RetransmitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket: &Arc<TcpSocket>) {
        self.sockets
            .lock()
            .entry(socket.id())
            .or_insert_with(|| socket.clone());
    }

    pub fn unregister(&self, id: u64) {
        self.sockets.lock().remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sockets.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.lock().is_empty()
    }

    /// Copy of the current members.
    pub fn snapshot(&self) -> Vec<Arc<TcpSocket>> {
        self.sockets.lock().values().cloned().collect()
    }
}

/// One retransmission pass over a snapshot of the registry.
pub fn retransmit_tcp_packets(stack: &NetworkStack) {
    let sockets = stack.retransmits().snapshot();
    if sockets.is_empty() {
        return;
    }
    stack.stats().inc_retransmit_passes();
    for socket in sockets {
        let mut ctl = socket.lock();
        socket.retransmit_packets(&mut ctl, stack);
    }
}
