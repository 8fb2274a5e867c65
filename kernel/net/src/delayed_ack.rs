//! Delayed-ACK coalescing.
//!
//! Connections whose ack number moved without warranting an immediate reply
//! are parked here. The worker flushes the set once per loop turn: the set
//! is drained under its own lock, then each connection is locked on its own
//! and either acknowledged or parked again if its delay policy still allows
//! waiting.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::socket::{TcpControl, TcpSocket};
use crate::stack::NetworkStack;

/// Connections awaiting a coalesced acknowledgement, keyed by socket id.
#[derive(Debug, Default)]
pub struct DelayedAckSet {
    sockets: Mutex<BTreeMap<u64, Arc<TcpSocket>>>,
}

impl DelayedAckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, socket: &Arc<TcpSocket>) {
        self.sockets.lock().insert(socket.id(), socket.clone());
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

    /// Empty the set, returning its members.
    pub fn take_all(&self) -> Vec<Arc<TcpSocket>> {
        let drained = core::mem::take(&mut *self.sockets.lock());
        drained.into_values().collect()
    }
}

/// Acknowledge now, or park the connection for the next flush.
pub fn send_delayed_tcp_ack(stack: &NetworkStack, socket: &Arc<TcpSocket>, ctl: &mut TcpControl) {
    if !ctl.should_delay_next_ack(stack) {
        if let Err(e) = socket.send_ack(ctl, stack, false) {
            klog!(Debug, "tcp: {} ack failed: {}", socket.key(), e);
        }
        return;
    }
    stack.delayed_acks().insert(socket);
}

/// Flush every parked connection whose delay has run out.
pub fn flush_delayed_tcp_acks(stack: &NetworkStack) {
    let pending = stack.delayed_acks().take_all();
    if pending.is_empty() {
        return;
    }

    let mut flushed = 0u64;
    for socket in pending {
        let mut ctl = socket.lock();
        if ctl.should_delay_next_ack(stack) {
            stack.delayed_acks().insert(&socket);
            continue;
        }
        match socket.send_ack(&mut ctl, stack, false) {
            Ok(()) => flushed += 1,
            Err(e) => klog!(Debug, "tcp: {} delayed ack failed: {}", socket.key(), e),
        }
    }
    stack.stats().add_delayed_acks_flushed(flushed);
}
