//! Single-producer single-consumer pipes between the radio and the host contexts.
//!
//! Three pipes connect the two execution contexts:
//!
//! * The **tx pipe** carries host data PDUs (as pool handles) into the worker, which moves them
//!   into the tx list of their connection at the next prepare.
//! * The **release pipe** returns transmitted (or flushed) data PDUs to the host side, which
//!   frees them and reports completed packets.
//! * The **rx pipe** carries received data PDUs and notifications to the host.
//! * The **report pipe** carries advertising PDUs received by the scanner to the host.
//!
//! Each element is owned by exactly one pipe stage at a time.

use crate::link::{advertising::AdvReport, notification::Notification, pool::Handle, ConnHandle};
use heapless::spsc::Queue;

/// A bounded SPSC FIFO.
///
/// Holds up to `N - 1` elements.
pub struct Pipe<T, const N: usize> {
    queue: Queue<T, N>,
}

impl<T, const N: usize> Pipe<T, N> {
    /// Creates an empty pipe.
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Appends `item`, handing it back if the pipe is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        self.queue.enqueue(item)
    }

    /// Removes the oldest element.
    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.dequeue()
    }

    /// Returns the oldest element without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.queue.peek()
    }

    /// Returns the number of queued elements.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the pipe is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns how many more elements fit.
    pub fn free_slots(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }
}

impl<T, const N: usize> Default for Pipe<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A host data PDU on its way to a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxItem {
    pub handle: ConnHandle,
    pub node: Handle,
}

/// A data PDU returned from a connection's tx list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReleaseItem {
    pub handle: ConnHandle,
    pub node: Handle,
    /// Whether the PDU was acknowledged by the peer, as opposed to flushed on termination.
    pub counted: bool,
}

/// Payload of an rx pipe element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RxKind {
    /// A received data PDU, stored in the rx pool.
    Pdu(Handle),
    Notify(Notification),
}

/// An rx pipe element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RxItem {
    pub handle: ConnHandle,
    pub kind: RxKind,
}

/// Something the controller reports to the host, as returned by `Controller::rx_get`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// `count` data PDUs queued on connection `handle` were acknowledged by the peer and their
    /// buffers have been freed.
    Completed { handle: ConnHandle, count: u8 },

    /// A data PDU was received on `handle`.
    ///
    /// The PDU is accessible through `Controller::rx_pdu` until it is handed back with
    /// `Controller::rx_release`.
    Pdu { handle: ConnHandle, node: Handle },

    /// A procedure completed or the connection state changed.
    Notify {
        handle: ConnHandle,
        event: Notification,
    },

    /// The scanner received an advertising PDU.
    AdvReport(AdvReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_capacity() {
        let mut pipe = Pipe::<u8, 4>::new();
        assert_eq!(pipe.free_slots(), 3);
        pipe.enqueue(1).unwrap();
        pipe.enqueue(2).unwrap();
        pipe.enqueue(3).unwrap();
        assert_eq!(pipe.enqueue(4), Err(4));
        assert_eq!(pipe.free_slots(), 0);
        assert_eq!(pipe.peek(), Some(&1));
        assert_eq!(pipe.dequeue(), Some(1));
        assert_eq!(pipe.dequeue(), Some(2));
        assert_eq!(pipe.len(), 1);
        assert_eq!(pipe.dequeue(), Some(3));
        assert!(pipe.is_empty());
        assert_eq!(pipe.dequeue(), None);
    }
}
