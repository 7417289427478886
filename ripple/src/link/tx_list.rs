//! Per-connection transmit queue.

use crate::link::{pool::Handle, TX_CTRL_POOL_SIZE, TX_DATA_POOL_SIZE};
use heapless::{spsc::Queue, Vec};

/// A queued PDU, identified by its pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxNode {
    /// A control PDU from the control pool.
    Ctrl(Handle),
    /// A host data PDU from the data pool.
    Data(Handle),
}

/// What went on air last and is awaiting acknowledgement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Inflight {
    Empty,
    Ctrl(Handle),
    /// A fragment of `len` bytes of the data head, starting at its current offset.
    Data { len: u8 },
}

/// The data PDU currently being fragmented.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataHead {
    pub node: Handle,
    /// Number of payload bytes already acknowledged.
    pub offset: u8,
}

/// What to transmit next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxPick {
    /// The last PDU was not acknowledged and must be sent again unchanged.
    Retransmit(Inflight),
    /// Send this control PDU.
    Ctrl(Handle),
    /// Send the next fragment of the data head.
    Data(DataHead),
    /// Nothing may be sent; transmit an empty PDU.
    Empty,
}

/// Result of the peer acknowledging the in-flight PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Acked {
    Nothing,
    /// A control PDU was delivered; it is no longer part of the list.
    Ctrl(Handle),
    /// A fragment was delivered, more of the data head remains.
    Fragment,
    /// The last fragment of a data PDU was delivered; it is no longer part of the list.
    Data(Handle),
}

/// Transmit list of a connection.
///
/// Control PDUs always go before queued data, but never displace a PDU that is in flight: the
/// in-flight PDU is retransmitted until acknowledged. A data PDU being fragmented may be
/// interleaved with control PDUs.
pub struct TxList {
    inflight: Option<Inflight>,
    data_head: Option<DataHead>,
    ctrl: Vec<Handle, TX_CTRL_POOL_SIZE>,
    data: Queue<Handle, { TX_DATA_POOL_SIZE + 1 }>,
}

impl TxList {
    pub fn new() -> Self {
        Self {
            inflight: None,
            data_head: None,
            ctrl: Vec::new(),
            data: Queue::new(),
        }
    }

    /// Appends a control PDU.
    pub fn push_ctrl(&mut self, node: Handle) -> Result<(), Handle> {
        self.ctrl.push(node)
    }

    /// Appends a host data PDU.
    pub fn push_data(&mut self, node: Handle) -> Result<(), Handle> {
        self.data.enqueue(node)
    }

    /// Returns whether anything besides the in-flight PDU is waiting to be sent.
    pub fn has_queued(&self) -> bool {
        !self.ctrl.is_empty() || !self.data.is_empty() || self.data_head.is_some()
    }

    /// Returns whether control PDUs or whole data PDUs are waiting, not counting the data head.
    pub fn has_waiting(&self) -> bool {
        !self.ctrl.is_empty() || !self.data.is_empty()
    }

    /// Returns whether the list is completely empty.
    pub fn is_idle(&self) -> bool {
        !self.has_queued() && self.inflight_pdu().is_none()
    }

    /// Returns the in-flight PDU, unless it is an empty PDU.
    pub fn inflight_pdu(&self) -> Option<Inflight> {
        match self.inflight {
            Some(Inflight::Empty) | None => None,
            other => other,
        }
    }

    /// Returns the data PDU being fragmented.
    pub fn data_head(&self) -> Option<DataHead> {
        self.data_head
    }

    /// Returns whether a control PDU with an opcode matching `pred` is queued or in flight.
    pub fn ctrl_queued(&self, mut pred: impl FnMut(Handle) -> bool) -> bool {
        if let Some(Inflight::Ctrl(h)) = self.inflight {
            if pred(h) {
                return true;
            }
        }
        self.ctrl.iter().any(|&h| pred(h))
    }

    /// Picks the next PDU to transmit.
    ///
    /// `ctrl_allowed` filters the queued control PDUs; the first one it accepts is sent. Data is
    /// only sent if `data_allowed` is set and no control PDU qualifies.
    pub fn pick(
        &mut self,
        data_allowed: bool,
        mut ctrl_allowed: impl FnMut(Handle) -> bool,
    ) -> TxPick {
        if let Some(inflight) = self.inflight {
            return TxPick::Retransmit(inflight);
        }

        if let Some(pos) = self.ctrl.iter().position(|&h| ctrl_allowed(h)) {
            self.ctrl[pos..].rotate_left(1);
            if let Some(node) = self.ctrl.pop() {
                self.inflight = Some(Inflight::Ctrl(node));
                return TxPick::Ctrl(node);
            }
        }

        if data_allowed {
            if self.data_head.is_none() {
                self.data_head = self.data.dequeue().map(|node| DataHead { node, offset: 0 });
            }
            if let Some(head) = self.data_head {
                return TxPick::Data(head);
            }
        }

        TxPick::Empty
    }

    /// Records that a fragment of `len` bytes of the data head went on air.
    pub fn sent_data(&mut self, len: u8) {
        debug_assert!(self.data_head.is_some());
        self.inflight = Some(Inflight::Data { len });
    }

    /// Records that an empty PDU went on air.
    pub fn sent_empty(&mut self) {
        debug_assert!(self.inflight.is_none());
        self.inflight = Some(Inflight::Empty);
    }

    /// Processes the acknowledgement of the in-flight PDU.
    ///
    /// `total_len` returns the payload length of a data node.
    pub fn acked(&mut self, total_len: impl FnOnce(Handle) -> u8) -> Acked {
        match self.inflight.take() {
            None | Some(Inflight::Empty) => Acked::Nothing,
            Some(Inflight::Ctrl(node)) => Acked::Ctrl(node),
            Some(Inflight::Data { len }) => match self.data_head.as_mut() {
                Some(head) => {
                    head.offset = head.offset.saturating_add(len);
                    if head.offset >= total_len(head.node) {
                        let node = head.node;
                        self.data_head = None;
                        Acked::Data(node)
                    } else {
                        Acked::Fragment
                    }
                }
                None => Acked::Nothing,
            },
        }
    }

    /// Removes every PDU from the list, passing each to `f`.
    pub fn flush(&mut self, mut f: impl FnMut(TxNode)) {
        if let Some(Inflight::Ctrl(node)) = self.inflight.take() {
            f(TxNode::Ctrl(node));
        }
        for &node in self.ctrl.iter() {
            f(TxNode::Ctrl(node));
        }
        self.ctrl.clear();
        if let Some(head) = self.data_head.take() {
            f(TxNode::Data(head.node));
        }
        while let Some(node) = self.data.dequeue() {
            f(TxNode::Data(node));
        }
    }
}

impl Default for TxList {
    fn default() -> Self {
        Self::new()
    }
}
