//! Link-Layer.
//!
//! Note that a hardware BLE radio will already implement a few aspects of the link layer (such as
//! CRC calculation, whitening and the CCM transform). This module implements the rest of the Link
//! Layer on top of it: the advertiser, scanner and initiator roles, connection events,
//! acknowledgement and flow control, and the Link-Layer Control Protocol.
//!
//! Refer to the official *Link Layer Specification* for details and more graphics and tables.
//!
//! # Roles
//!
//! Besides its connections, the controller runs at most one [`advertiser`] and one [`scanner`]
//! (which may be an initiator). A connectable advertiser and an initiator each reserve a free
//! connection context when they are enabled:
//!
//! ```notrust
//!          adv_enable                 CONNECT_IND received
//! none ------------------> advertiser --------------------> peripheral --+
//!   ^  connect_enable                 CONNECT_IND sent                    |
//!   +--------------------> initiator  --------------------> central ------+
//!   |                                                                     |
//!   +------ disable, advertising timeout, termination --------------------+
//! ```
//!
//! Advertising and scanning PDUs are described in [`advertising`].
//!
//! # Data Channel PDU
//!
//! Every PDU exchanged on a connection consists of a 16-bit header and a variably-sized payload.
//!
//! If the connection is encrypted and the payload contains at least 1 octet, a Message Integrity
//! Check (MIC) is appended at the end.
//!
//! ```notrust
//! LSB                                          MSB
//! +-----------+----------------------+ - - - - - +
//! |  Header   |        Payload       |    MIC    |
//! | (16 bits) |   (0..=251 octets)   | (32 bits) |
//! +-----------+----------------------+ - - - - - +
//! ```
//!
//! The header format is described in [`data::Header`].
//!
//! # Connection events
//!
//! A connection consists of periodic *connection events*. At the start of each event (the
//! *anchor point*), the central sends a PDU, and the peripheral answers one inter frame space
//! later. The exchange continues while either side sets the `MD` ("more data") bit, and ends
//! otherwise.
//!
//! The controller drives each event in three steps, invoked by the platform glue:
//!
//! 1. **prepare**, when the connection's scheduler timer fires ahead of the anchor. Pending
//!    procedures advance and the event's channel and receive window are computed.
//! 2. **execute**, when the radio should start. The radio is tuned and the first transfer is
//!    armed: transmit for the central, receive for the peripheral.
//! 3. **radio events**, one per completed transfer, until the event closes. Closing updates the
//!    supervision and procedure timers and tells the scheduler about clock drift.
//!
//! [`data::Header`]: data/struct.Header.html
//! [`advertiser`]: advertiser/index.html
//! [`scanner`]: scanner/index.html
//! [`advertising`]: advertising/index.html

pub mod access_address;
pub mod advertiser;
pub mod advertising;
pub mod chan_sel;
pub mod channel_map;
pub mod connect;
mod connection;
pub mod controller;
pub mod data;
mod event;
pub mod features;
pub mod llcp;
#[cfg(test)]
pub(crate) mod mock;
pub mod notification;
pub mod pipe;
pub mod pool;
pub mod procedure;
pub mod scanner;
mod seq_num;
mod tx_list;

pub use self::advertiser::{AdvChannels, AdvParams};
pub use self::advertising::{AddressKind, AdvReport, DeviceAddress};
pub use self::controller::Controller;
pub use self::notification::Notification;
pub use self::pipe::RxEvent;
pub use self::procedure::conn_update::ConnParams;
pub use self::procedure::length::DataLength;
pub use self::scanner::ScanParams;
pub use self::seq_num::SeqNum;

use core::fmt;

/// Maximum number of simultaneous connections.
pub const MAX_CONNECTIONS: usize = 4;

/// Max. data channel PDU payload size in octets.
pub const MAX_PAYLOAD_SIZE: usize = 251;

/// Smallest maximum payload size a connection may use, in octets.
pub const MIN_PAYLOAD_SIZE: u16 = 27;

/// Air time of a minimum-size PDU on LE 1M, in µs.
pub const MIN_PAYLOAD_TIME: u16 = 328;

/// Air time of a maximum-size PDU on LE Coded, in µs.
pub const MAX_PAYLOAD_TIME: u16 = 17040;

/// Number of control PDU buffers shared by all connections.
pub const TX_CTRL_POOL_SIZE: usize = 8;

/// Number of host data PDU buffers.
pub const TX_DATA_POOL_SIZE: usize = 8;

/// Number of receive buffers for data PDUs.
pub const RX_POOL_SIZE: usize = 8;

// Pipes hold one element less than their size.
pub(crate) const TX_PIPE_SIZE: usize = TX_DATA_POOL_SIZE + 1;
pub(crate) const RELEASE_PIPE_SIZE: usize = TX_DATA_POOL_SIZE + 1;
pub(crate) const RX_PIPE_SIZE: usize = 32;
pub(crate) const REPORT_PIPE_SIZE: usize = 9;

/// Identifies a connection.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnHandle(u8);

impl ConnHandle {
    /// Creates the handle of connection context `index`.
    ///
    /// # Panics
    ///
    /// This will panic if `index` is not less than `MAX_CONNECTIONS`.
    pub fn new(index: u8) -> Self {
        assert!(usize::from(index) < MAX_CONNECTIONS);
        ConnHandle(index)
    }

    /// Returns the handle as it appears on the host interface.
    pub fn as_u16(&self) -> u16 {
        self.0.into()
    }

    /// Returns the index of the connection context.
    pub fn index(&self) -> usize {
        self.0.into()
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of the local device on a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection, owns its timing.
    Central,
    /// Accepted the connection while advertising.
    Peripheral,
}
