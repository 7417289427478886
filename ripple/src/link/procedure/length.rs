//! Data length update procedure.

use super::ProcedureSlot;
use crate::{
    config::Config,
    link::{
        connection::Connection,
        controller::Shared,
        features::FeatureSet,
        llcp::{ControlPdu, LengthData},
        notification::Notification,
        MAX_PAYLOAD_SIZE, MAX_PAYLOAD_TIME, MIN_PAYLOAD_SIZE, MIN_PAYLOAD_TIME,
    },
    RequestError,
};
use core::cmp;

/// Maximum PDU sizes of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataLength {
    /// What we're willing to send, as configured by the host.
    pub local_tx_octets: u16,
    pub local_tx_time: u16,
    /// What we can receive.
    pub local_rx_octets: u16,
    pub local_rx_time: u16,

    /// Effective values, agreed on with the peer.
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

impl DataLength {
    pub fn new(tx_octets: u16, tx_time: u16) -> Self {
        Self {
            local_tx_octets: tx_octets,
            local_tx_time: tx_time,
            local_rx_octets: MAX_PAYLOAD_SIZE as u16,
            local_rx_time: MAX_PAYLOAD_TIME,
            max_tx_octets: MIN_PAYLOAD_SIZE,
            max_tx_time: MIN_PAYLOAD_TIME,
            max_rx_octets: MIN_PAYLOAD_SIZE,
            max_rx_time: MIN_PAYLOAD_TIME,
        }
    }

    /// Returns the `LengthData` we send in `LL_LENGTH_REQ` and `LL_LENGTH_RSP`.
    pub fn local(&self) -> LengthData {
        LengthData {
            max_rx_octets: self.local_rx_octets,
            max_rx_time: self.local_rx_time,
            max_tx_octets: self.local_tx_octets,
            max_tx_time: self.local_tx_time,
        }
    }

    /// Computes the effective values from the peer's `LengthData`.
    ///
    /// Returns whether any of them changed.
    pub fn update(&mut self, peer: &LengthData) -> bool {
        let before = *self;
        self.max_tx_octets = cmp::max(
            MIN_PAYLOAD_SIZE,
            cmp::min(self.local_tx_octets, peer.max_rx_octets),
        );
        self.max_tx_time = cmp::max(
            MIN_PAYLOAD_TIME,
            cmp::min(self.local_tx_time, peer.max_rx_time),
        );
        self.max_rx_octets = cmp::max(
            MIN_PAYLOAD_SIZE,
            cmp::min(self.local_rx_octets, peer.max_tx_octets),
        );
        self.max_rx_time = cmp::max(
            MIN_PAYLOAD_TIME,
            cmp::min(self.local_rx_time, peer.max_tx_time),
        );
        *self != before
    }
}

/// Checks host-supplied transmit sizes.
pub fn validate(tx_octets: u16, tx_time: u16) -> Result<(), RequestError> {
    if (MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE as u16).contains(&tx_octets)
        && (MIN_PAYLOAD_TIME..=MAX_PAYLOAD_TIME).contains(&tx_time)
    {
        Ok(())
    } else {
        Err(RequestError::InvalidParameters)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LengthState {
    Send,
    RspWait,
}

#[derive(Debug)]
pub(crate) struct LengthProc {
    pub slot: ProcedureSlot,
    pub state: LengthState,
}

impl LengthProc {
    pub fn new() -> Self {
        Self {
            slot: ProcedureSlot::new(),
            state: LengthState::Send,
        }
    }
}

/// Starts a data length update with new local transmit sizes.
pub(crate) fn request(
    conn: &mut Connection,
    tx_octets: u16,
    tx_time: u16,
) -> Result<(), RequestError> {
    validate(tx_octets, tx_time)?;
    if !conn.peer_supports(FeatureSet::LE_PACKET_LENGTH_EXTENSION) {
        return Err(RequestError::UnsupportedFeature);
    }
    conn.length.slot.request()?;
    conn.length.state = LengthState::Send;
    conn.data_len.local_tx_octets = tx_octets;
    conn.data_len.local_tx_time = tx_time;
    Ok(())
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if !conn.length.slot.pending() || conn.length.state != LengthState::Send {
        return;
    }
    let data = conn.data_len.local();
    if sh.send_ctrl(conn, ControlPdu::LengthReq(data)).is_ok() {
        conn.length.state = LengthState::RspWait;
    }
}

/// Handles `LL_LENGTH_REQ`.
pub(crate) fn rx_req<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, peer: LengthData) {
    let data = conn.data_len.local();
    if sh.send_ctrl(conn, ControlPdu::LengthRsp(data)).is_err() {
        return;
    }
    // Our own request would carry the same values; the peer's exchange covers it.
    if conn.length.slot.pending() && conn.length.state == LengthState::Send {
        conn.length.slot.complete();
    }
    changed(conn, sh, &peer);
}

/// Handles `LL_LENGTH_RSP`.
pub(crate) fn rx_rsp<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, peer: LengthData) {
    if conn.length.slot.pending() && conn.length.state == LengthState::RspWait {
        conn.length.slot.complete();
    }
    changed(conn, sh, &peer);
}

fn changed<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, peer: &LengthData) {
    if conn.data_len.update(peer) {
        let d = conn.data_len;
        debug!("conn {:?}: new data length {:?}", conn.handle, d);
        let _ = sh.notify(
            conn.handle,
            Notification::LengthChange {
                max_tx_octets: d.max_tx_octets,
                max_tx_time: d.max_tx_time,
                max_rx_octets: d.max_rx_octets,
                max_rx_time: d.max_rx_time,
            },
        );
    }
}

/// The peer doesn't know `LL_LENGTH_REQ`.
pub(crate) fn rejected(conn: &mut Connection) {
    conn.features_used
        .remove(FeatureSet::LE_PACKET_LENGTH_EXTENSION);
    conn.length.slot.complete();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_bounds() {
        assert!(validate(27, 328).is_ok());
        assert!(validate(251, 17040).is_ok());
        assert!(validate(26, 328).is_err());
        assert!(validate(252, 328).is_err());
        assert!(validate(100, 327).is_err());
        assert!(validate(100, 17041).is_err());
    }

    #[test]
    fn effective_sizes() {
        let mut len = DataLength::new(251, 2120);
        assert_eq!(len.max_tx_octets, 27);

        let peer = LengthData {
            max_rx_octets: 100,
            max_rx_time: 17040,
            max_tx_octets: 10,
            max_tx_time: 400,
        };
        assert!(len.update(&peer));
        assert_eq!(len.max_tx_octets, 100);
        assert_eq!(len.max_tx_time, 2120);
        // never below the minimum
        assert_eq!(len.max_rx_octets, 27);
        assert_eq!(len.max_rx_time, 400);

        assert!(!len.update(&peer));
    }
}
