//! Events reported to the host through the rx pipe.

use crate::{
    link::{advertising::DeviceAddress, features::FeatureSet, llcp::VersionNumber, Role},
    phy::Phy,
    utils::Hex,
    ErrorCode,
};

/// A procedure outcome or connection state change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A connection was created.
    ConnectionComplete {
        role: Role,
        /// The peer's address, if the connection was created by the advertiser or initiator.
        peer: Option<DeviceAddress>,
        /// Connection interval, in 1.25 ms units.
        interval: u16,
        latency: u16,
        /// Supervision timeout, in 10 ms units.
        timeout: u16,
    },

    /// The advertiser or initiator holding this connection context stopped without creating a
    /// connection. The context is free again.
    ///
    /// `status` is `AdvertisingTimeout` when high duty cycle directed advertising ran out, or
    /// `UnknownConnectionId` when the host cancelled the initiator.
    ConnectionFailed { status: ErrorCode },

    /// Reports the channel selection algorithm used on a new connection (0 or 1 for #1 or #2).
    ChannelSelection { algorithm: u8 },

    /// The connection was closed. Always the last event of a connection.
    Terminated { reason: ErrorCode },

    /// A connection update procedure completed.
    ConnectionUpdateComplete {
        status: ErrorCode,
        interval: u16,
        latency: u16,
        timeout: u16,
    },

    /// The peer asks for new connection parameters. Answer with `Controller::conn_param_reply`.
    ConnectionParamRequest {
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    },

    /// A feature exchange completed.
    FeatureExchangeComplete {
        status: ErrorCode,
        features: FeatureSet,
    },

    /// A version exchange completed.
    VersionExchangeComplete {
        status: ErrorCode,
        version: VersionNumber,
        company_id: Hex<u16>,
        sub_version: Hex<u16>,
    },

    /// Encryption was started (or failed to start).
    EncryptionChange { status: ErrorCode, enabled: bool },

    /// The session key of an encrypted connection was refreshed.
    EncryptionRefresh { status: ErrorCode },

    /// The central started encryption. Answer with `Controller::ltk_reply`.
    LtkRequest { rand: Hex<u64>, ediv: Hex<u16> },

    /// The effective PDU sizes changed.
    LengthChange {
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },

    /// A PHY update procedure completed.
    PhyUpdateComplete { status: ErrorCode, tx: Phy, rx: Phy },

    /// No authenticated (MIC-protected) PDU was received within the authenticated payload timeout.
    AuthPayloadTimeout,

    /// The sampled RSSI changed significantly. The value is in -dBm.
    Rssi { rssi: u8 },
}
