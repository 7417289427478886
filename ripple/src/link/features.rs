use crate::{bytes::*, Error};
use bitflags::bitflags;

bitflags! {
    /// A set of optional Link Layer features, as exchanged by the feature exchange procedure.
    pub struct FeatureSet: u64 {
        /// Low-Energy data encryption.
        ///
        /// Enables `LL_ENC_REQ`, `LL_ENC_RSP`, `LL_START_ENC_REQ`, `LL_START_ENC_RSP`,
        /// `LL_PAUSE_ENC_REQ` and `LL_PAUSE_ENC_RSP` and the *Encryption Start* and *Encryption
        /// Pause* procedures.
        const LE_ENCRYPTION = (1 << 0);

        /// Connection parameters request procedure.
        ///
        /// Enables `LL_REJECT_EXT_IND`, `LL_CONNECTION_PARAM_REQ` and
        /// `LL_CONNECTION_PARAM_RSP`. A peer without it only understands
        /// `LL_CONNECTION_UPDATE_IND` sent by the central.
        const CONN_PARAM_REQ = (1 << 1);

        /// Support for the LL Control PDU `LL_REJECT_EXT_IND`.
        ///
        /// Peers lacking it get collisions rejected with `LL_REJECT_IND` instead.
        const EXTENDED_REJECT_INDICATION = (1 << 2);

        /// Peripheral-initiated feature exchange (`LL_PERIPHERAL_FEATURE_REQ`).
        const PERIPHERAL_FEATURE_EXCHANGE = (1 << 3);

        /// Low-Energy Link-Layer ping exchange and the authenticated payload timeout.
        const LE_PING = (1 << 4);

        /// Link-Layer PDU length update (`LL_LENGTH_REQ`, `LL_LENGTH_RSP`).
        const LE_PACKET_LENGTH_EXTENSION = (1 << 5);

        /// Support for untrackable randomized device addresses (LL Privacy).
        const LL_PRIVACY = (1 << 6);

        /// Extended scan filter policies.
        const EXT_SCANNER_FILTER_POLICIES = (1 << 7);

        /// The LE 2M PHY.
        const LE_2M_PHY = (1 << 8);

        /// Stable modulation index when transmitting.
        const STABLE_MODULATION_INDEX_TX = (1 << 9);

        /// Stable modulation index when receiving.
        const STABLE_MODULATION_INDEX_RX = (1 << 10);

        /// The LE Coded PHY.
        const LE_CODED_PHY = (1 << 11);

        /// Extended advertising.
        const LE_EXTENDED_ADVERTISING = (1 << 12);

        /// Periodic advertising.
        const LE_PERIODIC_ADVERTISING = (1 << 13);

        /// Channel selection algorithm #2.
        const CHANNEL_SELECTION_ALGORITHM_2 = (1 << 14);

        /// LE power class 1.
        const LE_POWER_CLASS_1 = (1 << 15);

        /// Minimum number of used channels procedure.
        const MIN_USED_CHANNELS = (1 << 16);
    }
}

impl FeatureSet {
    /// Returns the feature set Ripple can support.
    ///
    /// A controller advertises the subset enabled in its `Settings`.
    pub fn supported() -> Self {
        FeatureSet::LE_ENCRYPTION
            | FeatureSet::CONN_PARAM_REQ
            | FeatureSet::EXTENDED_REJECT_INDICATION
            | FeatureSet::PERIPHERAL_FEATURE_EXCHANGE
            | FeatureSet::LE_PING
            | FeatureSet::LE_PACKET_LENGTH_EXTENSION
            | FeatureSet::LE_2M_PHY
            | FeatureSet::LE_CODED_PHY
            | FeatureSet::CHANNEL_SELECTION_ALGORITHM_2
    }

    /// Computes the feature set used on a connection after a feature exchange.
    ///
    /// All octets are the logical `AND` of both sets, except octet 0 which is taken from the
    /// peer's set unmodified.
    pub fn negotiate(&self, peer: FeatureSet) -> FeatureSet {
        let octet0 = peer.bits() & 0xff;
        let rest = self.bits() & peer.bits() & !0xff;
        FeatureSet::from_bits_truncate(octet0 | rest)
    }
}

impl ToBytes for FeatureSet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u64_le(self.bits())
    }
}

impl<'a> FromBytes<'a> for FeatureSet {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_u64_le()?;
        Ok(Self::from_bits_truncate(raw))
    }
}
