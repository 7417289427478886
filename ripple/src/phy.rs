//! Physical layer interactions.
//!
//! Don't expect to see much code here: Most of this layer is hardware, reached through the
//! [`Radio`] trait.
//!
//! BLE data is transmitted on 40 different RF channels numbered from 0 to 39 with ascending
//! frequencies. Channels 0, 12 and 39 are reserved for advertising, all others are used for data
//! transmission. The Link Layer uses "Channel Indices" which reorder the RF channels so that
//! indices 0..=36 refer to data channels, and 37..=39 to the advertising channels.
//!
//! [`Radio`]: trait.Radio.html

use crate::{
    bytes::*,
    link::{advertising, data::Header},
    time::Duration,
    Error,
};
use bitflags::bitflags;

/// Returns the center frequency in MHz corresponding to an RF channel.
fn rf_channel_freq(rf_channel: u8) -> u16 {
    2402 + u16::from(rf_channel) * 2
}

/// One of the three advertising channels (channel indices 37..=39).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingChannel(u8);

impl AdvertisingChannel {
    /// Returns the first (lowest-numbered) advertising channel.
    pub fn first() -> Self {
        AdvertisingChannel(37)
    }

    /// Creates an `AdvertisingChannel` from a raw index.
    ///
    /// # Panics
    ///
    /// This will panic if `index` is not in range 37..=39.
    pub fn new(index: u8) -> Self {
        assert!((37..=39).contains(&index));
        AdvertisingChannel(index)
    }

    /// Returns an iterator over all advertising channels, in ascending order.
    pub fn iter_all() -> impl Iterator<Item = Self> {
        (37..=39).map(AdvertisingChannel)
    }

    /// Returns the next advertising channel, or the first one if `self` is the last channel.
    pub fn cycle(&self) -> Self {
        if self.0 == 39 {
            AdvertisingChannel(37)
        } else {
            AdvertisingChannel(self.0 + 1)
        }
    }

    /// Returns the channel index (37, 38 or 39).
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the RF channel corresponding to this advertising channel index.
    ///
    /// RF channels 0, 12 and 39 are used for advertising.
    pub fn rf_channel(&self) -> u8 {
        match self.0 {
            37 => 0,
            38 => 12,
            _ => 39,
        }
    }

    /// Returns the center frequency of this channel in MHz.
    pub fn freq(&self) -> u16 {
        rf_channel_freq(self.rf_channel())
    }

    /// Calculates the initial value of the LFSR to use for data whitening.
    pub fn whitening_iv(&self) -> u8 {
        0b01000000 | self.0
    }
}

/// One of 37 data channels on which data channel PDUs are sent between connected devices.
///
/// (channel indices 0..=36)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataChannel(u8);

impl DataChannel {
    /// Creates a `DataChannel` from a raw index.
    ///
    /// # Panics
    ///
    /// This will panic if `index` is not a valid data channel index. Valid indices are 0..=36.
    pub fn new(index: u8) -> Self {
        assert!(index <= 36);
        DataChannel(index)
    }

    /// Returns the data channel index.
    ///
    /// The returned value is always in range 0..=36.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the RF channel corresponding to this data channel index.
    ///
    /// RF channels 1-11 and 13-38 are used for data transmission.
    pub fn rf_channel(&self) -> u8 {
        match self.0 {
            ch @ 0..=10 => ch + 1,
            ch => ch + 2,
        }
    }

    /// Returns the center frequency of this channel in MHz.
    pub fn freq(&self) -> u16 {
        rf_channel_freq(self.rf_channel())
    }

    /// Calculates the initial value of the LFSR to use for data whitening.
    ///
    /// The value is a 7-bit value. The MSb will always be 0, and the 2nd MSb always 1 (Position 0).
    /// The LSb contains Position 6.
    pub fn whitening_iv(&self) -> u8 {
        0b01000000 | self.0
    }
}

/// A PHY a connection can use in one direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

impl Phy {
    /// Time from the start of the preamble until the access address has been received.
    ///
    /// This is the minimum receive window, and the reference used for drift compensation.
    pub fn preamble_to_address(&self) -> Duration {
        Duration::from_micros(match self {
            Phy::Le1M => 40,
            Phy::Le2M => 24,
            Phy::LeCoded => 376,
        })
    }

    /// Air time of one octet of payload.
    pub fn octet_time(&self) -> Duration {
        Duration::from_micros(match self {
            Phy::Le1M => 8,
            Phy::Le2M => 4,
            Phy::LeCoded => 64,
        })
    }
}

bitflags! {
    /// A set of PHYs, as carried by `LL_PHY_REQ`, `LL_PHY_RSP` and `LL_PHY_UPDATE_IND`.
    #[derive(Default)]
    pub struct PhySet: u8 {
        const LE_1M = 1 << 0;
        const LE_2M = 1 << 1;
        const LE_CODED = 1 << 2;
    }
}

impl PhySet {
    /// Picks the PHY to switch to from a set of acceptable ones.
    ///
    /// 2M is preferred over 1M, and 1M over Coded. Returns an empty set if `self` is empty.
    pub fn select(&self) -> PhySet {
        if self.contains(PhySet::LE_2M) {
            PhySet::LE_2M
        } else if self.contains(PhySet::LE_1M) {
            PhySet::LE_1M
        } else if self.contains(PhySet::LE_CODED) {
            PhySet::LE_CODED
        } else {
            PhySet::empty()
        }
    }

    /// Returns the `Phy` if `self` contains exactly one PHY.
    pub fn single(&self) -> Option<Phy> {
        match *self {
            s if s == PhySet::LE_1M => Some(Phy::Le1M),
            s if s == PhySet::LE_2M => Some(Phy::Le2M),
            s if s == PhySet::LE_CODED => Some(Phy::LeCoded),
            _ => None,
        }
    }
}

impl From<Phy> for PhySet {
    fn from(phy: Phy) -> Self {
        match phy {
            Phy::Le1M => PhySet::LE_1M,
            Phy::Le2M => PhySet::LE_2M,
            Phy::LeCoded => PhySet::LE_CODED,
        }
    }
}

impl ToBytes for PhySet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.bits())
    }
}

impl FromBytes<'_> for PhySet {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(PhySet::from_bits_truncate(bytes.read_u8()?))
    }
}

/// Per-direction parameters for the radio's AES-CCM engine.
///
/// The controller owns the packet counter and hands the current value to the radio with every
/// armed transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ccm {
    /// The session key.
    pub key: [u8; 16],
    /// The 64-bit IV formed from `IVm || IVs`.
    pub iv: [u8; 8],
    /// 39-bit packet counter.
    pub counter: u64,
    /// Direction bit: set for PDUs sent by the central.
    pub direction: bool,
}

/// Completion of an armed radio transfer, reported via `Controller::radio_event`.
#[derive(Debug)]
pub enum RadioEvent<'a> {
    /// The PDU given to [`Radio::arm_transmit`] has been sent.
    ///
    /// [`Radio::arm_transmit`]: trait.Radio.html#tymethod.arm_transmit
    TxDone,

    /// A packet was received.
    RxDone(Received<'a>),

    /// The receive window closed without an access address match.
    RxTimeout,

    /// A packet was received on an advertising channel.
    AdvRxDone(AdvReceived<'a>),
}

/// A received data channel packet.
#[derive(Debug)]
pub struct Received<'a> {
    /// Decoded PDU header.
    pub header: Header,

    /// Payload, decrypted if CCM was active. Does not include the MIC.
    pub payload: &'a [u8],

    /// Whether the CRC matched.
    pub crc_ok: bool,

    /// Whether the MIC matched. Always `true` for unencrypted PDUs.
    pub mic_ok: bool,

    /// Received signal strength as a positive value in -dBm, if the radio sampled it.
    pub rssi: Option<u8>,

    /// Time from the radio being ready until the access address was received.
    pub start_to_address: Duration,
}

/// A received advertising channel packet.
#[derive(Debug)]
pub struct AdvReceived<'a> {
    pub header: advertising::Header,

    /// The first `header.payload_length()` bytes of the PDU payload.
    pub payload: &'a [u8],

    pub crc_ok: bool,

    /// Received signal strength as a positive value in -dBm, if the radio sampled it.
    pub rssi: Option<u8>,
}

/// Hardware interface for the radio, as used during connection and advertising events.
///
/// The radio must already implement CRC calculation, whitening and the CCM transform. Everything
/// protocol-related is left to the controller.
pub trait Radio {
    /// Tunes the radio to `channel` and sets up packet framing for a connection.
    fn configure(&mut self, channel: DataChannel, access_address: u32, crc_init: u32, phy: Phy);

    /// Get a reference to the radio's transmit buffer.
    ///
    /// The controller writes the payload of the next PDU here before calling `arm_transmit`. The
    /// buffer must hold at least 251 bytes.
    fn tx_payload_buf(&mut self) -> &mut [u8];

    /// Transmits a data channel PDU consisting of `header` and the first
    /// `header.payload_length()` bytes of the transmit buffer.
    ///
    /// If `ccm` is set, the payload must be encrypted and a MIC appended.
    fn arm_transmit(&mut self, header: Header, ccm: Option<&Ccm>);

    /// Opens a receive window of (at least) `window`, decrypting with `ccm` if set.
    fn arm_receive(&mut self, window: Duration, ccm: Option<&Ccm>);

    /// Tunes the radio to an advertising channel on LE 1M, using the advertising access address
    /// and CRC preset.
    fn configure_advertising(&mut self, channel: AdvertisingChannel);

    /// Transmits an advertising channel PDU consisting of `header` and the first
    /// `header.payload_length()` bytes of the transmit buffer.
    fn arm_transmit_advertising(&mut self, header: advertising::Header);

    /// Listens for an advertising channel PDU for (at least) `window`.
    ///
    /// Completes with `RadioEvent::AdvRxDone` or `RadioEvent::RxTimeout`.
    fn arm_receive_advertising(&mut self, window: Duration);

    /// Aborts whatever the radio is doing and powers it down.
    fn disable(&mut self);
}
