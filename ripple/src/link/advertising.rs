//! Advertising channel PDUs.
//!
//! Each advertising channel PDU consists of a 16-bit header and a payload of up to 37 octets:
//!
//! ```notrust
//! LSB                                                                     MSB
//! +------------+---------+---------+---------+---------+------------------+
//! |  PDU Type  |    -    |  ChSel  |  TxAdd  |  RxAdd  |      Length      |
//! |  (4 bits)  | (1 bit) | (1 bit) | (1 bit) | (1 bit) |     (8 bits)     |
//! +------------+---------+---------+---------+---------+------------------+
//! ```
//!
//! The controller treats advertising and scan response data as opaque bytes supplied by the host.
//! It only looks at the addresses in the payload, which always start with the sender's 6-octet
//! address (`AdvA`, `ScanA` or `InitA`).

use crate::utils::HexSlice;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// Access Address used for all advertising channel packets.
pub const ADVERTISING_ADDRESS: u32 = 0x8E89BED6;

/// CRC initialization value for advertising channel packets.
pub const CRC_PRESET: u32 = 0x555555;

/// Max. size of advertising or scan response data, in octets.
pub const MAX_ADV_DATA: usize = 31;

/// Max. advertising channel PDU payload size, in octets.
pub const MAX_PAYLOAD_SIZE: usize = 37;

/// Payload size of `SCAN_REQ` (`ScanA` and `AdvA`).
pub const SCAN_REQ_SIZE: u8 = 12;

/// Payload size of `CONNECT_IND` (`InitA`, `AdvA` and `LLData`).
pub const CONNECT_IND_PDU_SIZE: u8 = 34;

/// Whether a device address is public or random.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressKind {
    Public,
    Random,
}

/// A 48-bit Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Creates a device address from its over-the-air (little endian) representation.
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        Self { bytes, kind }
    }

    /// Reads the address at `offset` in `payload`, typed by the `TxAdd`/`RxAdd` bit `random`.
    pub fn from_payload(payload: &[u8], offset: usize, random: bool) -> Option<Self> {
        let raw = payload.get(offset..offset + 6)?;
        let mut bytes = [0; 6];
        bytes.copy_from_slice(raw);
        let kind = if random {
            AddressKind::Random
        } else {
            AddressKind::Public
        };
        Some(Self { bytes, kind })
    }

    /// Returns the raw bytes of the address.
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Returns whether this is a random address.
    pub fn is_random(&self) -> bool {
        self.kind == AddressKind::Random
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "({:?})", self.kind)
    }
}

enum_with_unknown! {
    /// 4-bit PDU type in the advertising channel PDU header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        /// Connectable and scannable undirected advertising.
        AdvInd = 0b0000,
        /// Connectable directed advertising.
        AdvDirectInd = 0b0001,
        /// Non-connectable, non-scannable undirected advertising.
        AdvNonconnInd = 0b0010,
        ScanReq = 0b0011,
        ScanRsp = 0b0100,
        ConnectInd = 0b0101,
        /// Scannable undirected advertising.
        AdvScanInd = 0b0110,
    }
}

impl PduType {
    /// Returns whether an advertiser sending this PDU accepts `CONNECT_IND`.
    pub fn is_connectable(&self) -> bool {
        matches!(self, PduType::AdvInd | PduType::AdvDirectInd)
    }

    /// Returns whether an advertiser sending this PDU answers `SCAN_REQ`.
    pub fn is_scannable(&self) -> bool {
        matches!(self, PduType::AdvInd | PduType::AdvScanInd)
    }
}

/// 16-bit advertising channel PDU header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

const CHSEL_MASK: u16 = 0b00000000_00100000;
const TXADD_MASK: u16 = 0b00000000_01000000;
const RXADD_MASK: u16 = 0b00000000_10000000;

impl Header {
    /// Creates a header for a PDU of type `ty` with an empty payload.
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)) & 0b1111)
    }

    /// Parses a header from the first 2 bytes of `raw`.
    ///
    /// # Panics
    ///
    /// This will panic if `raw` is shorter than 2 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    /// Returns the raw representation of the header.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    fn set_bit(&mut self, mask: u16, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b1111) as u8)
    }

    /// Returns the `ChSel` bit, announcing support for channel selection algorithm #2.
    pub fn chsel(&self) -> bool {
        self.0 & CHSEL_MASK != 0
    }

    pub fn set_chsel(&mut self, value: bool) {
        self.set_bit(CHSEL_MASK, value);
    }

    /// Returns the `TxAdd` bit: whether the sender's address is random.
    pub fn tx_add(&self) -> bool {
        self.0 & TXADD_MASK != 0
    }

    pub fn set_tx_add(&mut self, value: bool) {
        self.set_bit(TXADD_MASK, value);
    }

    /// Returns the `RxAdd` bit: whether the receiver's address is random.
    pub fn rx_add(&self) -> bool {
        self.0 & RXADD_MASK != 0
    }

    pub fn set_rx_add(&mut self, value: bool) {
        self.set_bit(RXADD_MASK, value);
    }

    /// Returns the length of the payload in octets.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Sets the payload length of this PDU.
    ///
    /// # Panics
    ///
    /// This will panic if `length` exceeds `MAX_PAYLOAD_SIZE`.
    pub fn set_payload_length(&mut self, length: u8) {
        assert!(usize::from(length) <= MAX_PAYLOAD_SIZE);
        self.0 = (self.0 & 0x00ff) | (u16::from(length) << 8);
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("PDU Type", &self.type_())
            .field("ChSel", &self.chsel())
            .field("TxAdd", &self.tx_add())
            .field("RxAdd", &self.rx_add())
            .field("len", &self.payload_length())
            .finish()
    }
}

/// Writes a PDU consisting of `addrs` followed by `data` into `buf` and returns its header.
///
/// `TxAdd` is taken from the first address and `RxAdd` from the second one, if any.
pub(crate) fn lower(ty: PduType, addrs: &[&DeviceAddress], data: &[u8], buf: &mut [u8]) -> Header {
    let mut len = 0;
    for addr in addrs {
        buf[len..len + 6].copy_from_slice(addr.raw());
        len += 6;
    }
    buf[len..len + data.len()].copy_from_slice(data);
    len += data.len();

    let mut header = Header::new(ty);
    header.set_payload_length(len as u8);
    header.set_tx_add(addrs.first().map_or(false, |a| a.is_random()));
    header.set_rx_add(addrs.get(1).map_or(false, |a| a.is_random()));
    header
}

/// An advertising channel PDU received by the scanner.
///
/// `data` holds the payload after `AdvA`: the advertising or scan response data, or the
/// `TargetA` of a directed advertisement.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub pdu_type: PduType,
    /// The advertiser.
    pub address: DeviceAddress,
    /// Received signal strength as a positive value in -dBm.
    pub rssi: Option<u8>,
    data: [u8; MAX_ADV_DATA],
    len: u8,
}

impl AdvReport {
    /// Builds a report from a received PDU. Returns `None` if the payload is malformed.
    pub(crate) fn new(header: Header, payload: &[u8], rssi: Option<u8>) -> Option<Self> {
        let address = DeviceAddress::from_payload(payload, 0, header.tx_add())?;
        let rest = &payload[6..];
        if rest.len() > MAX_ADV_DATA {
            return None;
        }
        let mut data = [0; MAX_ADV_DATA];
        data[..rest.len()].copy_from_slice(rest);
        Some(Self {
            pdu_type: header.type_(),
            address,
            rssi,
            data,
            len: rest.len() as u8,
        })
    }

    /// Returns the advertising data carried by the PDU.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

impl fmt::Debug for AdvReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvReport")
            .field("pdu_type", &self.pdu_type)
            .field("address", &self.address)
            .field("rssi", &self.rssi)
            .field("data", &HexSlice(self.data()))
            .finish()
    }
}
