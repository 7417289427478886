//! Data Channel structures.

use crate::link::{
    llcp::{ControlOpcode, ControlPdu},
    SeqNum, MAX_PAYLOAD_SIZE,
};
use crate::{bytes::*, utils::HexSlice, Error};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// 16-bit data channel header preceding the payload.
///
/// Layout (in Bluetooth 5.1):
///
/// ```notrust
/// LSB                                                                          MSB
/// +----------+---------+---------+---------+---------+------------+--------------+
/// |   LLID   |  NESN   |   SN    |   MD    |   CP    |     -      |    Length    |
/// | (2 bits) | (1 bit) | (1 bit) | (1 bit) | (1 bit) |  (2 bits)  |   (8 bits)   |
/// +----------+---------+---------+---------+---------+------------+--------------+
/// ```
///
/// Payload format depends on the value of the 2-bit `LLID` field:
///
/// * `0b00`: Reserved value.
/// * `0b01`: LL Data PDU Continuation fragment or empty PDU.
/// * `0b10`: LL Data PDU Start of L2CAP message (or complete message if no fragmentation
///   necessary).
/// * `0b11`: LL Control PDU.
///
/// The `NESN` field specifies the **N**ext **E**xpected **S**equence **N**umber. The `SN` field
/// specifies the **S**equence **N**umber of this PDU.
///
/// The `MD` field specifies that the device sending the packet has more data to send during this
/// *connection event*. When both central and peripheral send a packet with the `MD` bit set to 0,
/// the connection event ends.
///
/// The `Length` field specifies the length of payload **and `MIC`**.
///
/// ## Sequence Numbers
///
/// The link layer stores two 1-bit parameters for an established connection, called
/// `transmitSeqNum` and `nextExpectedSeqNum`. Both start out as 0.
///
/// When a data channel packet is sent for the first time, the `SN` field is set to
/// `transmitSeqNum`. When the packet is resent, the `SN` field is not modified. In both cases, the
/// `NESN` bit is set to `nextExpectedSeqNum`.
///
/// A received `NESN` different from `transmitSeqNum` acknowledges our last PDU, and we move on to
/// the next one. A received `SN` equal to `nextExpectedSeqNum` marks a new PDU (as opposed to a
/// retransmission) that we accept by incrementing `nextExpectedSeqNum`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

impl Header {
    /// Creates a header with the given LLID field and all other fields set to 0 (including the
    /// payload length).
    pub fn new(llid: Llid) -> Self {
        Header(llid as u16)
    }

    /// Parses a header from raw bytes.
    ///
    /// Panics when `raw` contains less than 2 Bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    /// Returns the raw representation of the header.
    ///
    /// The returned `u16` must be transmitted LSB and LSb first as the first 2 octets of the PDU.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Returns the length of the payload in octets as specified in the `Length` field.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Sets the payload length field to `len`.
    pub fn set_payload_length(&mut self, len: u8) {
        self.0 = (u16::from(len) << 8) | (self.0 & 0x00ff);
    }

    /// Returns the `LLID` field (PDU type).
    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b00 => Llid::Reserved,
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            _ => Llid::Control,
        }
    }

    /// Sets the `LLID` field.
    pub fn set_llid(&mut self, llid: Llid) {
        self.0 = (self.0 & !0b11) | llid as u16;
    }

    /// Returns the value of the `NESN` field (Next Expected Sequence Number).
    pub fn nesn(&self) -> SeqNum {
        if self.0 & 0b0100 == 0 {
            SeqNum::ZERO
        } else {
            SeqNum::ONE
        }
    }

    /// Sets the value of the `NESN` field.
    pub fn set_nesn(&mut self, nesn: SeqNum) {
        if nesn == SeqNum::ONE {
            self.0 |= 0b0100;
        } else {
            self.0 &= !0b0100;
        }
    }

    /// Returns the value of the `SN` field (Sequence Number).
    pub fn sn(&self) -> SeqNum {
        if self.0 & 0b1000 == 0 {
            SeqNum::ZERO
        } else {
            SeqNum::ONE
        }
    }

    /// Sets the value of the `SN` field.
    pub fn set_sn(&mut self, sn: SeqNum) {
        if sn == SeqNum::ONE {
            self.0 |= 0b1000;
        } else {
            self.0 &= !0b1000;
        }
    }

    /// Returns whether the `MD` field is set (More Data).
    pub fn md(&self) -> bool {
        self.0 & 0b10000 != 0
    }

    /// Sets the value of the `MD` field.
    pub fn set_md(&mut self, md: bool) {
        if md {
            self.0 |= 0b10000;
        } else {
            self.0 &= !0b10000;
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("LLID", &self.llid())
            .field("NESN", &self.nesn())
            .field("SN", &self.sn())
            .field("MD", &self.md())
            .field("Length", &self.payload_length())
            .finish()
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_u16_le()?;
        Ok(Header(raw))
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.to_u16())
    }
}

/// Values of the LLID field in `Header`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    /// Reserved for future use.
    Reserved = 0b00,

    /// Continuation of L2CAP message, or empty PDU.
    DataCont = 0b01,

    /// Start of L2CAP message.
    DataStart = 0b10,

    /// LL control PDU.
    Control = 0b11,
}

/// Storage for one data channel PDU.
///
/// Every node in the rx and tx buffer pools is a `PduBuf`. Only the `LLID` and `Length` fields of
/// the stored header are meaningful; sequence numbers and `MD` are filled in when the PDU goes on
/// air.
#[derive(Clone)]
pub struct PduBuf {
    header: Header,
    payload: [u8; MAX_PAYLOAD_SIZE],
}

impl PduBuf {
    /// Creates an empty PDU (`DataCont` with zero-length payload).
    pub fn empty() -> Self {
        Self {
            header: Header::new(Llid::DataCont),
            payload: [0; MAX_PAYLOAD_SIZE],
        }
    }

    /// Returns the PDU header.
    pub fn header(&self) -> Header {
        self.header
    }

    /// Returns the valid part of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..usize::from(self.header.payload_length())]
    }

    /// Returns whether this buffer holds an LL Control PDU.
    pub fn is_control(&self) -> bool {
        self.header.llid() == Llid::Control
    }

    /// Replaces the contents of `self` with `data`, sent with the given `llid`.
    pub fn set_data(&mut self, llid: Llid, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidLength);
        }
        self.payload[..data.len()].copy_from_slice(data);
        self.header = Header::new(llid);
        self.header.set_payload_length(data.len() as u8);
        Ok(())
    }

    /// Encodes `pdu` into `self`.
    pub fn set_control(&mut self, pdu: &ControlPdu<'_>) -> Result<(), Error> {
        let mut writer = ByteWriter::new(&mut self.payload);
        pdu.to_bytes(&mut writer)?;
        let used = MAX_PAYLOAD_SIZE - writer.space_left();
        self.header = Header::new(Llid::Control);
        self.header.set_payload_length(used as u8);
        Ok(())
    }

    /// Returns the opcode of the stored control PDU, or `None` if this is not a control PDU.
    pub fn control_opcode(&self) -> Option<ControlOpcode> {
        if self.is_control() {
            self.payload().first().map(|&b| ControlOpcode::from(b))
        } else {
            None
        }
    }

    /// Decodes the stored control PDU.
    pub fn control(&self) -> Result<ControlPdu<'_>, Error> {
        if !self.is_control() {
            return Err(Error::InvalidValue);
        }
        ControlPdu::parse(self.payload())
    }
}

impl Default for PduBuf {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PduBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduBuf")
            .field("header", &self.header)
            .field("payload", &HexSlice(self.payload()))
            .finish()
    }
}
