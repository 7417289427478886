//! ISO data PDUs as seen by the adaptation layer.
//!
//! # Framed segments
//!
//! The payload of a framed PDU is a sequence of segments, each starting with a 2-octet header:
//!
//! ```notrust
//! LSB                                                         MSB
//! +------+---------+---------+-----------+ - - - - - - - - - +
//! |  SC  |  CMPLT  |   RFU   |  Length   |    Time Offset    |
//! | (1)  |   (1)   |   (6)   |    (8)    |     (24 bits)     |
//! +------+---------+---------+-----------+ - - - - - - - - - +
//! ```
//!
//! `SC` is set on continuation segments. A segment that starts a new SDU (`SC` = 0) carries the
//! time offset between the SDU's reference point and the anchor point; the offset is counted in
//! `Length`.

use crate::bytes::*;
use crate::isoal::SduStatus;
use crate::time::Instant;
use crate::Error;

/// Size of the time offset field, in octets.
pub const TIME_OFFSET_SIZE: usize = 3;

/// LLID of an ISO data PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoLlid {
    /// Unframed: end fragment or complete SDU.
    CompleteEnd = 0b00,
    /// Unframed: start or continuation fragment, or padding when empty.
    StartContinue = 0b01,
    /// Framed: one or more segments.
    Framed = 0b10,
}

/// A received ISO PDU together with its reception metadata.
#[derive(Debug, Copy, Clone)]
pub struct RxPdu<'a> {
    /// Can not be trusted when `status` is not valid.
    pub llid: IsoLlid,
    pub payload: &'a [u8],
    /// Payload counter of the stream.
    pub payload_number: u64,
    /// Reference anchor point of the event the PDU belongs to.
    pub timestamp: Instant,
    pub status: SduStatus,
}

/// Header of a framed segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Continuation of an SDU started in an earlier segment.
    pub sc: bool,
    /// The segment completes the SDU.
    pub cmplt: bool,
    /// Octets following the header, including the time offset.
    pub len: u8,
    /// Present only in segments that start an SDU.
    pub time_offset: Option<u32>,
}

/// A framed segment: header plus SDU data.
#[derive(Debug, Copy, Clone)]
pub struct Segment<'a> {
    pub header: SegmentHeader,
    pub data: &'a [u8],
}

impl<'a> FromBytes<'a> for Segment<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let flags = bytes.read_u8()?;
        let len = bytes.read_u8()?;
        let mut body = bytes.split_off(usize::from(len))?;
        let sc = flags & 0b01 != 0;
        let time_offset = if sc {
            None
        } else {
            if body.bytes_left() < TIME_OFFSET_SIZE {
                return Err(Error::InvalidLength);
            }
            Some(body.read_u24_le()?)
        };

        Ok(Segment {
            header: SegmentHeader {
                sc,
                cmplt: flags & 0b10 != 0,
                len,
                time_offset,
            },
            data: body.read_rest(),
        })
    }
}

impl ToBytes for Segment<'_> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let h = &self.header;
        writer.write_u8(u8::from(h.sc) | u8::from(h.cmplt) << 1)?;
        writer.write_u8(h.len)?;
        if let Some(offset) = h.time_offset {
            writer.write_u24_le(offset)?;
        }
        writer.write_slice(self.data)
    }
}

impl<'a> Segment<'a> {
    /// Creates a segment, computing the header length from `data`.
    pub fn new(sc: bool, cmplt: bool, time_offset: Option<u32>, data: &'a [u8]) -> Self {
        let extra = if time_offset.is_some() { TIME_OFFSET_SIZE } else { 0 };
        Segment {
            header: SegmentHeader {
                sc,
                cmplt,
                len: (data.len() + extra) as u8,
                time_offset,
            },
            data,
        }
    }
}
