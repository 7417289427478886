//! ISO adaptation layer (ISO-AL).
//!
//! Isochronous channels carry Service Data Units (SDUs) from the host in fixed-timing PDUs. The
//! adaptation layer sits between the two:
//!
//! * A **sink** recombines received ISO PDUs into SDUs and hands them to the host, together with a
//!   reconstructed timestamp, a sequence number and a status telling the host whether data was
//!   lost on the way.
//! * A **source** cuts host SDUs into PDUs for transmission.
//!
//! Unframed PDUs carry SDU fragments directly, marked by the LLID. Framed PDUs carry one or more
//! *segments*, each introduced by a small header (see [`pdu::SegmentHeader`]).
//!
//! Buffers for SDUs and PDUs belong to the host. The layer asks for them through the
//! [`SduHost`] and [`PduHost`] traits and never touches their memory directly.
//!
//! [`pdu::SegmentHeader`]: pdu/struct.SegmentHeader.html
//! [`SduHost`]: trait.SduHost.html
//! [`PduHost`]: trait.PduHost.html

pub mod pdu;
mod sink;
mod source;

pub use self::sink::{EmittedSdu, SduBuffer, SduHost, SinkConfig, SinkHandle};
pub use self::source::{EmittedPdu, PduBuffer, PduHost, SourceConfig, SourceHandle, TxSdu};

use self::{sink::Sink, source::Source};
use crate::time::Instant;
use bitflags::bitflags;
use core::fmt;

/// Number of sinks that can exist at the same time.
pub const MAX_SINKS: usize = 4;

/// Number of sources that can exist at the same time.
pub const MAX_SOURCES: usize = 4;

/// ISO interval unit, in µs.
const ISO_INTERVAL_UNIT_US: u32 = 1250;

/// Errors reported by the adaptation layer, mostly relayed from the host callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoalError {
    /// All sinks are in use.
    SinkAlloc,
    /// The host could not provide an SDU buffer.
    SduAlloc,
    /// The host refused a completed SDU.
    SduEmit,
    /// Writing into an SDU buffer failed.
    SduWrite,
    /// All sources are in use.
    SourceAlloc,
    /// The host could not provide a PDU buffer.
    PduAlloc,
    /// The host refused a completed PDU.
    PduEmit,
    /// Writing into a PDU buffer failed.
    PduWrite,
    /// Unknown handle, invalid configuration or malformed input.
    Unspecified,
}

impl fmt::Display for IsoalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsoalError::SinkAlloc => "no free sink",
            IsoalError::SduAlloc => "SDU allocation failed",
            IsoalError::SduEmit => "SDU emission failed",
            IsoalError::SduWrite => "SDU write failed",
            IsoalError::SourceAlloc => "no free source",
            IsoalError::PduAlloc => "PDU allocation failed",
            IsoalError::PduEmit => "PDU emission failed",
            IsoalError::PduWrite => "PDU write failed",
            IsoalError::Unspecified => "unspecified ISO-AL error",
        })
    }
}

bitflags! {
    /// Reception status of an SDU, or of the PDU it was built from.
    ///
    /// An empty set means the data is valid. The bits map directly onto the HCI ISO data packet
    /// status flag.
    pub struct SduStatus: u8 {
        /// The data may contain errors, or part of it may be missing.
        const ERRORS = 0b01;
        /// Parts of the SDU were not received. The host should discard the contents.
        const LOST_DATA = 0b10;
    }
}

impl SduStatus {
    /// Returns whether no error bit is set.
    pub fn is_valid(&self) -> bool {
        self.is_empty()
    }
}

/// Position of an emitted fragment within its SDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SduFragment {
    /// First fragment, more follow.
    Start,
    /// Neither first nor last.
    Continue,
    /// Last fragment of a multi-fragment SDU.
    End,
    /// The complete SDU.
    Single,
}

/// Role of the local device on the isochronous stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamRole {
    /// Central of a connected stream.
    Central,
    /// Peripheral of a connected stream.
    Peripheral,
    /// Broadcast stream.
    Broadcast,
}

/// Moves `t` by a signed number of microseconds, wrapping with the clock.
fn offset(t: Instant, us: i64) -> Instant {
    Instant::from_raw_micros((i64::from(t.raw_micros()) + us) as u32)
}

/// The adaptation layer: all sinks and sources of the controller.
///
/// The host callbacks are passed to each operation that may need them, so the layer itself holds
/// no references to host state.
pub struct Isoal {
    sinks: [Option<Sink>; MAX_SINKS],
    sources: [Option<Source>; MAX_SOURCES],
}

impl Isoal {
    /// Creates an adaptation layer without any sinks or sources.
    pub fn new() -> Self {
        Self {
            sinks: Default::default(),
            sources: Default::default(),
        }
    }

    /// Drops all sinks and sources.
    ///
    /// Unlike `source_destroy`, PDUs in production are not released to the host.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Creates a disabled sink for the stream described by `config`.
    pub fn sink_create(&mut self, config: &SinkConfig) -> Result<SinkHandle, IsoalError> {
        let sink = Sink::new(config)?;
        let index = self
            .sinks
            .iter()
            .position(Option::is_none)
            .ok_or(IsoalError::SinkAlloc)?;
        self.sinks[index] = Some(sink);
        debug!("isoal: sink {} created for stream {:#06x}", index, config.handle);
        Ok(SinkHandle(index as u8))
    }

    /// Starts SDU production on a sink, from a clean state.
    pub fn sink_enable(&mut self, handle: SinkHandle) -> Result<(), IsoalError> {
        self.sink_mut(handle)?.enable();
        Ok(())
    }

    /// Stops SDU production. PDUs passed to a disabled sink are ignored.
    pub fn sink_disable(&mut self, handle: SinkHandle) -> Result<(), IsoalError> {
        self.sink_mut(handle)?.disable();
        Ok(())
    }

    /// Disables and frees a sink.
    pub fn sink_destroy(&mut self, handle: SinkHandle) -> Result<(), IsoalError> {
        self.sink_mut(handle)?;
        self.sinks[handle.index()] = None;
        Ok(())
    }

    /// Recombines a received PDU into the SDU(s) of a sink.
    ///
    /// Completed SDUs are handed to `host`. If the host fails to provide a buffer, the error is
    /// returned and the sink keeps its state, so the next PDU retries the allocation.
    pub fn rx_pdu_recombine<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &pdu::RxPdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        self.sink_mut(handle)?.recombine(handle, pdu, host)
    }

    /// Creates a disabled source for the stream described by `config`.
    pub fn source_create(&mut self, config: &SourceConfig) -> Result<SourceHandle, IsoalError> {
        let source = Source::new(config)?;
        let index = self
            .sources
            .iter()
            .position(Option::is_none)
            .ok_or(IsoalError::SourceAlloc)?;
        self.sources[index] = Some(source);
        debug!("isoal: source {} created for stream {:#06x}", index, config.handle);
        Ok(SourceHandle(index as u8))
    }

    /// Starts PDU production on a source, from a clean state.
    pub fn source_enable(&mut self, handle: SourceHandle) -> Result<(), IsoalError> {
        self.source_mut(handle)?.enable();
        Ok(())
    }

    /// Stops PDU production. SDUs passed to a disabled source are refused.
    pub fn source_disable(&mut self, handle: SourceHandle) -> Result<(), IsoalError> {
        self.source_mut(handle)?.disable();
        Ok(())
    }

    /// Disables and frees a source, releasing a partially filled PDU to `host`.
    pub fn source_destroy<H: PduHost>(
        &mut self,
        handle: SourceHandle,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        self.source_mut(handle)?.discard(host);
        self.sources[handle.index()] = None;
        Ok(())
    }

    /// Cuts a host SDU fragment into PDUs and emits the completed ones to `host`.
    pub fn tx_sdu_fragment<H: PduHost>(
        &mut self,
        handle: SourceHandle,
        sdu: &TxSdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        self.source_mut(handle)?.fragment(sdu, host)
    }

    /// Returns a transmitted PDU buffer to the host.
    pub fn tx_pdu_release<H: PduHost>(
        &mut self,
        handle: SourceHandle,
        buffer: PduBuffer,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let stream = self.source_mut(handle)?.stream();
        host.pdu_release(stream, buffer, Ok(()));
        Ok(())
    }

    /// Returns the sequence number and group reference point of the last SDU a source started.
    ///
    /// Fails if no SDU was sent yet. Unframed sources have no time offset, so none is returned.
    pub fn tx_sync_info(&self, handle: SourceHandle) -> Result<(u16, Instant), IsoalError> {
        self.sources
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(IsoalError::Unspecified)?
            .sync_info()
            .ok_or(IsoalError::Unspecified)
    }

    fn sink_mut(&mut self, handle: SinkHandle) -> Result<&mut Sink, IsoalError> {
        self.sinks
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(IsoalError::Unspecified)
    }

    fn source_mut(&mut self, handle: SourceHandle) -> Result<&mut Source, IsoalError> {
        match self.sources.get_mut(handle.index()).and_then(Option::as_mut) {
            Some(source) => Ok(source),
            None => {
                error!("isoal: invalid source handle {:?}", handle);
                Err(IsoalError::Unspecified)
            }
        }
    }
}

impl Default for Isoal {
    fn default() -> Self {
        Self::new()
    }
}
