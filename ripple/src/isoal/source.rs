//! Segmentation of host SDUs into unframed ISO PDUs.

use super::{offset, pdu::IsoLlid, IsoalError, SduFragment, ISO_INTERVAL_UNIT_US};
use crate::time::Instant;
use core::cmp;

/// Payload counters are 39 bits wide.
const PAYLOAD_NUMBER_MASK: u64 = 0x7F_FFFF_FFFF;

/// Identifies a source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SourceHandle(pub(super) u8);

impl SourceHandle {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// Parameters of the stream a source transmits on.
#[derive(Debug, Copy, Clone)]
pub struct SourceConfig {
    /// CIS or BIS handle, passed back to the host callbacks.
    pub handle: u16,
    /// Only unframed sources are supported.
    pub framed: bool,
    /// Burst number (BN).
    pub burst_number: u8,
    /// Maximum PDU payload size, in octets.
    pub max_pdu_size: u8,
    /// SDU interval, in µs.
    pub sdu_interval: u32,
    /// ISO interval, in 1.25 ms units.
    pub iso_interval: u16,
}

/// A PDU buffer owned by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduBuffer {
    /// Host-defined buffer identifier.
    pub id: usize,
    /// Capacity in octets.
    pub size: usize,
}

/// A completed PDU, ready to be queued for transmission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EmittedPdu {
    pub buffer: PduBuffer,
    pub llid: IsoLlid,
    /// Number of octets written into `buffer`.
    pub len: usize,
    pub payload_number: u64,
    /// Number of host SDU fragments that ended in this PDU.
    pub sdu_fragments: u8,
}

/// An SDU, or a fragment of one, handed over by the host.
#[derive(Debug, Copy, Clone)]
pub struct TxSdu<'a> {
    pub fragment: SduFragment,
    pub data: &'a [u8],
    /// Event the SDU should be sent in, if it is the first fragment.
    pub target_event: u64,
    /// Group reference point of `target_event`.
    pub group_ref_point: Instant,
}

/// Host side of a source.
pub trait PduHost {
    /// Provides a fresh PDU buffer.
    fn pdu_alloc(&mut self) -> Result<PduBuffer, IsoalError>;

    /// Copies `data` into `buffer`, starting at `offset`.
    fn pdu_write(
        &mut self,
        buffer: &PduBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), IsoalError>;

    /// Queues a completed PDU for transmission.
    ///
    /// On error, the buffer is handed back through `pdu_release` right away.
    fn pdu_emit(&mut self, stream: u16, pdu: &EmittedPdu) -> Result<(), IsoalError>;

    /// Takes back a buffer that was transmitted, failed to be emitted, or was discarded.
    fn pdu_release(&mut self, stream: u16, buffer: PduBuffer, status: Result<(), IsoalError>);
}

struct Production {
    payload_number: u64,
    /// PDUs started for the current SDU.
    pdu_count: u32,
    sdu_fragments: u8,
    buffer: Option<PduBuffer>,
    written: usize,
    available: usize,
}

impl Production {
    fn new() -> Self {
        Self {
            payload_number: 0,
            pdu_count: 0,
            sdu_fragments: 0,
            buffer: None,
            written: 0,
            available: 0,
        }
    }
}

pub(super) struct Source {
    stream: u16,
    burst_number: u8,
    iso_interval_us: u32,
    pdus_per_sdu: u32,
    max_pdu_size: usize,
    seq_num: u16,
    tx_timestamp: Instant,
    enabled: bool,
    prod: Production,
}

impl Source {
    pub(super) fn new(config: &SourceConfig) -> Result<Self, IsoalError> {
        if config.framed {
            warn!("isoal: framed sources are not supported");
            return Err(IsoalError::Unspecified);
        }

        let iso_interval_us = u32::from(config.iso_interval) * ISO_INTERVAL_UNIT_US;
        if iso_interval_us == 0 || config.burst_number == 0 || config.max_pdu_size == 0 {
            return Err(IsoalError::Unspecified);
        }

        // Each SDU occupies BN / (ISO interval / SDU interval) PDUs.
        let pdus_per_sdu = u32::from(config.burst_number) * config.sdu_interval / iso_interval_us;
        if pdus_per_sdu == 0 {
            return Err(IsoalError::Unspecified);
        }

        Ok(Self {
            stream: config.handle,
            burst_number: config.burst_number,
            iso_interval_us,
            pdus_per_sdu,
            max_pdu_size: config.max_pdu_size.into(),
            seq_num: 0,
            tx_timestamp: Instant::from_raw_micros(0),
            enabled: false,
            prod: Production::new(),
        })
    }

    pub(super) fn stream(&self) -> u16 {
        self.stream
    }

    pub(super) fn enable(&mut self) {
        self.prod = Production::new();
        self.enabled = true;
    }

    pub(super) fn disable(&mut self) {
        self.enabled = false;
    }

    /// Releases a partially filled PDU.
    pub(super) fn discard<H: PduHost>(&mut self, host: &mut H) {
        self.enabled = false;
        if let Some(buffer) = self.prod.buffer.take() {
            host.pdu_release(self.stream, buffer, Err(IsoalError::PduEmit));
        }
    }

    /// Sequence number and reference point of the last SDU started.
    pub(super) fn sync_info(&self) -> Option<(u16, Instant)> {
        if self.seq_num > 0 {
            Some((self.seq_num, self.tx_timestamp))
        } else {
            None
        }
    }

    pub(super) fn fragment<H: PduHost>(
        &mut self,
        sdu: &TxSdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        if !self.enabled {
            return Err(IsoalError::PduAlloc);
        }

        let starts = matches!(sdu.fragment, SduFragment::Start | SduFragment::Single);
        let ends = matches!(sdu.fragment, SduFragment::End | SduFragment::Single);

        if starts {
            self.seq_num = self.seq_num.wrapping_add(1);

            // Time may have passed since the last SDU, but several SDUs can share one event.
            let bn = u64::from(self.burst_number);
            self.prod.payload_number = cmp::max(self.prod.payload_number, sdu.target_event * bn);
            let actual_event = self.prod.payload_number / bn;
            let late_by = actual_event.saturating_sub(sdu.target_event);
            self.tx_timestamp = offset(
                sdu.group_ref_point,
                (late_by * u64::from(self.iso_interval_us)) as i64,
            );

            // An unframed SDU always starts in a new PDU.
            self.prod.pdu_count = 0;
            self.prod.sdu_fragments = 0;
        }

        let mut data = sdu.data;
        let mut zero_length = data.is_empty() && sdu.fragment == SduFragment::Single;
        let mut padding = false;

        while !data.is_empty() || padding || zero_length {
            if self.prod.buffer.is_none() {
                self.allocate(host)?;
            }
            let buffer = match self.prod.buffer {
                Some(buffer) => buffer,
                None => return Err(IsoalError::PduAlloc),
            };

            let len = cmp::min(data.len(), self.prod.available);
            let end_of_fragment = !padding && ((len > 0 && len == data.len()) || zero_length);
            if len > 0 {
                host.pdu_write(&buffer, self.prod.written, &data[..len])?;
                self.prod.written += len;
                self.prod.available -= len;
                data = &data[len..];
            }
            if end_of_fragment {
                self.prod.sdu_fragments += 1;
            }

            let end_of_sdu = data.is_empty() && ends;
            let llid = if end_of_sdu && !padding {
                IsoLlid::CompleteEnd
            } else {
                IsoLlid::StartContinue
            };
            if end_of_sdu || self.prod.available == 0 {
                self.emit(buffer, llid, host)?;
            }

            // Short SDUs are padded up to the PDUs-per-SDU count.
            padding = end_of_sdu && self.prod.pdu_count < self.pdus_per_sdu;
            zero_length = false;
        }

        Ok(())
    }

    fn allocate<H: PduHost>(&mut self, host: &mut H) -> Result<(), IsoalError> {
        let buffer = host.pdu_alloc()?;
        let available = cmp::min(self.max_pdu_size, buffer.size);
        if available == 0 {
            host.pdu_release(self.stream, buffer, Err(IsoalError::PduAlloc));
            return Err(IsoalError::PduAlloc);
        }

        self.prod.buffer = Some(buffer);
        self.prod.written = 0;
        self.prod.available = available;
        self.prod.pdu_count += 1;
        Ok(())
    }

    /// Hands the PDU in production to the host. A refused PDU is released and lost.
    fn emit<H: PduHost>(
        &mut self,
        buffer: PduBuffer,
        llid: IsoLlid,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let pdu = EmittedPdu {
            buffer,
            llid,
            len: self.prod.written,
            payload_number: self.prod.payload_number & PAYLOAD_NUMBER_MASK,
            sdu_fragments: self.prod.sdu_fragments,
        };

        self.prod.buffer = None;
        self.prod.written = 0;
        self.prod.available = 0;
        self.prod.payload_number += 1;
        self.prod.sdu_fragments = 0;

        let result = host.pdu_emit(self.stream, &pdu);
        if let Err(e) = result {
            error!("isoal: failed to emit PDU {}: {}", pdu.payload_number, e);
            host.pdu_release(self.stream, buffer, Err(e));
        }
        result
    }
}
