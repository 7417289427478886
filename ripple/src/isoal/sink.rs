//! Recombination of received ISO PDUs into SDUs.

use super::{
    offset,
    pdu::{IsoLlid, RxPdu, Segment},
    IsoalError, SduFragment, SduStatus, StreamRole, ISO_INTERVAL_UNIT_US,
};
use crate::bytes::{ByteReader, FromBytes};
use crate::time::{Duration, Instant};
use core::cmp;

/// Identifies a sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SinkHandle(pub(super) u8);

impl SinkHandle {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// Parameters of the stream a sink receives from.
#[derive(Debug, Copy, Clone)]
pub struct SinkConfig {
    /// CIS or BIS handle, for logging.
    pub handle: u16,
    pub role: StreamRole,
    pub framed: bool,
    /// Burst number (BN).
    pub burst_number: u8,
    /// Flush timeout, in ISO intervals.
    pub flush_timeout: u8,
    /// SDU interval, in µs.
    pub sdu_interval: u32,
    /// ISO interval, in 1.25 ms units.
    pub iso_interval: u16,
    /// CIS or BIS sync delay, in µs.
    pub stream_sync_delay: u32,
    /// CIG or BIG sync delay, in µs.
    pub group_sync_delay: u32,
}

/// An SDU buffer owned by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SduBuffer {
    /// Host-defined buffer identifier.
    pub id: usize,
    /// Capacity in octets. Must not be 0.
    pub size: usize,
}

/// An SDU, or a fragment of one, handed to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EmittedSdu {
    pub buffer: SduBuffer,
    /// Number of octets written into `buffer`.
    pub len: usize,
    pub fragment: SduFragment,
    /// Collected errors of every PDU the SDU was built from.
    pub status: SduStatus,
    /// SDU synchronization reference.
    pub timestamp: Instant,
    pub seq_num: u16,
}

/// Host side of a sink.
pub trait SduHost {
    /// Provides a fresh SDU buffer.
    ///
    /// `pdu` is the PDU whose data will go into the buffer first.
    fn sdu_alloc(&mut self, sink: SinkHandle, pdu: &RxPdu<'_>) -> Result<SduBuffer, IsoalError>;

    /// Copies `data` into `buffer`, starting at `offset`.
    fn sdu_write(
        &mut self,
        buffer: &SduBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), IsoalError>;

    /// Takes ownership of a filled buffer.
    fn sdu_emit(&mut self, sink: SinkHandle, sdu: &EmittedSdu) -> Result<(), IsoalError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Fsm {
    /// Next PDU starts an SDU.
    Start,
    /// An SDU is being built.
    Continue,
    /// Dropping PDUs until the next SDU starts.
    ErrorSpool,
}

/// State of the SDU in production.
struct Production {
    fsm: Fsm,
    prev_payload_number: u64,
    prev_was_end: bool,
    prev_was_padding: bool,
    /// PDUs consumed for the current SDU.
    pdu_count: u32,
    /// A fragment of the current SDU was already emitted.
    continuing: bool,
    status: SduStatus,
    buffer: Option<SduBuffer>,
    written: usize,
    timestamp: Option<Instant>,
}

impl Production {
    fn new() -> Self {
        Self {
            fsm: Fsm::Start,
            prev_payload_number: 0,
            prev_was_end: false,
            prev_was_padding: false,
            pdu_count: 0,
            continuing: false,
            status: SduStatus::empty(),
            buffer: None,
            written: 0,
            timestamp: None,
        }
    }
}

pub(super) struct Sink {
    stream: u16,
    framed: bool,
    burst_number: u8,
    pdus_per_sdu: u32,
    sdu_interval: u32,
    latency_unframed: i64,
    latency_framed: i64,
    seq_num: u16,
    enabled: bool,
    prod: Production,
}

impl Sink {
    pub(super) fn new(config: &SinkConfig) -> Result<Self, IsoalError> {
        let iso_interval_us = u32::from(config.iso_interval) * ISO_INTERVAL_UNIT_US;
        if iso_interval_us == 0 || config.sdu_interval == 0 || config.burst_number == 0 {
            return Err(IsoalError::Unspecified);
        }

        let pdus_per_sdu = u32::from(config.burst_number) * config.sdu_interval / iso_interval_us;
        if !config.framed && pdus_per_sdu == 0 {
            return Err(IsoalError::Unspecified);
        }

        // Constant part of the transport latency between the anchor point and the SDU reference.
        let stream_delay = i64::from(config.stream_sync_delay);
        let group_delay = i64::from(config.group_sync_delay);
        let sdu_interval = i64::from(config.sdu_interval);
        let iso_interval = i64::from(iso_interval_us);
        let flush_timeout = i64::from(config.flush_timeout);
        let (latency_unframed, latency_framed) = match config.role {
            StreamRole::Peripheral => (
                stream_delay + (flush_timeout - 1) * iso_interval,
                stream_delay + sdu_interval + flush_timeout * iso_interval,
            ),
            StreamRole::Central => (
                stream_delay - group_delay - (iso_interval / sdu_interval - 1) * iso_interval,
                stream_delay - group_delay,
            ),
            StreamRole::Broadcast => (group_delay, group_delay + sdu_interval + iso_interval),
        };

        Ok(Self {
            stream: config.handle,
            framed: config.framed,
            burst_number: config.burst_number,
            pdus_per_sdu,
            sdu_interval: config.sdu_interval,
            latency_unframed,
            latency_framed,
            seq_num: 0,
            enabled: false,
            prod: Production::new(),
        })
    }

    pub(super) fn enable(&mut self) {
        self.prod = Production::new();
        self.enabled = true;
    }

    pub(super) fn disable(&mut self) {
        self.enabled = false;
    }

    pub(super) fn recombine<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        if !self.enabled {
            return Ok(());
        }

        if self.framed {
            self.framed_consume(handle, pdu, host)
        } else {
            self.unframed_consume(handle, pdu, host)
        }
    }

    /// Consumes one unframed PDU.
    ///
    /// If the host cannot provide a buffer for the PDU's data, nothing is changed and the same PDU
    /// can be passed again later.
    fn unframed_consume<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let mut pdu_status = pdu.status;
        if pdu.llid == IsoLlid::Framed {
            warn!("isoal: framed PDU on unframed stream {:#06x}", self.stream);
            pdu_status |= SduStatus::ERRORS;
        }

        // LLID and length can not be trusted in an erroneous PDU.
        let pdu_err = !pdu_status.is_valid();
        let end_llid = pdu.llid == IsoLlid::CompleteEnd;
        let empty = pdu.payload.is_empty();
        let mut fsm = self.prod.fsm;
        let padding =
            empty && pdu.llid == IsoLlid::StartContinue && (!pdu_err || fsm == Fsm::ErrorSpool);
        let mut seq_err = pdu.payload_number != self.prod.prev_payload_number.wrapping_add(1);

        if fsm == Fsm::ErrorSpool {
            // Resynchronize on the first non-padding PDU after an end fragment or padding, or on
            // the payload number of an SDU boundary.
            let follows_end = !pdu_err
                && !seq_err
                && (self.prod.prev_was_end || self.prod.prev_was_padding)
                && !padding;
            if follows_end || pdu.payload_number % u64::from(self.pdus_per_sdu) == 0 {
                fsm = Fsm::Start;
            }
        }

        let starting = fsm == Fsm::Start;
        let pdu_count = if starting {
            seq_err = false;
            1
        } else {
            self.prod.pdu_count + 1
        };
        let last_pdu = pdu_count >= self.pdus_per_sdu;
        let end_of_packet = end_llid || last_pdu || pdu_err || seq_err;

        let next = match fsm {
            Fsm::Start | Fsm::Continue => {
                if (pdu_err || seq_err || end_llid) && !last_pdu {
                    // Padding follows an end fragment, errors are spooled.
                    Fsm::ErrorSpool
                } else if last_pdu {
                    Fsm::Start
                } else {
                    Fsm::Continue
                }
            }
            Fsm::ErrorSpool if last_pdu => Fsm::Start,
            Fsm::ErrorSpool => Fsm::ErrorSpool,
        };

        let append = fsm != Fsm::ErrorSpool && (!padding || end_of_packet);
        if append && !padding && self.prod.buffer.is_none() {
            self.allocate(handle, pdu, host)?;
        }

        if starting {
            self.prod.status = SduStatus::empty();
            self.prod.continuing = false;
            self.seq_num = self.seq_num.wrapping_add(1);

            // PDUs of one burst share the anchor. Every SDU after the first in a burst is one SDU
            // interval later.
            let sdu_offset =
                (pdu.payload_number % u64::from(self.burst_number)) / u64::from(self.pdus_per_sdu);
            let latency = self.latency_unframed + sdu_offset as i64 * i64::from(self.sdu_interval);
            self.prod.timestamp = Some(offset(pdu.timestamp, latency));
        }
        self.prod.pdu_count = pdu_count;

        if seq_err {
            self.prod.status |= SduStatus::LOST_DATA;
        } else if pdu_err && !padding {
            self.prod.status |= pdu_status;
        } else if last_pdu && !end_llid && fsm != Fsm::ErrorSpool {
            // End fragment never seen
            self.prod.status |= SduStatus::ERRORS;
        }

        let mut result = Ok(());
        if append {
            let data = if pdu_err || seq_err { &[][..] } else { pdu.payload };
            result = self.append(handle, pdu, data, end_of_packet, padding, host);
        }

        self.prod.fsm = next;
        self.prod.prev_payload_number = pdu.payload_number;
        self.prod.prev_was_end = !pdu_err && end_llid;
        self.prod.prev_was_padding = !pdu_err && padding;
        result
    }

    /// Consumes one framed PDU, segment by segment.
    fn framed_consume<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let mut pdu_status = pdu.status;
        if pdu.llid != IsoLlid::Framed {
            warn!("isoal: unframed PDU on framed stream {:#06x}", self.stream);
            pdu_status |= SduStatus::ERRORS;
        }

        let pdu_err = !pdu_status.is_valid();
        let seq_err = self.prod.fsm != Fsm::Start
            && pdu.payload_number != self.prod.prev_payload_number.wrapping_add(1);
        let mut seg_err = false;
        let mut result = Ok(());

        if !pdu_err && !seq_err {
            let mut reader = ByteReader::new(pdu.payload);
            // Nothing of this PDU has been consumed yet.
            let mut untouched = true;
            while !reader.is_empty() {
                let segment = match Segment::from_bytes(&mut reader) {
                    Ok(segment) => segment,
                    Err(_) => {
                        seg_err = true;
                        break;
                    }
                };
                let header = segment.header;

                if self.prod.fsm == Fsm::Continue && !header.sc {
                    // New SDU before the previous one completed
                    self.prod.status |= SduStatus::ERRORS;
                    result = result.and(self.append(handle, pdu, &[], true, false, host));
                    self.prod.fsm = Fsm::Start;
                    untouched = false;
                }

                let next = match (self.prod.fsm, header.sc) {
                    (Fsm::Continue, true) => Some(header.cmplt),
                    (_, false) => {
                        if self.prod.buffer.is_none() {
                            if let Err(e) = self.allocate(handle, pdu, host) {
                                if untouched {
                                    // The same PDU can be passed again later.
                                    return Err(e);
                                }
                                // The rest of the PDU is dropped.
                                result = result.and(Err(e));
                                self.prod.fsm = Fsm::ErrorSpool;
                                break;
                            }
                        }
                        self.prod.status = SduStatus::empty();
                        self.prod.continuing = false;
                        self.seq_num = self.seq_num.wrapping_add(1);
                        let time_offset = i64::from(header.time_offset.unwrap_or(0));
                        self.prod.timestamp =
                            Some(offset(pdu.timestamp, self.latency_framed - time_offset));
                        Some(header.cmplt)
                    }
                    // Continuation of an SDU whose start we never saw
                    (_, true) => None,
                };

                match next {
                    Some(cmplt) => {
                        result =
                            result.and(self.append(handle, pdu, segment.data, cmplt, false, host));
                        self.prod.fsm = if cmplt { Fsm::Start } else { Fsm::Continue };
                    }
                    None => self.prod.fsm = Fsm::ErrorSpool,
                }
                untouched = false;
            }
        }

        if pdu_err || seq_err || seg_err {
            if self.prod.fsm == Fsm::Start {
                // The lost PDU started an SDU of its own.
                self.prod.status = SduStatus::empty();
                self.prod.continuing = false;
                self.seq_num = self.seq_num.wrapping_add(1);
                self.prod.timestamp = Some(match self.prod.timestamp {
                    Some(prev) => prev + Duration::from_micros(self.sdu_interval),
                    None => offset(pdu.timestamp, self.latency_framed),
                });
            }

            if seq_err || seg_err {
                self.prod.status |= SduStatus::LOST_DATA;
            } else {
                self.prod.status |= pdu_status;
            }

            // Flush what we have with the error status.
            result = result.and(self.append(handle, pdu, &[], true, false, host));
            self.prod.fsm = Fsm::ErrorSpool;
        }

        self.prod.prev_payload_number = pdu.payload_number;
        result
    }

    /// Writes `data` into the SDU in production, emitting it whenever the buffer is full or the
    /// SDU ends.
    ///
    /// With `end` set and no data, the SDU in production is emitted as is, allocating an empty
    /// one unless `padding` is set.
    fn append<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        mut data: &[u8],
        end: bool,
        padding: bool,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let mut result = Ok(());
        let mut flush = end && data.is_empty();

        while !data.is_empty() || flush {
            flush = false;

            if !padding && self.prod.buffer.is_none() {
                if let Err(e) = self.allocate(handle, pdu, host) {
                    // The rest of the PDU is dropped.
                    self.prod.status |= SduStatus::LOST_DATA;
                    return result.and(Err(e));
                }
            }

            let buffer = match self.prod.buffer {
                Some(buffer) => buffer,
                None => break,
            };

            let len = cmp::min(data.len(), buffer.size - self.prod.written);
            if len > 0 {
                result = result.and(host.sdu_write(&buffer, self.prod.written, &data[..len]));
                self.prod.written += len;
                data = &data[len..];
            }

            let end_of_sdu = end && data.is_empty();
            if end_of_sdu || self.prod.written == buffer.size {
                result = result.and(self.emit(handle, pdu, buffer, end_of_sdu, host));
            }
        }

        result
    }

    /// Obtains a buffer for the SDU in production.
    fn allocate<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let buffer = host.sdu_alloc(handle, pdu)?;
        if buffer.size == 0 {
            warn!("isoal: host provided an empty SDU buffer");
            return Err(IsoalError::SduAlloc);
        }

        self.prod.buffer = Some(buffer);
        self.prod.written = 0;
        Ok(())
    }

    fn emit<H: SduHost>(
        &mut self,
        handle: SinkHandle,
        pdu: &RxPdu<'_>,
        buffer: SduBuffer,
        end: bool,
        host: &mut H,
    ) -> Result<(), IsoalError> {
        let fragment = match (self.prod.continuing, end) {
            (false, true) => SduFragment::Single,
            (false, false) => SduFragment::Start,
            (true, true) => SduFragment::End,
            (true, false) => SduFragment::Continue,
        };
        let sdu = EmittedSdu {
            buffer,
            len: self.prod.written,
            fragment,
            status: self.prod.status,
            timestamp: self.prod.timestamp.unwrap_or(pdu.timestamp),
            seq_num: self.seq_num,
        };

        trace!("isoal: emit {:?}", sdu);
        self.prod.buffer = None;
        self.prod.written = 0;
        self.prod.continuing = !end;
        host.sdu_emit(handle, &sdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{ByteWriter, ToBytes};

    const ANCHOR: u32 = 100_000;

    #[derive(Default)]
    struct Host {
        buffer_size: usize,
        fail_alloc: bool,
        allocs: usize,
        buffers: Vec<Vec<u8>>,
        emitted: Vec<(EmittedSdu, Vec<u8>)>,
    }

    impl Host {
        fn new(buffer_size: usize) -> Self {
            Self {
                buffer_size,
                ..Default::default()
            }
        }
    }

    impl SduHost for Host {
        fn sdu_alloc(&mut self, _: SinkHandle, _: &RxPdu<'_>) -> Result<SduBuffer, IsoalError> {
            if self.fail_alloc {
                return Err(IsoalError::SduAlloc);
            }
            self.allocs += 1;
            self.buffers.push(Vec::new());
            Ok(SduBuffer {
                id: self.buffers.len() - 1,
                size: self.buffer_size,
            })
        }

        fn sdu_write(
            &mut self,
            buffer: &SduBuffer,
            offset: usize,
            data: &[u8],
        ) -> Result<(), IsoalError> {
            let buf = &mut self.buffers[buffer.id];
            assert_eq!(buf.len(), offset);
            buf.extend_from_slice(data);
            assert!(buf.len() <= buffer.size);
            Ok(())
        }

        fn sdu_emit(&mut self, _: SinkHandle, sdu: &EmittedSdu) -> Result<(), IsoalError> {
            let data = self.buffers[sdu.buffer.id].clone();
            assert_eq!(data.len(), sdu.len);
            self.emitted.push((*sdu, data));
            Ok(())
        }
    }

    fn config(framed: bool, burst_number: u8) -> SinkConfig {
        SinkConfig {
            handle: 0x0100,
            role: StreamRole::Peripheral,
            framed,
            burst_number,
            flush_timeout: 1,
            sdu_interval: 10_000,
            iso_interval: 8,
            stream_sync_delay: 500,
            group_sync_delay: 800,
        }
    }

    fn sink(framed: bool, burst_number: u8) -> Sink {
        let mut sink = Sink::new(&config(framed, burst_number)).unwrap();
        sink.enable();
        sink
    }

    fn pdu(llid: IsoLlid, payload_number: u64, payload: &[u8]) -> RxPdu<'_> {
        RxPdu {
            llid,
            payload,
            payload_number,
            timestamp: Instant::from_raw_micros(ANCHOR),
            status: SduStatus::empty(),
        }
    }

    fn feed(sink: &mut Sink, host: &mut Host, pdu: &RxPdu<'_>) -> Result<(), IsoalError> {
        sink.recombine(SinkHandle(0), pdu, host)
    }

    const START: IsoLlid = IsoLlid::StartContinue;
    const END: IsoLlid = IsoLlid::CompleteEnd;

    #[test]
    fn latencies() {
        let peripheral = Sink::new(&config(false, 1)).unwrap();
        assert_eq!(peripheral.latency_unframed, 500);
        assert_eq!(peripheral.latency_framed, 500 + 10_000 + 10_000);

        let central = Sink::new(&SinkConfig {
            role: StreamRole::Central,
            ..config(false, 1)
        })
        .unwrap();
        assert_eq!(central.latency_unframed, -300);
        assert_eq!(central.latency_framed, -300);

        let broadcast = Sink::new(&SinkConfig {
            role: StreamRole::Broadcast,
            ..config(false, 1)
        })
        .unwrap();
        assert_eq!(broadcast.latency_unframed, 800);
        assert_eq!(broadcast.latency_framed, 800 + 10_000 + 10_000);

        assert!(Sink::new(&SinkConfig {
            sdu_interval: 5_000,
            ..config(false, 1)
        })
        .is_err());
    }

    #[test]
    fn single_pdu_sdus() {
        let mut sink = sink(false, 1);
        let mut host = Host::new(64);

        feed(&mut sink, &mut host, &pdu(END, 0, &[1, 2])).unwrap();
        feed(&mut sink, &mut host, &pdu(END, 1, &[3])).unwrap();

        assert_eq!(host.emitted.len(), 2);
        let (first, data) = &host.emitted[0];
        assert_eq!(data, &[1, 2]);
        assert_eq!(first.fragment, SduFragment::Single);
        assert!(first.status.is_valid());
        assert_eq!(first.seq_num, 1);
        assert_eq!(first.timestamp, Instant::from_raw_micros(ANCHOR + 500));
        assert_eq!(host.emitted[1].0.seq_num, 2);
        assert_eq!(host.emitted[1].1, &[3]);
    }

    #[test]
    fn sequence_gap_emits_lost_data_and_resyncs() {
        let mut sink = sink(false, 3);
        let mut host = Host::new(64);

        feed(&mut sink, &mut host, &pdu(START, 10, &[1, 2])).unwrap();
        assert!(host.emitted.is_empty());

        // 11 went missing
        feed(&mut sink, &mut host, &pdu(START, 12, &[3, 4])).unwrap();
        assert_eq!(host.emitted.len(), 1);
        let lost = host.emitted[0].0;
        assert!(lost.status.contains(SduStatus::LOST_DATA));
        assert_eq!(host.emitted[0].1, &[1, 2]);
        assert_eq!(lost.fragment, SduFragment::Single);

        // Payload number 15 is an SDU boundary
        feed(&mut sink, &mut host, &pdu(START, 15, &[5])).unwrap();
        feed(&mut sink, &mut host, &pdu(START, 16, &[6])).unwrap();
        feed(&mut sink, &mut host, &pdu(END, 17, &[7])).unwrap();
        assert_eq!(host.emitted.len(), 2);
        let (next, data) = &host.emitted[1];
        assert!(next.status.is_valid());
        assert_eq!(data, &[5, 6, 7]);
        assert_eq!(next.seq_num, lost.seq_num + 1);
    }

    #[test]
    fn one_buffer_per_sdu() {
        let mut sink = sink(false, 3);
        let mut host = Host::new(64);

        feed(&mut sink, &mut host, &pdu(START, 0, &[1])).unwrap();
        feed(&mut sink, &mut host, &pdu(START, 1, &[2])).unwrap();
        feed(&mut sink, &mut host, &pdu(END, 2, &[3])).unwrap();
        assert_eq!(host.allocs, 1);
        assert_eq!(host.emitted.len(), 1);

        // A failed allocation leaves the sink untouched, so the PDU can be retried.
        host.fail_alloc = true;
        let start = pdu(START, 3, &[4]);
        assert_eq!(feed(&mut sink, &mut host, &start), Err(IsoalError::SduAlloc));
        assert_eq!(feed(&mut sink, &mut host, &start), Err(IsoalError::SduAlloc));
        host.fail_alloc = false;
        feed(&mut sink, &mut host, &start).unwrap();
        feed(&mut sink, &mut host, &pdu(START, 4, &[5])).unwrap();
        feed(&mut sink, &mut host, &pdu(END, 5, &[6])).unwrap();

        assert_eq!(host.allocs, 2);
        let (sdu, data) = &host.emitted[1];
        assert!(sdu.status.is_valid());
        assert_eq!(sdu.seq_num, 2);
        assert_eq!(data, &[4, 5, 6]);
    }

    #[test]
    fn small_buffers_fragment_sdus() {
        let mut sink = sink(false, 1);
        let mut host = Host::new(2);

        feed(&mut sink, &mut host, &pdu(END, 0, &[1, 2, 3, 4, 5])).unwrap();

        let fragments = host
            .emitted
            .iter()
            .map(|(sdu, data)| (sdu.fragment, data.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            fragments,
            vec![
                (SduFragment::Start, vec![1, 2]),
                (SduFragment::Continue, vec![3, 4]),
                (SduFragment::End, vec![5]),
            ]
        );
        assert_eq!(host.allocs, 3);
    }

    #[test]
    fn missing_end_fragment() {
        let mut sink = sink(false, 2);
        let mut host = Host::new(64);

        feed(&mut sink, &mut host, &pdu(START, 0, &[1])).unwrap();
        feed(&mut sink, &mut host, &pdu(START, 1, &[2])).unwrap();

        let (sdu, data) = &host.emitted[0];
        assert_eq!(sdu.status, SduStatus::ERRORS);
        assert_eq!(data, &[1, 2]);
    }

    #[test]
    fn padding_and_errors() {
        let mut sink = sink(false, 2);
        let mut host = Host::new(64);

        // End fragment, then padding
        feed(&mut sink, &mut host, &pdu(END, 0, &[1, 2])).unwrap();
        feed(&mut sink, &mut host, &pdu(START, 1, &[])).unwrap();
        assert_eq!(host.emitted.len(), 1);
        assert!(host.emitted[0].0.status.is_valid());

        // A damaged PDU is reported without its contents.
        let mut damaged = pdu(START, 2, &[9, 9]);
        damaged.status = SduStatus::ERRORS;
        feed(&mut sink, &mut host, &damaged).unwrap();
        assert_eq!(host.emitted.len(), 2);
        assert_eq!(host.emitted[1].0.status, SduStatus::ERRORS);
        assert!(host.emitted[1].1.is_empty());

        feed(&mut sink, &mut host, &pdu(START, 3, &[])).unwrap();
        feed(&mut sink, &mut host, &pdu(END, 4, &[3])).unwrap();
        assert_eq!(host.emitted.len(), 3);
        assert!(host.emitted[2].0.status.is_valid());
        assert_eq!(host.emitted[2].1, &[3]);
        assert_eq!(host.allocs, 3);
    }

    fn framed_payload(segments: &[Segment<'_>]) -> Vec<u8> {
        let mut buf = [0; 64];
        let mut writer = ByteWriter::new(&mut buf);
        for segment in segments {
            segment.to_bytes(&mut writer).unwrap();
        }
        let used = 64 - writer.space_left();
        buf[..used].to_vec()
    }

    #[test]
    fn framed_segments_and_timestamps() {
        let mut sink = sink(true, 1);
        let mut host = Host::new(64);

        let first = framed_payload(&[
            Segment::new(false, true, Some(500), &[1, 2, 3]),
            Segment::new(false, false, Some(300), &[4]),
        ]);
        let second = framed_payload(&[Segment::new(true, true, None, &[5, 6])]);
        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 0, &first)).unwrap();
        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 1, &second)).unwrap();

        assert_eq!(host.emitted.len(), 2);
        let latency = 500 + 10_000 + 10_000;
        let (a, data) = &host.emitted[0];
        assert_eq!(data, &[1, 2, 3]);
        assert_eq!(a.timestamp, Instant::from_raw_micros(ANCHOR + latency - 500));
        assert_eq!(a.seq_num, 1);
        let (b, data) = &host.emitted[1];
        assert_eq!(data, &[4, 5, 6]);
        assert_eq!(b.timestamp, Instant::from_raw_micros(ANCHOR + latency - 300));
        assert_eq!(b.seq_num, 2);
        assert!(b.status.is_valid());
    }

    #[test]
    fn framed_lost_pdu() {
        let mut sink = sink(true, 1);
        let mut host = Host::new(64);

        let start = framed_payload(&[Segment::new(false, false, Some(0), &[1])]);
        let cont = framed_payload(&[Segment::new(true, true, None, &[2])]);
        let single = framed_payload(&[Segment::new(false, true, Some(0), &[3])]);

        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 0, &start)).unwrap();
        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 2, &cont)).unwrap();
        assert_eq!(host.emitted.len(), 1);
        assert!(host.emitted[0].0.status.contains(SduStatus::LOST_DATA));
        assert_eq!(host.emitted[0].1, &[1]);

        // Continuations are dropped until a new SDU starts.
        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 3, &cont)).unwrap();
        assert_eq!(host.emitted.len(), 1);
        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 4, &single)).unwrap();
        assert_eq!(host.emitted.len(), 2);
        assert!(host.emitted[1].0.status.is_valid());
        assert_eq!(host.emitted[1].1, &[3]);
    }

    #[test]
    fn framed_alloc_failure_can_be_retried() {
        let mut sink = sink(true, 1);
        let mut host = Host::new(64);

        let single = framed_payload(&[Segment::new(false, true, Some(0), &[7])]);
        let single = pdu(IsoLlid::Framed, 0, &single);

        host.fail_alloc = true;
        assert_eq!(feed(&mut sink, &mut host, &single), Err(IsoalError::SduAlloc));
        assert!(host.emitted.is_empty());

        host.fail_alloc = false;
        feed(&mut sink, &mut host, &single).unwrap();
        assert_eq!(host.emitted.len(), 1);
        let (sdu, data) = &host.emitted[0];
        assert_eq!(sdu.seq_num, 1);
        assert!(sdu.status.is_valid());
        assert_eq!(data, &[7]);
    }

    #[test]
    fn truncated_segment_is_lost_data() {
        let mut sink = sink(true, 1);
        let mut host = Host::new(64);

        feed(&mut sink, &mut host, &pdu(IsoLlid::Framed, 0, &[0b10, 9, 0, 0, 0, 1])).unwrap();
        assert_eq!(host.emitted.len(), 1);
        assert_eq!(host.emitted[0].0.status, SduStatus::LOST_DATA);
        assert_eq!(host.emitted[0].0.len, 0);
    }
}
