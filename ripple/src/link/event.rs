//! The connection event state machine: prepare, execute, transfer and close.

use crate::{
    config::Config,
    link::{
        connection::{Connection, RSSI_SAMPLES, RSSI_THRESHOLD},
        controller::Shared,
        data::{Header, Llid},
        features::FeatureSet,
        notification::Notification,
        pipe::{ReleaseItem, RxItem, RxKind},
        procedure::{self, control, encryption, exchange, Advance},
        tx_list::{Acked, Inflight, TxPick},
        ConnHandle, Role,
    },
    phy::{DataChannel, Phy, Radio, RadioEvent, Received},
    ticker::{Scheduler, TickerId, TickerStatus},
    time::{Duration, Instant},
    ErrorCode,
};
use core::cmp;

/// Time between the scheduler's prepare callback and the anchor point.
pub(crate) const PREPARE_LEAD_US: u32 = 1000;

/// Time the radio needs to ramp up before it can send or receive.
pub(crate) const RADIO_READY_US: u32 = 140;

/// Uncertainty of the radio's receive start, added to both ends of every receive window.
pub(crate) const RX_JITTER_US: u32 = 16;

/// Consecutive CRC errors after which an event is closed.
const CRC_STRIKES: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for `execute`.
    Armed,
    Transmitting,
    Receiving,
}

/// The connection event the radio is currently used for.
#[derive(Debug)]
pub(crate) struct ActiveEvent {
    pub handle: ConnHandle,
    phase: Phase,
    channel: DataChannel,
    /// PHY the radio is configured for.
    radio_phy: Phy,
    counter: u16,
    crc_errors: u8,
    /// Whether a PDU with valid CRC was received.
    synced: bool,
    /// RSSI of the first valid PDU.
    rssi: Option<u8>,
    /// Timestamp of the first valid PDU, relative to the start of the receive window.
    start_to_address: Duration,
    /// `MD` bit of the last valid PDU from the peer.
    peer_md: bool,
    /// `MD` bit of our last PDU.
    our_md: bool,
}

/// Sets up the next connection event of `conn`.
///
/// `lazy` is the number of scheduler expiries skipped since the last call.
pub(crate) fn prepare<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    now: Instant,
    lazy: u16,
) {
    conn.latency_prepare = conn.latency_prepare.wrapping_add(lazy);
    if conn.role == Role::Peripheral {
        let w = &mut conn.widening;
        let grow = w.periodic_us * (u32::from(lazy) + 1);
        w.prepare_us = cmp::min(w.prepare_us + grow, w.max_us);
    }
    let counter = conn.event_counter.wrapping_add(conn.latency_prepare);

    if sh.radio_busy() {
        trace!("conn {:?}: radio busy, skipping event {}", conn.handle, counter);
        conn.latency_prepare = conn.latency_prepare.wrapping_add(1);
        return;
    }

    if procedure::advance(conn, sh, counter, now) == Advance::Reschedule {
        conn.latency_prepare = 0;
        return;
    }
    if conn.terminated.is_some() {
        return;
    }

    conn.latency_event = conn.latency_prepare;
    conn.latency_prepare = 0;
    conn.event_counter = counter;
    conn.widening.event_us = conn.widening.prepare_us;
    conn.widening.window_size_event_us = conn.widening.window_size_prepare_us;
    conn.widening.window_size_prepare_us = 0;

    let channel = conn
        .chan_sel
        .next(counter, conn.latency_event, &conn.channel_map);
    conn.anchor = now + Duration::from_micros(PREPARE_LEAD_US);
    conn.anchor_counter = counter;

    let mut offset = PREPARE_LEAD_US - RADIO_READY_US;
    let radio_phy = match conn.role {
        Role::Central => conn.phy.tx,
        Role::Peripheral => {
            offset = offset.saturating_sub(conn.widening.event_us + RX_JITTER_US);
            conn.phy.rx
        }
    };

    let status = sh.scheduler.start(
        TickerId::Event,
        now,
        Duration::from_micros(offset),
        Duration::ZERO,
        conn.slot(),
        false,
    );
    if status == TickerStatus::Failure {
        warn!("conn {:?}: could not schedule event {}", conn.handle, counter);
        conn.latency_prepare = 1;
        return;
    }

    trace!(
        "conn {:?}: event {} on {:?}, widening {}µs",
        conn.handle,
        counter,
        channel,
        conn.widening.event_us
    );
    sh.event = Some(ActiveEvent {
        handle: conn.handle,
        phase: Phase::Armed,
        channel,
        radio_phy,
        counter,
        crc_errors: 0,
        synced: false,
        rssi: None,
        start_to_address: Duration::ZERO,
        peer_md: false,
        our_md: false,
    });
}

/// Starts the radio for the prepared event.
pub(crate) fn execute<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let (channel, phy) = match &sh.event {
        Some(ev) if ev.phase == Phase::Armed => (ev.channel, ev.radio_phy),
        _ => return,
    };
    sh.radio
        .configure(channel, conn.access_address, conn.crc_init, phy);

    match conn.role {
        Role::Central => transmit(conn, sh),
        Role::Peripheral => {
            let window = first_rx_window(conn);
            receive(conn, sh, window);
        }
    }
}

/// Receive window of a peripheral at the anchor point.
fn first_rx_window(conn: &Connection) -> Duration {
    Duration::from_micros(
        2 * RX_JITTER_US + 2 * conn.widening.event_us + conn.widening.window_size_event_us,
    ) + conn.phy.rx.preamble_to_address()
}

/// Receive window for the response one inter frame space after our PDU.
fn response_rx_window(conn: &Connection) -> Duration {
    Duration::from_micros(2 * RX_JITTER_US) + conn.phy.rx.preamble_to_address()
}

/// Returns whether another exchange still fits into the event.
fn fits(conn: &Connection, now: Instant) -> bool {
    let used = now.raw_micros().wrapping_sub(conn.anchor.raw_micros());
    let needed = conn.slot().as_micros() + PREPARE_LEAD_US;
    used.saturating_add(needed) < conn.interval().as_micros()
}

fn set_radio_phy<C: Config>(conn: &Connection, sh: &mut Shared<C>, phy: Phy) {
    if let Some(ev) = &mut sh.event {
        if ev.radio_phy != phy {
            ev.radio_phy = phy;
            sh.radio
                .configure(ev.channel, conn.access_address, conn.crc_init, phy);
        }
    }
}

fn set_phase<C: Config>(sh: &mut Shared<C>, phase: Phase) {
    if let Some(ev) = &mut sh.event {
        ev.phase = phase;
    }
}

fn receive<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, window: Duration) {
    set_radio_phy(conn, sh, conn.phy.rx);
    set_phase(sh, Phase::Receiving);
    sh.radio.arm_receive(window, conn.enc.rx.as_ref());
}

fn copy_payload(buf: &mut [u8], src: &[u8]) -> u8 {
    buf[..src.len()].copy_from_slice(src);
    src.len() as u8
}

/// Sends the next PDU from the tx list, or an empty one.
///
/// A terminating connection only acknowledges what it received.
fn transmit<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    set_radio_phy(conn, sh, conn.phy.tx);

    let pick = if conn.terminated.is_some() {
        None
    } else {
        let role = conn.role;
        let enc = &conn.enc;
        let ctrl_pool = &sh.ctrl_pool;
        Some(conn.tx.pick(!enc.pause_tx, |h| {
            encryption::tx_allowed(role, enc, ctrl_pool.get(h).control_opcode())
        }))
    };

    let buf = sh.radio.tx_payload_buf();
    // (LLID, payload length, whether the data head has bytes beyond this PDU)
    let (llid, len, head_more) = match pick {
        None => (Llid::DataCont, 0, false),
        Some(TxPick::Ctrl(h)) | Some(TxPick::Retransmit(Inflight::Ctrl(h))) => {
            let len = copy_payload(buf, sh.ctrl_pool.get(h).payload());
            (Llid::Control, len, conn.tx.data_head().is_some())
        }
        Some(TxPick::Data(head)) => {
            let pdu = sh.tx_pool.get(head.node);
            let rest = &pdu.payload()[usize::from(head.offset)..];
            let frag = cmp::min(rest.len(), usize::from(conn.data_len.max_tx_octets));
            let llid = fragment_llid(pdu.header().llid(), head.offset);
            let len = copy_payload(buf, &rest[..frag]);
            conn.tx.sent_data(len);
            (llid, len, frag < rest.len())
        }
        Some(TxPick::Retransmit(Inflight::Data { len })) => match conn.tx.data_head() {
            Some(head) => {
                let pdu = sh.tx_pool.get(head.node);
                let start = usize::from(head.offset);
                let end = start + usize::from(len);
                let llid = fragment_llid(pdu.header().llid(), head.offset);
                let len = copy_payload(buf, &pdu.payload()[start..end]);
                (llid, len, end < pdu.payload().len())
            }
            None => (Llid::DataCont, 0, false),
        },
        Some(TxPick::Retransmit(Inflight::Empty)) => (Llid::DataCont, 0, false),
        Some(TxPick::Empty) => {
            conn.tx.sent_empty();
            (Llid::DataCont, 0, false)
        }
    };

    let mut header = Header::new(llid);
    header.set_payload_length(len);
    header.set_sn(conn.sn);
    header.set_nesn(conn.nesn);
    header.set_md(pick.is_some() && (head_more || conn.tx.has_waiting()));

    let ccm = match pick {
        Some(TxPick::Retransmit(_)) if conn.tx_encrypted => conn.enc.tx.as_ref(),
        Some(TxPick::Retransmit(_)) => None,
        _ => {
            let ccm = if len > 0 { conn.enc.tx.as_ref() } else { None };
            conn.tx_encrypted = ccm.is_some();
            ccm
        }
    };

    if let Some(ev) = &mut sh.event {
        ev.our_md = header.md();
        ev.phase = Phase::Transmitting;
    }
    trace!("DATA-> {:?}", header);
    sh.radio.arm_transmit(header, ccm);
}

/// Only the first fragment of a data PDU carries its LLID.
fn fragment_llid(llid: Llid, offset: u8) -> Llid {
    if offset == 0 {
        llid
    } else {
        Llid::DataCont
    }
}

/// Processes a completed radio transfer.
pub(crate) fn radio_event<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    event: RadioEvent<'_>,
    now: Instant,
) {
    let phase = match &sh.event {
        Some(ev) if ev.handle == conn.handle => ev.phase,
        _ => return,
    };

    match (event, phase) {
        (RadioEvent::TxDone, Phase::Transmitting) => tx_done(conn, sh, now),
        (RadioEvent::RxDone(rx), Phase::Receiving) => rx_done(conn, sh, rx, now),
        (RadioEvent::RxTimeout, Phase::Receiving) => close(conn, sh),
        (event, phase) => warn!("unexpected {:?} while {:?}", event, phase),
    }
}

fn tx_done<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, now: Instant) {
    let (peer_md, our_md) = match &sh.event {
        Some(ev) => (ev.peer_md, ev.our_md),
        None => return,
    };

    let listen = match conn.role {
        Role::Central => true,
        Role::Peripheral => {
            conn.terminated.is_none() && (peer_md || our_md) && fits(conn, now)
        }
    };
    if listen {
        let window = response_rx_window(conn);
        receive(conn, sh, window);
    } else {
        close(conn, sh);
    }
}

fn rx_done<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, rx: Received<'_>, now: Instant) {
    if !rx.crc_ok {
        let strikes = match &mut sh.event {
            Some(ev) => {
                ev.crc_errors += 1;
                ev.crc_errors
            }
            None => return,
        };
        trace!("conn {:?}: CRC error ({})", conn.handle, strikes);
        if strikes >= CRC_STRIKES {
            close(conn, sh);
        } else {
            transmit(conn, sh);
        }
        return;
    }

    let header = rx.header;
    if let Some(ev) = &mut sh.event {
        ev.crc_errors = 0;
        ev.peer_md = header.md();
        if !ev.synced {
            ev.synced = true;
            ev.rssi = rx.rssi;
            ev.start_to_address = rx.start_to_address;
            if conn.role == Role::Peripheral {
                conn.widening.prepare_us = 0;
            }
        }
    }
    conn.established = true;
    conn.timers.connect_expire = 0;
    conn.timers.supervision_expire = 0;

    if !rx.mic_ok {
        conn.terminate_with(ErrorCode::MicFailure);
        close(conn, sh);
        return;
    }

    if header.nesn() != conn.sn {
        conn.sn.increment();
        acked(conn, sh);
    }

    if header.sn() == conn.nesn && accept(conn, sh, header, rx.payload) {
        conn.nesn.increment();
    }

    let peer_md = header.md();
    let more = match conn.role {
        Role::Central => {
            conn.terminated.is_none() && (peer_md || conn.tx.has_queued()) && fits(conn, now)
        }
        Role::Peripheral => conn.terminated != Some(ErrorCode::MicFailure),
    };
    if more {
        transmit(conn, sh);
    } else {
        close(conn, sh);
    }
}

/// The peer acknowledged our in-flight PDU.
fn acked<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let tx_pool = &sh.tx_pool;
    let acked = conn
        .tx
        .acked(|node| tx_pool.get(node).header().payload_length());

    if acked != Acked::Nothing && conn.tx_encrypted {
        if let Some(ccm) = &mut conn.enc.tx {
            ccm.counter += 1;
        }
    }

    match acked {
        Acked::Nothing | Acked::Fragment => {}
        Acked::Ctrl(node) => {
            let opcode = sh.ctrl_pool.get(node).control_opcode();
            sh.ctrl_pool.release(node);
            control::acked(conn, sh, opcode);
        }
        Acked::Data(node) => {
            let item = ReleaseItem {
                handle: conn.handle,
                node,
                counted: true,
            };
            // Cannot fail: the release pipe has room for every data buffer.
            sh.release_pipe.enqueue(item).ok();
            sh.signal_rx();
        }
    }
}

/// Processes a new PDU from the peer. Returns whether it is acknowledged.
fn accept<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    header: Header,
    payload: &[u8],
) -> bool {
    let encrypted = conn.enc.rx.is_some() && !payload.is_empty();

    let accepted = match header.llid() {
        Llid::DataCont if payload.is_empty() => true,
        Llid::Control => control::rx(conn, sh, payload),
        Llid::DataCont | Llid::DataStart => {
            if conn.enc.pause_rx {
                warn!("conn {:?}: data PDU during encryption setup", conn.handle);
                conn.terminate_with(ErrorCode::MicFailure);
                return false;
            }
            rx_data(conn.handle, sh, header.llid(), payload)
        }
        Llid::Reserved => {
            debug!("conn {:?}: ignoring PDU with reserved LLID", conn.handle);
            true
        }
    };

    if accepted && encrypted {
        if let Some(ccm) = &mut conn.enc.rx {
            ccm.counter += 1;
        }
        if conn.timers.apto_expire != 0 {
            conn.timers.apto_expire = conn.timers.apto_reload;
            conn.timers.appto_expire = conn.timers.appto_reload;
        }
    }
    accepted
}

/// Passes a received data PDU to the host.
fn rx_data<C: Config>(handle: ConnHandle, sh: &mut Shared<C>, llid: Llid, payload: &[u8]) -> bool {
    if !sh.can_notify() {
        trace!("conn {:?}: rx pipe full, nacking", handle);
        return false;
    }
    let node = match sh.rx_pool.acquire() {
        Some(node) => node,
        None => {
            trace!("conn {:?}: out of rx buffers, nacking", handle);
            return false;
        }
    };
    if sh.rx_pool.get_mut(node).set_data(llid, payload).is_err() {
        sh.rx_pool.release(node);
        warn!("conn {:?}: dropping oversized PDU", handle);
        return true;
    }
    let item = RxItem {
        handle,
        kind: RxKind::Pdu(node),
    };
    if let Err(item) = sh.rx_pipe.enqueue(item) {
        if let RxKind::Pdu(node) = item.kind {
            sh.rx_pool.release(node);
        }
        return false;
    }
    sh.signal_rx();
    true
}

/// Ends the current event and updates the timers of `conn`.
///
/// Connections that end up terminated are released by the caller.
pub(crate) fn close<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let ev = match sh.event.take() {
        Some(ev) => ev,
        None => return,
    };
    sh.radio.disable();

    let elapsed = conn.latency_event.wrapping_add(1);
    conn.event_counter = ev.counter.wrapping_add(1);

    let timers = &mut conn.timers;
    if !ev.synced {
        if timers.connect_expire != 0 {
            if timers.connect_expire > elapsed {
                timers.connect_expire -= elapsed;
            } else {
                conn.terminate_with(ErrorCode::ConnectionFailedToEstablish);
            }
        } else {
            if timers.supervision_expire == 0 {
                timers.supervision_expire = timers.supervision_reload;
            }
            if timers.supervision_expire > elapsed {
                timers.supervision_expire -= elapsed;
            } else {
                conn.terminate_with(ErrorCode::ConnectionTimeout);
            }
        }
    }
    if conn.terminated.is_some() {
        return;
    }

    let timers = &mut conn.timers;
    if timers.procedure_expire != 0 {
        if timers.procedure_expire > elapsed {
            timers.procedure_expire -= elapsed;
        } else {
            conn.terminate_with(ErrorCode::LlResponseTimeout);
            return;
        }
    }

    let timers = &mut conn.timers;
    if timers.apto_expire != 0 {
        if timers.apto_expire > elapsed {
            timers.apto_expire -= elapsed;
        } else {
            timers.apto_expire = timers.apto_reload;
            let _ = sh.notify(conn.handle, Notification::AuthPayloadTimeout);
        }
    }
    let timers = &mut conn.timers;
    if timers.appto_expire != 0 {
        if timers.appto_expire > elapsed {
            timers.appto_expire -= elapsed;
        } else {
            timers.appto_expire = 0;
            if conn.peer_supports(FeatureSet::LE_PING) {
                exchange::start_ping(conn);
            }
        }
    }

    if sh.settings.rssi_reporting {
        if let Some(rssi) = ev.rssi {
            sample_rssi(conn, sh, rssi);
        }
    }

    let (mut drift_plus, mut drift_minus) = (Duration::ZERO, Duration::ZERO);
    if conn.role == Role::Peripheral && ev.synced {
        let expected = Duration::from_micros(RX_JITTER_US + conn.widening.event_us)
            + conn.phy.rx.preamble_to_address();
        if ev.start_to_address > expected {
            drift_plus = ev.start_to_address - expected;
        } else {
            drift_minus = expected - ev.start_to_address;
        }
    }

    let quiet = conn.is_quiet();
    let (lazy, force) = match conn.role {
        Role::Peripheral if conn.latency > 0 => {
            if quiet && conn.established {
                (conn.latency, false)
            } else {
                (0, !quiet)
            }
        }
        _ => (0, false),
    };

    if drift_plus != Duration::ZERO || drift_minus != Duration::ZERO || lazy != 0 || force {
        sh.scheduler.update(
            TickerId::Connection(conn.handle),
            drift_plus,
            drift_minus,
            lazy,
            force,
        );
    }
    trace!("conn {:?}: event {} closed", conn.handle, ev.counter);
}

/// Tracks the RSSI and reports it once it has changed significantly for a while.
fn sample_rssi<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, rssi: u8) {
    let state = &mut conn.rssi;
    state.latest = rssi;
    let delta = (i16::from(rssi) - i16::from(state.reported)).abs();
    if delta <= i16::from(RSSI_THRESHOLD) {
        state.sample_count = 0;
        return;
    }

    state.sample_count = state.sample_count.saturating_add(1);
    if state.sample_count >= RSSI_SAMPLES
        && sh
            .notify(conn.handle, Notification::Rssi { rssi })
            .is_ok()
    {
        conn.rssi.reported = rssi;
        conn.rssi.sample_count = 0;
    }
}
