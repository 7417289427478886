//! The scanner and initiator roles.
//!
//! Every scan interval, the scanner listens on one advertising channel for the scan window,
//! moving to the next channel (37, 38, 39, 37, ...) with every window. Received advertising PDUs
//! are reported to the host. An active scanner also sends a `SCAN_REQ` to scannable advertisers
//! and reports their `SCAN_RSP`.
//!
//! An initiator is a scanner looking for one specific advertiser. When that device sends a
//! connectable PDU, the initiator answers with `CONNECT_IND` and the reserved connection context
//! becomes a central connection.

use crate::{
    bytes::{ByteWriter, ToBytes},
    config::Config,
    link::{
        advertiser::{response_window, ConnectRequest},
        advertising::{self, AdvReport, DeviceAddress, PduType},
        connect::{ConnectInd, CONNECT_IND_SIZE},
        controller::{RadioRole, Shared},
        event::{PREPARE_LEAD_US, RADIO_READY_US},
        features::FeatureSet,
        ConnHandle,
    },
    phy::{AdvReceived, AdvertisingChannel, Radio, RadioEvent},
    ticker::{Scheduler, TickerId, TickerStatus},
    time::{Duration, Instant},
    RequestError,
};

/// Scan parameters, fixed while scanning is enabled.
#[derive(Debug, Copy, Clone)]
pub struct ScanParams {
    /// Send `SCAN_REQ` to scannable advertisers. Ignored by the initiator.
    pub active: bool,

    /// Scan interval in 0.625 ms units (`0x0004..=0x4000`).
    pub interval: u16,

    /// Scan window in 0.625 ms units, at most `interval`.
    pub window: u16,

    pub own_address: DeviceAddress,
}

impl ScanParams {
    pub(crate) fn validate(&self) -> Result<(), RequestError> {
        let range = 0x0004..=0x4000;
        let window_ok = range.contains(&self.window) && self.window <= self.interval;
        if range.contains(&self.interval) && window_ok {
            Ok(())
        } else {
            Err(RequestError::InvalidParameters)
        }
    }

    pub(crate) fn period(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 625)
    }

    pub(crate) fn window(&self) -> Duration {
        Duration::from_micros(u32::from(self.window) * 625)
    }
}

/// The connection an initiator tries to create.
pub(crate) struct Initiator {
    pub peer: DeviceAddress,
    pub ind: ConnectInd,
    /// Context reserved for the connection.
    pub conn: ConnHandle,
    /// `ChSel` bit of the advertising PDU that was answered.
    chsel: bool,
}

impl Initiator {
    pub fn new(peer: DeviceAddress, ind: ConnectInd, conn: ConnHandle) -> Self {
        Self {
            peer,
            ind,
            conn,
            chsel: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Waiting for `execute`.
    Armed,
    Listening,
    /// Sending a `SCAN_REQ`.
    Requesting,
    /// Waiting for the `SCAN_RSP`.
    AwaitingResponse,
    /// Sending `CONNECT_IND`.
    Connecting,
}

/// An enabled scanner or initiator.
pub(crate) struct Scanner {
    pub params: ScanParams,
    pub initiator: Option<Initiator>,
    channel: AdvertisingChannel,
    phase: Phase,
    /// Start of the current scan window.
    anchor: Instant,
    /// Advertiser the last `SCAN_REQ` went to.
    requested: Option<DeviceAddress>,
}

impl Scanner {
    pub fn new(params: ScanParams, initiator: Option<Initiator>) -> Self {
        Self {
            params,
            initiator,
            channel: AdvertisingChannel::first(),
            phase: Phase::Idle,
            anchor: Instant::from_raw_micros(0),
            requested: None,
        }
    }
}

/// The scan timer fired: set up the next scan window.
pub(crate) fn prepare<C: Config>(scan: &mut Scanner, sh: &mut Shared<C>, now: Instant) {
    if sh.radio_busy() {
        trace!("radio busy, skipping scan window");
        return;
    }
    let status = sh.scheduler.start(
        TickerId::Event,
        now,
        Duration::from_micros(PREPARE_LEAD_US - RADIO_READY_US),
        Duration::ZERO,
        scan.params.window(),
        false,
    );
    if status == TickerStatus::Failure {
        warn!("could not schedule scan window");
        return;
    }
    scan.anchor = now + Duration::from_micros(PREPARE_LEAD_US);
    scan.phase = Phase::Armed;
    sh.radio_role = Some(RadioRole::Scanner);
}

/// Starts listening for the prepared scan window.
pub(crate) fn execute<C: Config>(scan: &mut Scanner, sh: &mut Shared<C>) {
    if scan.phase != Phase::Armed {
        return;
    }
    trace!("scanning on {:?}", scan.channel);
    sh.radio.configure_advertising(scan.channel);
    scan.phase = Phase::Listening;
    sh.radio.arm_receive_advertising(scan.params.window());
}

/// Listens for the rest of the scan window, or closes it.
fn listen<C: Config>(scan: &mut Scanner, sh: &mut Shared<C>, now: Instant) {
    let used = now.duration_since(scan.anchor);
    let window = scan.params.window();
    if used >= window {
        close(scan, sh);
    } else {
        scan.phase = Phase::Listening;
        sh.radio.arm_receive_advertising(window - used);
    }
}

fn close<C: Config>(scan: &mut Scanner, sh: &mut Shared<C>) {
    sh.radio.disable();
    scan.phase = Phase::Idle;
    scan.requested = None;
    scan.channel = scan.channel.cycle();
    sh.radio_role = None;
}

/// Processes a completed radio transfer. Returns the `CONNECT_IND` once the initiator sent it.
///
/// When a request is returned, the scan window is still open; the caller ends it.
pub(crate) fn radio_event<C: Config>(
    scan: &mut Scanner,
    sh: &mut Shared<C>,
    event: RadioEvent<'_>,
    now: Instant,
) -> Option<ConnectRequest> {
    match (event, scan.phase) {
        (RadioEvent::AdvRxDone(rx), Phase::Listening) => rx_adv(scan, sh, &rx, now),
        (RadioEvent::AdvRxDone(rx), Phase::AwaitingResponse) => {
            let from = DeviceAddress::from_payload(rx.payload, 0, rx.header.tx_add());
            let expected = from.is_some() && from == scan.requested;
            if rx.crc_ok && rx.header.type_() == PduType::ScanRsp && expected {
                report(sh, &rx);
            }
            scan.requested = None;
            listen(scan, sh, now);
        }
        (RadioEvent::RxTimeout, Phase::Listening) => close(scan, sh),
        (RadioEvent::RxTimeout, Phase::AwaitingResponse) => {
            scan.requested = None;
            listen(scan, sh, now);
        }
        (RadioEvent::TxDone, Phase::Requesting) => {
            scan.phase = Phase::AwaitingResponse;
            sh.radio.arm_receive_advertising(response_window());
        }
        (RadioEvent::TxDone, Phase::Connecting) => {
            return scan.initiator.as_ref().map(|init| ConnectRequest {
                ind: init.ind,
                chsel: init.chsel,
                peer: init.peer,
            });
        }
        (event, phase) => warn!("unexpected {:?} while scanning ({:?})", event, phase),
    }
    None
}

/// Handles an advertising PDU received in the scan window.
fn rx_adv<C: Config>(scan: &mut Scanner, sh: &mut Shared<C>, rx: &AdvReceived<'_>, now: Instant) {
    let header = rx.header;
    let payload = match rx.payload.get(..usize::from(header.payload_length())) {
        Some(payload) if rx.crc_ok => payload,
        _ => return listen(scan, sh, now),
    };
    let advertiser = match DeviceAddress::from_payload(payload, 0, header.tx_add()) {
        Some(addr) => addr,
        None => return listen(scan, sh, now),
    };
    let own = scan.params.own_address;
    let ty = header.type_();
    let to_us = ty == PduType::AdvDirectInd
        && DeviceAddress::from_payload(payload, 6, header.rx_add()) == Some(own);

    if let Some(init) = &mut scan.initiator {
        let connectable = (ty == PduType::AdvInd || to_us) && advertiser == init.peer;
        if connectable && sh.can_establish() && send_connect_ind(init, sh, own, header.chsel()) {
            scan.phase = Phase::Connecting;
        } else {
            listen(scan, sh, now);
        }
        return;
    }

    let reportable = match ty {
        PduType::AdvInd | PduType::AdvNonconnInd | PduType::AdvScanInd => true,
        PduType::AdvDirectInd => to_us,
        _ => false,
    };
    if reportable && report(sh, rx) && scan.params.active && ty.is_scannable() {
        let buf = sh.radio.tx_payload_buf();
        let header = advertising::lower(PduType::ScanReq, &[&own, &advertiser], &[], buf);
        trace!("SCAN_REQ-> {:?}", advertiser);
        scan.requested = Some(advertiser);
        scan.phase = Phase::Requesting;
        sh.radio.arm_transmit_advertising(header);
    } else {
        listen(scan, sh, now);
    }
}

/// Writes and transmits `CONNECT_IND` to `init.peer`.
fn send_connect_ind<C: Config>(
    init: &mut Initiator,
    sh: &mut Shared<C>,
    own: DeviceAddress,
    peer_chsel: bool,
) -> bool {
    let mut lldata = [0; CONNECT_IND_SIZE];
    if let Err(e) = init.ind.to_bytes(&mut ByteWriter::new(&mut lldata)) {
        error!("failed to encode CONNECT_IND: {}", e);
        return false;
    }
    let csa2 = sh
        .settings
        .features
        .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
    let buf = sh.radio.tx_payload_buf();
    let mut header = advertising::lower(PduType::ConnectInd, &[&own, &init.peer], &lldata, buf);
    header.set_chsel(csa2);
    init.chsel = peer_chsel;
    debug!("CONNECT_IND-> {:?}: {:?}", init.peer, init.ind);
    sh.radio.arm_transmit_advertising(header);
    true
}

/// Passes an advertising PDU to the host. Returns whether there was room for it.
fn report<C: Config>(sh: &mut Shared<C>, rx: &AdvReceived<'_>) -> bool {
    let len = usize::from(rx.header.payload_length());
    let report = match rx.payload.get(..len).and_then(|p| AdvReport::new(rx.header, p, rx.rssi)) {
        Some(report) => report,
        None => return false,
    };
    if sh.report_pipe.enqueue(report).is_err() {
        trace!("report pipe full, dropping {:?}", report);
        return false;
    }
    sh.signal_rx();
    true
}
