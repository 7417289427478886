//! The advertiser role.
//!
//! Every advertising interval, the advertiser sends its PDU on each enabled advertising channel,
//! in ascending order. After a scannable or connectable PDU, it listens for one inter frame space
//! for a `SCAN_REQ` (answered with `SCAN_RSP`) or a `CONNECT_IND` addressed to it. A valid
//! `CONNECT_IND` ends advertising and turns the reserved connection context into a peripheral
//! connection.

use crate::{
    bytes::{ByteReader, FromBytes},
    config::Config,
    link::{
        advertising::{
            self, DeviceAddress, PduType, CONNECT_IND_PDU_SIZE, MAX_ADV_DATA, SCAN_REQ_SIZE,
        },
        connect::ConnectInd,
        controller::{RadioRole, Shared},
        event::{PREPARE_LEAD_US, RADIO_READY_US, RX_JITTER_US},
        features::FeatureSet,
        ConnHandle,
    },
    phy::{AdvReceived, AdvertisingChannel, Phy, Radio, RadioEvent},
    ticker::{Scheduler, TickerId, TickerStatus},
    time::{Duration, Instant},
    RequestError,
};
use bitflags::bitflags;
use rand_core::RngCore;

/// Interval of high duty cycle directed advertising.
pub(crate) const HIGH_DUTY_INTERVAL_US: u32 = 3750;

/// High duty cycle directed advertising stops after this long without a connection.
pub(crate) const HIGH_DUTY_TIMEOUT_US: u32 = 1_280_000;

/// Upper bound of the random delay added to every advertising interval.
const MAX_ADV_DELAY_US: u32 = 10_000;

/// Radio time needed per channel: PDU, inter frame space, request, inter frame space, response.
const CHANNEL_SLOT_US: u32 = 1500;

bitflags! {
    /// The advertising channels to use.
    pub struct AdvChannels: u8 {
        const CH37 = 1 << 0;
        const CH38 = 1 << 1;
        const CH39 = 1 << 2;
    }
}

impl AdvChannels {
    /// Returns the lowest enabled channel.
    pub fn first(&self) -> Option<AdvertisingChannel> {
        AdvertisingChannel::iter_all().find(|ch| self.contains_channel(*ch))
    }

    /// Returns the next enabled channel above `channel`.
    pub fn after(&self, channel: AdvertisingChannel) -> Option<AdvertisingChannel> {
        AdvertisingChannel::iter_all()
            .filter(|ch| ch.index() > channel.index())
            .find(|ch| self.contains_channel(*ch))
    }

    fn contains_channel(&self, channel: AdvertisingChannel) -> bool {
        self.bits() & (1 << (channel.index() - 37)) != 0
    }
}

/// Advertising parameters, fixed while advertising is enabled.
#[derive(Debug, Copy, Clone)]
pub struct AdvParams {
    /// One of `AdvInd`, `AdvDirectInd`, `AdvNonconnInd` or `AdvScanInd`.
    pub pdu_type: PduType,

    /// Advertising interval in 0.625 ms units (`0x0020..=0x4000`).
    ///
    /// Not used by high duty cycle directed advertising.
    pub interval: u16,

    pub channels: AdvChannels,

    pub own_address: DeviceAddress,

    /// The initiator addressed by directed advertising.
    pub peer: Option<DeviceAddress>,

    /// Send directed advertising every 3.75 ms, for at most 1.28 s.
    pub high_duty: bool,
}

impl AdvParams {
    /// Returns whether this is high duty cycle directed advertising.
    pub(crate) fn is_high_duty(&self) -> bool {
        self.pdu_type == PduType::AdvDirectInd && self.high_duty
    }

    pub(crate) fn validate(&self) -> Result<(), RequestError> {
        let type_ok = match self.pdu_type {
            PduType::AdvInd | PduType::AdvNonconnInd | PduType::AdvScanInd => true,
            PduType::AdvDirectInd => self.peer.is_some(),
            _ => false,
        };
        let interval_ok = self.is_high_duty() || (0x0020..=0x4000).contains(&self.interval);
        if type_ok && interval_ok && !self.channels.is_empty() {
            Ok(())
        } else {
            Err(RequestError::InvalidParameters)
        }
    }

    /// Returns the time between advertising events, without the random delay.
    pub(crate) fn period(&self) -> Duration {
        if self.is_high_duty() {
            Duration::from_micros(HIGH_DUTY_INTERVAL_US)
        } else {
            Duration::from_micros(u32::from(self.interval) * 625)
        }
    }

    /// Returns the radio time reserved for one advertising event.
    pub(crate) fn slot(&self) -> Duration {
        Duration::from_micros(CHANNEL_SLOT_US * self.channels.bits().count_ones())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Waiting for `execute`.
    Armed,
    /// Sending the advertising PDU.
    Transmitting,
    /// Waiting for a request after the advertising PDU.
    Listening,
    /// Sending a `SCAN_RSP`.
    Responding,
}

/// A `CONNECT_IND` accepted by the advertiser or sent by the initiator.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ConnectRequest {
    pub ind: ConnectInd,
    /// `ChSel` bit of the peer's PDU.
    pub chsel: bool,
    pub peer: DeviceAddress,
}

/// An enabled advertiser.
pub(crate) struct Advertiser {
    pub params: AdvParams,
    /// Connection context reserved for the connection a `CONNECT_IND` creates.
    pub conn: Option<ConnHandle>,
    channel: AdvertisingChannel,
    phase: Phase,
}

impl Advertiser {
    pub fn new(params: AdvParams, conn: Option<ConnHandle>) -> Self {
        Self {
            params,
            conn,
            channel: AdvertisingChannel::first(),
            phase: Phase::Idle,
        }
    }
}

/// Host data carried by advertising and scan response PDUs.
#[derive(Debug, Default)]
pub(crate) struct AdvData {
    pub adv: heapless::Vec<u8, MAX_ADV_DATA>,
    pub scan_rsp: heapless::Vec<u8, MAX_ADV_DATA>,
}

/// Replaces `dest` with `data`.
pub(crate) fn set_data(
    dest: &mut heapless::Vec<u8, MAX_ADV_DATA>,
    data: &[u8],
) -> Result<(), RequestError> {
    let mut new = heapless::Vec::new();
    new.extend_from_slice(data)
        .map_err(|_| RequestError::InvalidParameters)?;
    *dest = new;
    Ok(())
}

/// The advertising timer fired: set up the next advertising event.
pub(crate) fn prepare<C: Config>(adv: &mut Advertiser, sh: &mut Shared<C>, now: Instant) {
    if sh.radio_busy() {
        trace!("radio busy, skipping advertising event");
        return;
    }
    let channel = match adv.params.channels.first() {
        Some(channel) => channel,
        None => return,
    };

    if !adv.params.is_high_duty() {
        let delay = sh.rng.next_u32() % (MAX_ADV_DELAY_US + 1);
        sh.scheduler.update(
            TickerId::Advertiser,
            Duration::from_micros(delay),
            Duration::ZERO,
            0,
            false,
        );
    }

    let status = sh.scheduler.start(
        TickerId::Event,
        now,
        Duration::from_micros(PREPARE_LEAD_US - RADIO_READY_US),
        Duration::ZERO,
        adv.params.slot(),
        false,
    );
    if status == TickerStatus::Failure {
        warn!("could not schedule advertising event");
        return;
    }

    adv.channel = channel;
    adv.phase = Phase::Armed;
    sh.radio_role = Some(RadioRole::Advertiser);
}

/// Starts the radio for the prepared advertising event.
pub(crate) fn execute<C: Config>(adv: &mut Advertiser, sh: &mut Shared<C>) {
    if adv.phase == Phase::Armed {
        transmit(adv, sh);
    }
}

/// Sends the advertising PDU on the current channel.
fn transmit<C: Config>(adv: &mut Advertiser, sh: &mut Shared<C>) {
    sh.radio.configure_advertising(adv.channel);

    let params = &adv.params;
    let csa2 = sh
        .settings
        .features
        .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
    let buf = sh.radio.tx_payload_buf();
    let mut header = match (params.pdu_type, &params.peer) {
        (PduType::AdvDirectInd, Some(peer)) => {
            advertising::lower(params.pdu_type, &[&params.own_address, peer], &[], buf)
        }
        (ty, _) => advertising::lower(ty, &[&params.own_address], &sh.adv_data.adv, buf),
    };
    header.set_chsel(csa2 && params.pdu_type.is_connectable());

    trace!("ADV-> {:?} on {:?}", header, adv.channel);
    adv.phase = Phase::Transmitting;
    sh.radio.arm_transmit_advertising(header);
}

/// Moves on to the next enabled channel, or ends the event after the last one.
pub(crate) fn next_channel<C: Config>(adv: &mut Advertiser, sh: &mut Shared<C>) {
    match adv.params.channels.after(adv.channel) {
        Some(channel) => {
            adv.channel = channel;
            transmit(adv, sh);
        }
        None => close(adv, sh),
    }
}

fn close<C: Config>(adv: &mut Advertiser, sh: &mut Shared<C>) {
    sh.radio.disable();
    adv.phase = Phase::Idle;
    sh.radio_role = None;
}

/// Processes a completed radio transfer. Returns an accepted `CONNECT_IND`.
///
/// When a request is returned, the event is still running: the caller either ends advertising or
/// calls `next_channel`.
pub(crate) fn radio_event<C: Config>(
    adv: &mut Advertiser,
    sh: &mut Shared<C>,
    event: RadioEvent<'_>,
) -> Option<ConnectRequest> {
    match (event, adv.phase) {
        (RadioEvent::TxDone, Phase::Transmitting) => {
            let ty = adv.params.pdu_type;
            if ty.is_connectable() || ty.is_scannable() {
                adv.phase = Phase::Listening;
                sh.radio.arm_receive_advertising(response_window());
            } else {
                next_channel(adv, sh);
            }
        }
        (RadioEvent::TxDone, Phase::Responding) | (RadioEvent::RxTimeout, Phase::Listening) => {
            next_channel(adv, sh)
        }
        (RadioEvent::AdvRxDone(rx), Phase::Listening) => {
            let request = rx_request(adv, sh, &rx);
            if request.is_none() && adv.phase == Phase::Listening {
                next_channel(adv, sh);
            }
            return request;
        }
        (event, phase) => warn!("unexpected {:?} while advertising ({:?})", event, phase),
    }
    None
}

/// Receive window for a request one inter frame space after our PDU.
pub(crate) fn response_window() -> Duration {
    Duration::from_micros(2 * RX_JITTER_US) + Phy::Le1M.preamble_to_address()
}

/// Handles a PDU received after our advertising PDU.
///
/// Answers `SCAN_REQ` right away and returns a valid `CONNECT_IND`. Anything else is ignored.
fn rx_request<C: Config>(
    adv: &mut Advertiser,
    sh: &mut Shared<C>,
    rx: &AdvReceived<'_>,
) -> Option<ConnectRequest> {
    if !rx.crc_ok {
        return None;
    }
    let params = &adv.params;
    let header = rx.header;
    let len = header.payload_length();
    let payload = rx.payload.get(..usize::from(len))?;
    let sender = DeviceAddress::from_payload(payload, 0, header.tx_add())?;
    let target = DeviceAddress::from_payload(payload, 6, header.rx_add())?;
    if target != params.own_address {
        return None;
    }

    match header.type_() {
        PduType::ScanReq if len == SCAN_REQ_SIZE && params.pdu_type.is_scannable() => {
            debug!("SCAN_REQ from {:?}", sender);
            let buf = sh.radio.tx_payload_buf();
            let header = advertising::lower(
                PduType::ScanRsp,
                &[&params.own_address],
                &sh.adv_data.scan_rsp,
                buf,
            );
            adv.phase = Phase::Responding;
            sh.radio.arm_transmit_advertising(header);
            None
        }
        PduType::ConnectInd if len == CONNECT_IND_PDU_SIZE && params.pdu_type.is_connectable() => {
            if adv.conn.is_none() {
                return None;
            }
            if params.pdu_type == PduType::AdvDirectInd && params.peer != Some(sender) {
                debug!("CONNECT_IND from unexpected initiator {:?}", sender);
                return None;
            }
            match ConnectInd::from_bytes(&mut ByteReader::new(&payload[12..])) {
                Ok(ind) => {
                    debug!("CONNECT_IND from {:?}: {:?}", sender, ind);
                    Some(ConnectRequest {
                        ind,
                        chsel: header.chsel(),
                        peer: sender,
                    })
                }
                Err(e) => {
                    debug!("malformed CONNECT_IND: {}", e);
                    None
                }
            }
        }
        _ => None,
    }
}
