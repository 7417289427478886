//! Per-connection state.

use crate::{
    config::Settings,
    link::{
        chan_sel::ChannelSelection,
        channel_map::ChannelMap,
        connect::ConnectInd,
        features::FeatureSet,
        llcp::VersionNumber,
        procedure::{
            encryption::EncState,
            length::{DataLength, LengthProc},
            phy::PhyState,
            InstantUpdate, Procedure, ProcedureSlot, TerminateProc,
        },
        tx_list::TxList,
        ConnHandle, Role, SeqNum,
    },
    time::{Duration, Instant},
    utils::{div_ceil, Hex},
    ErrorCode,
};

/// Procedure response timeout.
const PROCEDURE_TIMEOUT_US: u32 = 40_000_000;

/// Connection events without a valid packet before a new connection is considered failed.
pub(crate) const CONNECT_EXPIRE: u16 = 6;

/// RSSI changes smaller than or equal to this (in dB) are not reported.
pub(crate) const RSSI_THRESHOLD: u8 = 4;

/// Number of consecutive significant RSSI changes before reporting.
pub(crate) const RSSI_SAMPLES: u8 = 10;

/// Countdown timers, all counted in connection events.
///
/// A value of 0 means the timer is stopped.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    pub supervision_reload: u16,
    pub supervision_expire: u16,
    pub procedure_reload: u16,
    pub procedure_expire: u16,
    pub connect_expire: u16,
    /// Authenticated payload timeout.
    pub apto_reload: u16,
    pub apto_expire: u16,
    /// Authenticated payload timeout minus some margin; sends an `LL_PING_REQ` when it expires.
    pub appto_reload: u16,
    pub appto_expire: u16,
}

/// Receive window widening state of a peripheral.
#[derive(Debug, Default)]
pub(crate) struct Widening {
    /// Widening accumulated per connection interval.
    pub periodic_us: u32,
    /// Upper bound for the widening.
    pub max_us: u32,
    /// Widening accumulated since the last anchor point.
    pub prepare_us: u32,
    /// Widening applied to the current event.
    pub event_us: u32,
    /// Extra window for the first event after connection setup or a connection update.
    pub window_size_prepare_us: u32,
    pub window_size_event_us: u32,
}

/// RSSI tracking.
#[derive(Debug, Default)]
pub(crate) struct RssiState {
    pub latest: u8,
    pub reported: u8,
    pub sample_count: u8,
}

/// What we learned from the peer's `LL_VERSION_IND`.
#[derive(Debug, Copy, Clone)]
pub(crate) struct PeerVersion {
    pub version: VersionNumber,
    pub company_id: Hex<u16>,
    pub sub_version: Hex<u16>,
}

/// All mutable state of one connection.
pub(crate) struct Connection {
    pub handle: ConnHandle,
    pub role: Role,
    pub access_address: u32,
    pub crc_init: u32,
    pub channel_map: ChannelMap,
    pub chan_sel: ChannelSelection,

    /// Counter of the next connection event.
    pub event_counter: u16,
    /// Events skipped since the last prepare.
    pub latency_prepare: u16,
    /// Events skipped right before the current event.
    pub latency_event: u16,
    /// Anchor point of the event with counter `anchor_counter`.
    pub anchor: Instant,
    pub anchor_counter: u16,

    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
    /// Authenticated payload timeout in 10 ms units.
    pub apto: u16,

    /// `SN` of the next new PDU we send.
    pub sn: SeqNum,
    /// `NESN` we send.
    pub nesn: SeqNum,
    pub tx: TxList,
    /// Whether the PDU in flight was sent encrypted.
    pub tx_encrypted: bool,

    /// Sleep clock accuracy of the peer, in ppm.
    pub peer_sca_ppm: u32,
    pub widening: Widening,
    pub timers: Timers,
    /// Whether a packet with a valid CRC was ever received.
    pub established: bool,

    pub data_len: DataLength,
    pub phy: PhyState,
    pub enc: EncState,

    /// Features used on this connection (ours until a feature exchange completed).
    pub features_used: FeatureSet,
    pub peer_version: Option<PeerVersion>,
    pub version_sent: bool,

    /// Slot for the exclusive procedures in `procedure`.
    pub llcp: ProcedureSlot,
    pub procedure: Procedure,
    pub terminate: TerminateProc,
    pub length: LengthProc,
    /// Host PHY update request, started as a `Procedure::PhyUpdate` once `llcp` is free.
    pub phy_req: ProcedureSlot,
    /// Parameters taking effect at an instant.
    pub instant: Option<InstantUpdate>,

    pub rssi: RssiState,

    /// Reason this connection is closing. Set once; the first cause wins.
    pub terminated: Option<ErrorCode>,
}

impl Connection {
    /// Creates the state of a new connection from the `CONNECT_IND` parameters.
    pub fn new(
        handle: ConnHandle,
        role: Role,
        ind: &ConnectInd,
        csa2: bool,
        settings: &Settings,
    ) -> Self {
        let chan_sel = if csa2 {
            ChannelSelection::algorithm2(ind.access_address.0)
        } else {
            ChannelSelection::algorithm1(ind.hop)
        };
        let peer_sca_ppm = match role {
            Role::Peripheral => ind.sca.ppm(),
            Role::Central => 0,
        };

        let mut conn = Self {
            handle,
            role,
            access_address: ind.access_address.0,
            crc_init: ind.crc_init.0,
            channel_map: ind.channel_map,
            chan_sel,
            event_counter: 0,
            latency_prepare: 0,
            latency_event: 0,
            anchor: Instant::from_raw_micros(0),
            anchor_counter: 0,
            interval: ind.interval,
            latency: ind.latency,
            timeout: ind.timeout,
            apto: settings.auth_payload_timeout,
            sn: SeqNum::ZERO,
            nesn: SeqNum::ZERO,
            tx: TxList::new(),
            tx_encrypted: false,
            peer_sca_ppm,
            widening: Widening::default(),
            timers: Timers::default(),
            established: false,
            data_len: DataLength::new(settings.default_tx_octets, settings.default_tx_time),
            phy: PhyState::new(settings.default_phy_tx, settings.default_phy_rx),
            enc: EncState::default(),
            features_used: settings.features,
            peer_version: None,
            version_sent: false,
            llcp: ProcedureSlot::new(),
            procedure: Procedure::Idle,
            terminate: TerminateProc::new(),
            length: LengthProc::new(),
            phy_req: ProcedureSlot::new(),
            instant: None,
            rssi: RssiState::default(),
            terminated: None,
        };

        conn.reload_timers(settings.sca.ppm());
        conn.timers.connect_expire = CONNECT_EXPIRE;
        if role == Role::Peripheral {
            conn.widening.window_size_prepare_us = ind.win_size().as_micros();
        }
        conn
    }

    /// Returns the connection interval.
    pub fn interval(&self) -> Duration {
        Duration::from_units_1250(self.interval)
    }

    /// Returns the air time reserved for one event: a maximum-size exchange in both directions.
    pub fn slot(&self) -> Duration {
        Duration::from_micros(
            u32::from(self.data_len.max_tx_time)
                + u32::from(self.data_len.max_rx_time)
                + Duration::T_IFS.as_micros(),
        )
    }

    /// Returns the number of connection events covering `micros`, rounding up.
    pub fn events_in(&self, micros: u32) -> u16 {
        div_ceil(micros, self.interval().as_micros()) as u16
    }

    /// Recomputes the timer reload values and window widening after the connection parameters
    /// changed.
    ///
    /// Running timers keep counting down from their current value.
    pub fn reload_timers(&mut self, local_ppm: u32) {
        let interval_us = self.interval().as_micros();

        self.timers.supervision_reload = self.events_in(u32::from(self.timeout) * 10_000);
        self.timers.procedure_reload = self.events_in(PROCEDURE_TIMEOUT_US);
        self.reload_apto();

        if self.role == Role::Peripheral {
            self.widening.periodic_us =
                div_ceil((local_ppm + self.peer_sca_ppm) * interval_us, 1_000_000);
            self.widening.max_us = (interval_us / 2).saturating_sub(Duration::T_IFS.as_micros());
        }
    }

    /// Recomputes the authenticated payload timers from `self.apto`.
    pub fn reload_apto(&mut self) {
        self.timers.apto_reload = self.events_in(u32::from(self.apto) * 10_000);
        self.timers.appto_reload = self
            .timers
            .apto_reload
            .saturating_sub(self.latency.saturating_add(6));
        if self.timers.apto_expire != 0 {
            self.timers.apto_expire = self.timers.apto_reload;
            self.timers.appto_expire = self.timers.appto_reload;
        }
    }

    /// Starts the procedure response timer.
    pub fn start_procedure_timer(&mut self) {
        self.timers.procedure_expire = self.timers.procedure_reload;
    }

    /// Stops the procedure response timer.
    pub fn stop_procedure_timer(&mut self) {
        self.timers.procedure_expire = 0;
    }

    /// Marks the connection for termination with `reason`, unless it is already terminating.
    pub fn terminate_with(&mut self, reason: ErrorCode) {
        if self.terminated.is_none() {
            warn!("conn {:?} terminating: {}", self.handle, reason);
            self.terminated = Some(reason);
        }
    }

    /// Returns whether the peer supports `features` (as far as we know).
    pub fn peer_supports(&self, features: FeatureSet) -> bool {
        self.features_used.contains(features)
    }

    /// Returns whether nothing is going on that would keep a peripheral from using its latency.
    pub fn is_quiet(&self) -> bool {
        self.tx.is_idle()
            && !self.llcp.pending()
            && !self.terminate.slot.pending()
            && !self.length.slot.pending()
            && self.instant.is_none()
            && self.terminated.is_none()
    }
}
