//! Link-Layer Control Procedures.
//!
//! A connection runs at most one of the procedures in [`Procedure`] at a time, guarded by the
//! `llcp` [`ProcedureSlot`]. Termination, data length update and host PHY requests have slots of
//! their own. Procedures only make progress from [`advance`], which runs in the prepare step of
//! every connection event, and from the handlers of received and acknowledged control PDUs.
//!
//! Procedures that carry an *instant* (connection update, channel map update and PHY update)
//! additionally need the controller-wide [`InstantToken`] before they may send their indication,
//! so that only one connection at a time is waiting for new parameters to take effect.
//!
//! [`Procedure`]: enum.Procedure.html
//! [`ProcedureSlot`]: struct.ProcedureSlot.html
//! [`advance`]: fn.advance.html
//! [`InstantToken`]: struct.InstantToken.html

pub(crate) mod chan_map;
pub(crate) mod conn_update;
pub(crate) mod control;
pub mod encryption;
pub(crate) mod exchange;
pub(crate) mod length;
pub(crate) mod phy;

use self::{
    chan_map::ChannelMapProc, conn_update::ConnUpdateProc, encryption::EncProc,
    exchange::ExchangeProc, phy::PhyProc,
};
use crate::{
    config::Config,
    link::{
        channel_map::ChannelMap, connection::Connection, controller::Shared,
        llcp::ConnectionUpdateData, llcp::ControlPdu, ConnHandle,
    },
    phy::PhySet,
    time::Instant,
    ErrorCode, RequestError,
};

/// Request/acknowledge counter pair of a procedure.
///
/// The host side bumps `req`, the connection bumps `ack` once the procedure is done. The
/// procedure is pending while the two differ.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcedureSlot {
    req: u8,
    ack: u8,
}

impl ProcedureSlot {
    pub fn new() -> Self {
        Self { req: 0, ack: 0 }
    }

    /// Returns whether a procedure is in progress.
    pub fn pending(&self) -> bool {
        self.req != self.ack
    }

    /// Marks a new procedure as requested.
    ///
    /// Fails without touching the counters if one is already pending.
    pub fn request(&mut self) -> Result<(), RequestError> {
        if self.pending() {
            return Err(RequestError::Busy);
        }
        self.req = self.req.wrapping_add(1);
        Ok(())
    }

    /// Marks the pending procedure as done.
    pub fn complete(&mut self) {
        self.ack = self.req;
    }

    /// Reopens the slot for a procedure the peer started while we are still running one that is
    /// part of the same exchange.
    pub fn reopen(&mut self) {
        self.ack = self.req.wrapping_sub(1);
    }

    /// Returns the raw request counter.
    pub fn req(&self) -> u8 {
        self.req
    }
}

impl Default for ProcedureSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The controller-wide token for procedures with an instant.
#[derive(Debug, Default)]
pub struct InstantToken(Option<ConnHandle>);

impl InstantToken {
    pub fn new() -> Self {
        InstantToken(None)
    }

    /// Takes the token for `handle`.
    ///
    /// Returns `true` if `handle` now holds the token, `false` if another connection does.
    pub fn acquire(&mut self, handle: ConnHandle) -> bool {
        match self.0 {
            None => {
                self.0 = Some(handle);
                true
            }
            Some(owner) => owner == handle,
        }
    }

    /// Returns the token if `handle` holds it.
    pub fn release(&mut self, handle: ConnHandle) {
        if self.0 == Some(handle) {
            self.0 = None;
        }
    }

    /// Returns the connection holding the token.
    pub fn owner(&self) -> Option<ConnHandle> {
        self.0
    }

    /// Returns whether a connection other than `handle` holds the token.
    pub fn held_by_other(&self, handle: ConnHandle) -> bool {
        matches!(self.0, Some(owner) if owner != handle)
    }
}

/// Position of an instant relative to an event counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstantStatus {
    /// The instant is the given event or lies in the future.
    Pending,
    /// The instant lies in the past.
    Passed,
}

/// Classifies `instant` as seen from the event with counter `counter`.
///
/// The difference `instant - counter` is interpreted as a signed 16-bit value.
pub fn instant_status(instant: u16, counter: u16) -> InstantStatus {
    if instant.wrapping_sub(counter) > 0x7fff {
        InstantStatus::Passed
    } else {
        InstantStatus::Pending
    }
}

/// Returns whether the event with counter `counter` is at or after `instant`.
pub fn instant_reached(instant: u16, counter: u16) -> bool {
    counter.wrapping_sub(instant) <= 0x7fff
}

/// Connection events between a procedure starting and its instant, on top of the latency.
pub(crate) const INSTANT_LOOKAHEAD: u16 = 6;

/// Computes the instant for an indication sent in event `counter`.
pub(crate) fn next_instant(conn: &Connection, counter: u16) -> u16 {
    counter
        .wrapping_add(conn.latency)
        .wrapping_add(INSTANT_LOOKAHEAD)
}

/// What the prepare step should do after the procedures had their turn.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Run the connection event.
    Continue,
    /// The connection's timing was restarted; skip this event.
    Reschedule,
}

/// Out of control PDU buffers or rx pipe space. The operation is retried later.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NoMemory;

/// The exclusive procedure occupying the `llcp` slot.
#[derive(Debug)]
pub(crate) enum Procedure {
    Idle,
    ConnUpdate(ConnUpdateProc),
    ChannelMap(ChannelMapProc),
    Encryption(EncProc),
    FeatureExchange(ExchangeProc),
    VersionExchange(ExchangeProc),
    Ping(ExchangeProc),
    PhyUpdate(PhyProc),
}

impl Procedure {
    /// Returns whether this procedure will carry an instant.
    pub fn has_instant(&self) -> bool {
        matches!(
            self,
            Procedure::ConnUpdate(_) | Procedure::ChannelMap(_) | Procedure::PhyUpdate(_)
        )
    }
}

/// A parameter change scheduled for an instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum InstantUpdate {
    ConnUpdate {
        data: ConnectionUpdateData,
        /// Whether the host asked for this update.
        local: bool,
    },
    ChannelMap {
        map: ChannelMap,
        instant: u16,
    },
    Phy {
        tx: PhySet,
        rx: PhySet,
        instant: u16,
        local: bool,
    },
}

impl InstantUpdate {
    pub fn instant(&self) -> u16 {
        match self {
            InstantUpdate::ConnUpdate { data, .. } => data.instant,
            InstantUpdate::ChannelMap { instant, .. } | InstantUpdate::Phy { instant, .. } => {
                *instant
            }
        }
    }
}

/// State of the termination procedure.
#[derive(Debug)]
pub(crate) struct TerminateProc {
    pub slot: ProcedureSlot,
    pub reason: ErrorCode,
    pub sent: bool,
}

impl TerminateProc {
    pub fn new() -> Self {
        Self {
            slot: ProcedureSlot::new(),
            reason: ErrorCode::RemoteUserTerminated,
            sent: false,
        }
    }
}

/// Ends the procedure in the `llcp` slot.
pub(crate) fn finish<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    debug!("conn {:?}: {:?} done", conn.handle, conn.procedure);
    conn.procedure = Procedure::Idle;
    conn.llcp.complete();
    conn.stop_procedure_timer();
    sh.token.release(conn.handle);
}

/// Drives the pending procedures of `conn` during the prepare step of event `counter`.
pub(crate) fn advance<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    counter: u16,
    now: Instant,
) -> Advance {
    if let Some(update) = conn.instant {
        if instant_reached(update.instant(), counter) {
            conn.instant = None;
            if apply_instant(conn, sh, update, now) == Advance::Reschedule {
                return Advance::Reschedule;
            }
        }
    }

    if conn.terminate.slot.pending() {
        if !conn.terminate.sent {
            let reason = conn.terminate.reason;
            if sh
                .send_ctrl(conn, ControlPdu::TerminateInd { error_code: reason })
                .is_ok()
            {
                conn.terminate.sent = true;
                conn.start_procedure_timer();
            }
        }
        // Nothing else starts while we're leaving.
        return Advance::Continue;
    }

    if !conn.llcp.pending() && conn.phy_req.pending() {
        conn.phy_req.complete();
        if conn.llcp.request().is_ok() {
            conn.procedure = Procedure::PhyUpdate(PhyProc::local());
        }
    }

    if conn.llcp.pending() {
        step(conn, sh, counter);
    }

    length::advance(conn, sh);

    Advance::Continue
}

/// Runs one step of the procedure in the `llcp` slot.
fn step<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, counter: u16) {
    if conn.procedure.has_instant() && sh.token.held_by_other(conn.handle) {
        trace!("conn {:?} waiting for instant token", conn.handle);
        return;
    }

    match conn.procedure {
        Procedure::Idle => {}
        Procedure::ConnUpdate(_) => conn_update::advance(conn, sh, counter),
        Procedure::ChannelMap(_) => chan_map::advance(conn, sh, counter),
        Procedure::Encryption(_) => encryption::advance(conn, sh),
        Procedure::FeatureExchange(_) | Procedure::VersionExchange(_) | Procedure::Ping(_) => {
            exchange::advance(conn, sh)
        }
        Procedure::PhyUpdate(_) => phy::advance(conn, sh, counter),
    }
}

fn apply_instant<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    update: InstantUpdate,
    now: Instant,
) -> Advance {
    match update {
        InstantUpdate::ConnUpdate { data, local } => {
            conn_update::apply(conn, sh, data, local, now);
            Advance::Reschedule
        }
        InstantUpdate::ChannelMap { map, .. } => {
            chan_map::apply(conn, sh, map);
            Advance::Continue
        }
        InstantUpdate::Phy { tx, rx, local, .. } => {
            phy::apply(conn, sh, tx, rx, local);
            Advance::Continue
        }
    }
}
