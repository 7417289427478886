//! Connection update and connection parameters request procedures.
//!
//! A central updates the connection by sending `LL_CONNECTION_UPDATE_IND` directly. A peripheral
//! asks for new parameters with `LL_CONNECTION_PARAM_REQ`, which the central answers with the
//! indication. Both sides propose transmit window offsets that avoid the radio time reserved by
//! other connections; the central picks one that is in both lists.

use super::{
    control, finish, instant_status, next_instant, InstantStatus, InstantUpdate, Procedure,
};
use crate::{
    config::Config,
    link::{
        connection::Connection,
        controller::Shared,
        features::FeatureSet,
        llcp::{ConnectionParamData, ConnectionUpdateData, ControlOpcode, ControlPdu},
        notification::Notification,
        Role, MAX_CONNECTIONS,
    },
    ticker::{Context, Executor, Job, Scheduler, TickerId},
    time::{Duration, Instant},
    ErrorCode, RequestError,
};
use heapless::Vec;

/// Connection parameters requested by the host or the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParams {
    /// Minimum connection interval, in 1.25 ms units.
    pub interval_min: u16,
    /// Maximum connection interval, in 1.25 ms units.
    pub interval_max: u16,
    /// Peripheral latency, in connection events.
    pub latency: u16,
    /// Supervision timeout, in 10 ms units.
    pub timeout: u16,
}

impl ConnParams {
    /// Checks the parameters against the ranges permitted by the Link Layer.
    pub fn validate(&self) -> Result<(), RequestError> {
        let interval_ok = (6..=3200).contains(&self.interval_min)
            && (6..=3200).contains(&self.interval_max)
            && self.interval_min <= self.interval_max;
        let timeout_ok = (10..=3200).contains(&self.timeout)
            && u32::from(self.timeout) * 4
                > (u32::from(self.latency) + 1) * u32::from(self.interval_max);

        if interval_ok && self.latency <= 499 && timeout_ok {
            Ok(())
        } else {
            Err(RequestError::InvalidParameters)
        }
    }

    /// Picks the interval to use, staying at `current` if it is acceptable.
    pub fn pick_interval(&self, current: u16) -> u16 {
        if (self.interval_min..=self.interval_max).contains(&current) {
            current
        } else {
            self.interval_max
        }
    }

    fn matches(&self, conn: &Connection) -> bool {
        self.pick_interval(conn.interval) == conn.interval
            && self.latency == conn.latency
            && self.timeout == conn.timeout
    }
}

impl From<&'_ ConnectionParamData> for ConnParams {
    fn from(data: &ConnectionParamData) -> Self {
        Self {
            interval_min: data.interval_min,
            interval_max: data.interval_max,
            latency: data.latency,
            timeout: data.timeout,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConnUpdateState {
    /// Waiting for free window offsets to be computed.
    Offsets { requested: bool },
    /// Waiting for the host to accept the peer's parameters.
    HostWait,
    /// Peripheral: send `LL_CONNECTION_PARAM_REQ`.
    SendReq,
    /// Peripheral: send `LL_CONNECTION_PARAM_RSP`.
    SendRsp,
    /// Central: send `LL_CONNECTION_UPDATE_IND`.
    SendInd,
    /// Peripheral: waiting for the central's indication.
    IndWait,
    /// Waiting for the instant.
    InstantWait,
}

#[derive(Debug)]
pub(crate) struct ConnUpdateProc {
    pub state: ConnUpdateState,
    pub params: ConnParams,
    /// Whether the host started this procedure.
    pub local: bool,
    /// Our window offsets, in 1.25 ms units relative to the anchor of event `reference`.
    pub offsets: [u16; 6],
    pub reference: u16,
    /// The peer's request, if it started the procedure.
    pub peer: Option<ConnectionParamData>,
}

impl ConnUpdateProc {
    pub fn local(params: ConnParams) -> Self {
        Self {
            state: ConnUpdateState::Offsets { requested: false },
            params,
            local: true,
            offsets: [ConnectionParamData::NO_OFFSET; 6],
            reference: 0,
            peer: None,
        }
    }
}

/// Starts a host-requested connection update.
pub(crate) fn request(conn: &mut Connection, params: ConnParams) -> Result<(), RequestError> {
    params.validate()?;
    if conn.role == Role::Peripheral && !conn.peer_supports(FeatureSet::CONN_PARAM_REQ) {
        return Err(RequestError::UnsupportedFeature);
    }
    conn.llcp.request()?;
    conn.procedure = Procedure::ConnUpdate(ConnUpdateProc::local(params));
    debug!("conn {:?}: conn update requested: {:?}", conn.handle, params);
    Ok(())
}

/// Handles the host's answer to a `ConnectionParamRequest` notification.
pub(crate) fn host_reply<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    reply: Result<ConnParams, ErrorCode>,
) -> Result<(), RequestError> {
    let p = match &mut conn.procedure {
        Procedure::ConnUpdate(p) if p.state == ConnUpdateState::HostWait => p,
        _ => return Err(RequestError::Disallowed),
    };

    match reply {
        Ok(params) => {
            params.validate()?;
            p.params = params;
            p.state = ConnUpdateState::Offsets { requested: false };
        }
        Err(code) => {
            control::reject(conn, sh, ControlOpcode::ConnectionParamReq, code)
                .map_err(|_| RequestError::NoMemory)?;
            finish(conn, sh);
        }
    }
    Ok(())
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, counter: u16) {
    let state = match &conn.procedure {
        Procedure::ConnUpdate(p) => p.state,
        _ => return,
    };

    match state {
        ConnUpdateState::Offsets { requested: false } => {
            set_state(conn, ConnUpdateState::Offsets { requested: true });
            let job = Job::WindowOffsets(conn.handle);
            if sh.executor.enqueue(Context::Worker, Context::Job, job).is_err() {
                trace!("executor full, computing window offsets inline");
                window_offsets(conn, sh);
            }
        }
        ConnUpdateState::SendReq | ConnUpdateState::SendRsp => {
            let data = match &conn.procedure {
                Procedure::ConnUpdate(p) => param_data(p),
                _ => return,
            };
            let pdu = if state == ConnUpdateState::SendReq {
                ControlPdu::ConnectionParamReq(data)
            } else {
                ControlPdu::ConnectionParamRsp(data)
            };
            if sh.send_ctrl(conn, pdu).is_ok() {
                set_state(conn, ConnUpdateState::IndWait);
                conn.start_procedure_timer();
            }
        }
        ConnUpdateState::SendInd => {
            if !sh.token.acquire(conn.handle) {
                return;
            }
            let instant = next_instant(conn, counter);
            let (data, local) = match &conn.procedure {
                Procedure::ConnUpdate(p) => (update_data(conn, p, instant), p.local),
                _ => return,
            };
            if sh
                .send_ctrl(conn, ControlPdu::ConnectionUpdateInd(data))
                .is_ok()
            {
                conn.instant = Some(InstantUpdate::ConnUpdate { data, local });
                set_state(conn, ConnUpdateState::InstantWait);
            }
        }
        ConnUpdateState::Offsets { requested: true }
        | ConnUpdateState::HostWait
        | ConnUpdateState::IndWait
        | ConnUpdateState::InstantWait => {}
    }
}

fn set_state(conn: &mut Connection, state: ConnUpdateState) {
    if let Procedure::ConnUpdate(p) = &mut conn.procedure {
        debug!("conn {:?}: conn update {:?} -> {:?}", conn.handle, p.state, state);
        p.state = state;
    }
}

fn param_data(p: &ConnUpdateProc) -> ConnectionParamData {
    ConnectionParamData {
        interval_min: p.params.interval_min,
        interval_max: p.params.interval_max,
        latency: p.params.latency,
        timeout: p.params.timeout,
        preferred_periodicity: 0,
        reference_conn_event_count: p.reference,
        offsets: p.offsets,
    }
}

/// Builds the central's indication for the given instant.
fn update_data(conn: &Connection, p: &ConnUpdateProc, instant: u16) -> ConnectionUpdateData {
    let interval = p.params.pick_interval(conn.interval);
    let chosen = match p.offsets[0] {
        ConnectionParamData::NO_OFFSET => 0,
        offset => offset,
    };
    ConnectionUpdateData {
        win_size: 1,
        win_offset: rebase(
            chosen,
            p.reference,
            instant,
            conn.interval().as_micros(),
            u32::from(interval) * 1250,
        ),
        interval,
        latency: p.params.latency,
        timeout: p.params.timeout,
        instant,
    }
}

/// Converts a window offset relative to the anchor of event `from` into one relative to the
/// anchor of event `to`, modulo the new interval.
fn rebase(offset: u16, from: u16, to: u16, old_interval_us: u32, new_interval_us: u32) -> u16 {
    let events = i64::from(from.wrapping_sub(to) as i16);
    let phase = i64::from(offset) * 1250 + events * i64::from(old_interval_us);
    (phase.rem_euclid(i64::from(new_interval_us)) / 1250) as u16
}

/// Collects the other connections' radio reservations and computes our window offsets.
///
/// Runs as the `WindowOffsets` job, or inline when the executor is full.
pub(crate) fn window_offsets<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let interval = match &conn.procedure {
        Procedure::ConnUpdate(p) if p.state == ConnUpdateState::Offsets { requested: true } => {
            p.params.pick_interval(conn.interval)
        }
        _ => return,
    };

    let anchor = conn.anchor;
    let interval_us = u32::from(interval) * 1250;
    let mut busy = Vec::<(u32, u32), { MAX_CONNECTIONS * 2 }>::new();
    sh.scheduler
        .reservations(TickerId::Connection(conn.handle), &mut |r| {
            let phase = i64::from(r.next.raw_micros().wrapping_sub(anchor.raw_micros()) as i32)
                .rem_euclid(i64::from(interval_us)) as u32;
            if busy.push((phase, r.len.as_micros())).is_err() {
                trace!("too many reservations, ignoring {:?}", r);
            }
        });
    let offsets = free_offsets(&busy, interval_us, conn.slot());

    let role = conn.role;
    let reference = conn.anchor_counter;
    let old_interval_us = conn.interval().as_micros();
    let next = match &mut conn.procedure {
        Procedure::ConnUpdate(p) => {
            p.offsets = offsets;
            p.reference = reference;
            match (role, p.peer) {
                (Role::Central, None) => Some(ConnUpdateState::SendInd),
                (Role::Central, Some(peer)) => {
                    intersect(p, &peer, old_interval_us, interval_us).map(|offset| {
                        p.offsets = [ConnectionParamData::NO_OFFSET; 6];
                        p.offsets[0] = offset;
                        ConnUpdateState::SendInd
                    })
                }
                (Role::Peripheral, None) => Some(ConnUpdateState::SendReq),
                (Role::Peripheral, Some(_)) => Some(ConnUpdateState::SendRsp),
            }
        }
        _ => return,
    };

    match next {
        Some(state) => set_state(conn, state),
        None => {
            debug!("no common window offset with peer");
            let reject = control::reject(
                conn,
                sh,
                ControlOpcode::ConnectionParamReq,
                ErrorCode::UnsupportedLlParameterValue,
            );
            if reject.is_ok() {
                finish(conn, sh);
            } else {
                // retried on the next event
                set_state(conn, ConnUpdateState::Offsets { requested: false });
            }
        }
    }
}

/// Returns the first 6 window offsets (in 1.25 ms units) not overlapping a busy range.
fn free_offsets(busy: &[(u32, u32)], interval_us: u32, own_len: Duration) -> [u16; 6] {
    let mut offsets = [ConnectionParamData::NO_OFFSET; 6];
    let mut found = 0;
    for unit in 0..interval_us / 1250 {
        let candidate = unit * 1250;
        let free = busy.iter().all(|&(phase, len)| {
            let ahead = (phase + interval_us - candidate) % interval_us;
            let behind = (candidate + interval_us - phase) % interval_us;
            ahead >= own_len.as_micros() && behind >= len
        });
        if free {
            offsets[found] = unit as u16;
            found += 1;
            if found == offsets.len() {
                break;
            }
        }
    }
    if found == 0 {
        offsets[0] = 0;
    }
    offsets
}

/// Finds the peer's most preferred offset that is also one of ours, relative to our reference.
fn intersect(
    p: &ConnUpdateProc,
    peer: &ConnectionParamData,
    old_interval_us: u32,
    new_interval_us: u32,
) -> Option<u16> {
    let ours = || {
        p.offsets
            .iter()
            .cloned()
            .filter(|&o| o != ConnectionParamData::NO_OFFSET)
    };

    if peer.valid_offsets().next().is_none() {
        return ours().next();
    }

    peer.valid_offsets()
        .map(|o| {
            rebase(
                o,
                peer.reference_conn_event_count,
                p.reference,
                old_interval_us,
                new_interval_us,
            )
        })
        .find(|o| ours().any(|mine| mine == *o))
}

/// Handles `LL_CONNECTION_PARAM_REQ`. Returns `false` if the PDU must be received again later.
pub(crate) fn rx_param_req<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    data: ConnectionParamData,
) -> bool {
    let params = ConnParams::from(&data);
    if params.validate().is_err() {
        debug!("peer requested invalid parameters: {:?}", params);
        // Cannot fail: `control::rx` checked for a free control buffer.
        let _ = control::reject(
            conn,
            sh,
            ControlOpcode::ConnectionParamReq,
            ErrorCode::InvalidLlParameters,
        );
        return true;
    }

    if conn.role == Role::Central && sh.token.held_by_other(conn.handle) {
        return false;
    }

    let local = match &conn.procedure {
        Procedure::Idle => {
            if conn.llcp.request().is_err() {
                return false;
            }
            false
        }
        Procedure::ConnUpdate(p) if conn.role == Role::Peripheral => {
            // The central wins; answer its request instead of ours.
            p.local
        }
        Procedure::ConnUpdate(_) => {
            // Cannot fail, see above.
            let _ = control::reject(
                conn,
                sh,
                ControlOpcode::ConnectionParamReq,
                ErrorCode::LlProcedureCollision,
            );
            return true;
        }
        _ => {
            // Cannot fail, see above.
            let _ = control::reject(
                conn,
                sh,
                ControlOpcode::ConnectionParamReq,
                ErrorCode::DifferentTransactionCollision,
            );
            return true;
        }
    };

    let state = if params.matches(conn) {
        ConnUpdateState::Offsets { requested: false }
    } else {
        let _ = sh.notify(
            conn.handle,
            Notification::ConnectionParamRequest {
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                latency: params.latency,
                timeout: params.timeout,
            },
        );
        ConnUpdateState::HostWait
    };

    conn.procedure = Procedure::ConnUpdate(ConnUpdateProc {
        state,
        params,
        local,
        offsets: [ConnectionParamData::NO_OFFSET; 6],
        reference: 0,
        peer: Some(data),
    });
    true
}

/// Handles `LL_CONNECTION_UPDATE_IND`.
pub(crate) fn rx_update_ind<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    data: ConnectionUpdateData,
) {
    if conn.role == Role::Central {
        control::unknown_rsp(conn, sh, ControlOpcode::ConnectionUpdateInd);
        return;
    }

    if instant_status(data.instant, conn.event_counter) == InstantStatus::Passed {
        conn.terminate_with(ErrorCode::InstantPassed);
        return;
    }

    let local = match &mut conn.procedure {
        Procedure::ConnUpdate(p) => {
            p.state = ConnUpdateState::InstantWait;
            p.local
        }
        _ => false,
    };
    if local {
        conn.stop_procedure_timer();
    }
    conn.instant = Some(InstantUpdate::ConnUpdate { data, local });
}

/// Handles a rejection of our `LL_CONNECTION_PARAM_REQ`.
pub(crate) fn rejected<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, status: ErrorCode) {
    let local = match &conn.procedure {
        Procedure::ConnUpdate(p) => p.local,
        _ => return,
    };
    if status == ErrorCode::UnsupportedRemoteFeature {
        conn.features_used.remove(FeatureSet::CONN_PARAM_REQ);
    }
    if local {
        let _ = sh.notify(conn.handle, update_complete(conn, status));
    }
    finish(conn, sh);
}

/// Switches to the new parameters at the instant.
pub(crate) fn apply<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    data: ConnectionUpdateData,
    local: bool,
    now: Instant,
) {
    let changed = data.interval != conn.interval
        || data.latency != conn.latency
        || data.timeout != conn.timeout;
    debug!("conn {:?}: new parameters at {}: {:?}", conn.handle, data.instant, data);

    conn.interval = data.interval;
    conn.latency = data.latency;
    conn.timeout = data.timeout;
    conn.reload_timers(sh.settings.sca.ppm());

    let id = TickerId::Connection(conn.handle);
    sh.scheduler.stop(id);
    // The transmit window opens 1.25 ms plus the window offset after the old anchor.
    let first = Duration::from_micros(1250) + data.win_offset();
    sh.scheduler
        .start(id, now, first, conn.interval(), conn.slot(), true);
    if conn.role == Role::Peripheral {
        conn.widening.window_size_prepare_us = data.win_size().as_micros();
    }
    conn.event_counter = data.instant;
    conn.latency_prepare = 0;

    if local || changed {
        let event = update_complete(conn, ErrorCode::Success);
        if sh.notify(conn.handle, event).is_err() {
            trace!("dropping {:?}", event);
        }
    }

    if let Procedure::ConnUpdate(_) = conn.procedure {
        finish(conn, sh);
    } else {
        sh.token.release(conn.handle);
    }
}

fn update_complete(conn: &Connection, status: ErrorCode) -> Notification {
    Notification::ConnectionUpdateComplete {
        status,
        interval: conn.interval,
        latency: conn.latency,
        timeout: conn.timeout,
    }
}
