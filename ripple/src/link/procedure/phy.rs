//! PHY update procedure.
//!
//! Either side may ask for new PHYs with `LL_PHY_REQ`. The central resolves both sides'
//! preferences and announces the result with `LL_PHY_UPDATE_IND`, which takes effect at an
//! instant.

use super::{
    control, finish, instant_status, next_instant, InstantStatus, InstantUpdate, Procedure,
};
use crate::{
    config::Config,
    link::{
        connection::Connection,
        controller::Shared,
        features::FeatureSet,
        llcp::{ControlOpcode, ControlPdu},
        notification::Notification,
        Role,
    },
    phy::{Phy, PhySet},
    ErrorCode, RequestError,
};

/// PHYs of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhyState {
    /// PHY we transmit on.
    pub tx: Phy,
    /// PHY we receive on.
    pub rx: Phy,
    /// PHYs the host would like to use.
    pub pref_tx: PhySet,
    pub pref_rx: PhySet,
}

impl PhyState {
    /// Every connection starts out on LE 1M.
    pub fn new(pref_tx: PhySet, pref_rx: PhySet) -> Self {
        Self {
            tx: Phy::Le1M,
            rx: Phy::Le1M,
            pref_tx,
            pref_rx,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PhyStep {
    /// Send `LL_PHY_REQ`.
    SendReq,
    /// Central: waiting for `LL_PHY_RSP`.
    RspWait,
    /// Central: send `LL_PHY_UPDATE_IND`.
    SendInd,
    /// Peripheral: waiting for `LL_PHY_UPDATE_IND`.
    IndWait,
    /// Waiting for the instant.
    InstantWait,
}

#[derive(Debug)]
pub(crate) struct PhyProc {
    pub step: PhyStep,
    /// Whether the host started this procedure.
    pub local: bool,
    /// Resolved PHY for central to peripheral packets. Empty means unchanged.
    pub c_to_p: PhySet,
    /// Resolved PHY for peripheral to central packets. Empty means unchanged.
    pub p_to_c: PhySet,
}

impl PhyProc {
    pub fn local() -> Self {
        Self {
            step: PhyStep::SendReq,
            local: true,
            c_to_p: PhySet::empty(),
            p_to_c: PhySet::empty(),
        }
    }
}

fn supported_phys(features: FeatureSet) -> PhySet {
    let mut set = PhySet::LE_1M;
    if features.contains(FeatureSet::LE_2M_PHY) {
        set |= PhySet::LE_2M;
    }
    if features.contains(FeatureSet::LE_CODED_PHY) {
        set |= PhySet::LE_CODED;
    }
    set
}

/// Records the host's preferred PHYs and schedules a PHY update.
pub(crate) fn request(
    conn: &mut Connection,
    tx: PhySet,
    rx: PhySet,
) -> Result<(), RequestError> {
    if tx.is_empty() || rx.is_empty() {
        return Err(RequestError::InvalidParameters);
    }
    if !conn.peer_supports(FeatureSet::LE_2M_PHY)
        && !conn.peer_supports(FeatureSet::LE_CODED_PHY)
    {
        return Err(RequestError::UnsupportedFeature);
    }
    conn.phy_req.request()?;
    conn.phy.pref_tx = tx;
    conn.phy.pref_rx = rx;
    Ok(())
}

/// Picks the PHY to use from what both sides accept, or an empty set if nothing changes.
fn resolve(ours: PhySet, theirs: PhySet, current: Phy) -> PhySet {
    let chosen = (ours & theirs).select();
    if chosen.single() == Some(current) {
        PhySet::empty()
    } else {
        chosen
    }
}

/// Central: resolves the PHYs from our preferences and the peer's.
fn resolve_central(conn: &mut Connection, peer_tx: PhySet, peer_rx: PhySet) {
    let supported = supported_phys(conn.features_used);
    let c_to_p = resolve(conn.phy.pref_tx & supported, peer_rx, conn.phy.tx);
    let p_to_c = resolve(conn.phy.pref_rx & supported, peer_tx, conn.phy.rx);
    if let Procedure::PhyUpdate(p) = &mut conn.procedure {
        p.c_to_p = c_to_p;
        p.p_to_c = p_to_c;
        p.step = PhyStep::SendInd;
    }
}

fn set_step(conn: &mut Connection, step: PhyStep) {
    if let Procedure::PhyUpdate(p) = &mut conn.procedure {
        debug!("conn {:?}: phy update {:?} -> {:?}", conn.handle, p.step, step);
        p.step = step;
    }
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, counter: u16) {
    let (step, local, c_to_p, p_to_c) = match &conn.procedure {
        Procedure::PhyUpdate(p) => (p.step, p.local, p.c_to_p, p.p_to_c),
        _ => return,
    };

    match step {
        PhyStep::SendReq => {
            let pdu = ControlPdu::PhyReq {
                tx_phys: conn.phy.pref_tx,
                rx_phys: conn.phy.pref_rx,
            };
            if sh.send_ctrl(conn, pdu).is_ok() {
                let next = match conn.role {
                    Role::Central => PhyStep::RspWait,
                    Role::Peripheral => PhyStep::IndWait,
                };
                set_step(conn, next);
                conn.start_procedure_timer();
            }
        }
        PhyStep::SendInd => {
            if c_to_p.is_empty() && p_to_c.is_empty() {
                // Nothing changes; tell the peer without an instant.
                let pdu = ControlPdu::PhyUpdateInd {
                    c_to_p_phy: c_to_p,
                    p_to_c_phy: p_to_c,
                    instant: 0,
                };
                if sh.send_ctrl(conn, pdu).is_ok() {
                    if local {
                        let _ = sh.notify(conn.handle, complete(conn, ErrorCode::Success));
                    }
                    finish(conn, sh);
                }
                return;
            }

            if !sh.token.acquire(conn.handle) {
                return;
            }
            let instant = next_instant(conn, counter);
            let pdu = ControlPdu::PhyUpdateInd {
                c_to_p_phy: c_to_p,
                p_to_c_phy: p_to_c,
                instant,
            };
            if sh.send_ctrl(conn, pdu).is_ok() {
                conn.instant = Some(InstantUpdate::Phy {
                    tx: c_to_p,
                    rx: p_to_c,
                    instant,
                    local,
                });
                set_step(conn, PhyStep::InstantWait);
                conn.stop_procedure_timer();
            }
        }
        PhyStep::RspWait | PhyStep::IndWait | PhyStep::InstantWait => {}
    }
}

/// Handles `LL_PHY_REQ`. Returns `false` if the PDU must be received again later.
pub(crate) fn rx_req<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    peer_tx: PhySet,
    peer_rx: PhySet,
) -> bool {
    match (&conn.procedure, conn.role) {
        (Procedure::Idle, _) => {
            if conn.llcp.request().is_err() {
                return false;
            }
            conn.procedure = Procedure::PhyUpdate(PhyProc {
                local: false,
                ..PhyProc::local()
            });
        }
        (Procedure::PhyUpdate(p), Role::Central) if p.step == PhyStep::SendInd => {
            // Already resolved; the peer will get the indication.
            return true;
        }
        (Procedure::PhyUpdate(_), Role::Central) => {
            let _ = control::reject(
                conn,
                sh,
                ControlOpcode::PhyReq,
                ErrorCode::LlProcedureCollision,
            );
            return true;
        }
        (Procedure::PhyUpdate(_), Role::Peripheral) => {
            // The central's request wins; ours is answered by its indication.
        }
        _ => {
            let _ = control::reject(
                conn,
                sh,
                ControlOpcode::PhyReq,
                ErrorCode::DifferentTransactionCollision,
            );
            return true;
        }
    }

    match conn.role {
        Role::Central => resolve_central(conn, peer_tx, peer_rx),
        Role::Peripheral => {
            let supported = supported_phys(sh.settings.features);
            let pdu = ControlPdu::PhyRsp {
                tx_phys: conn.phy.pref_tx & supported,
                rx_phys: conn.phy.pref_rx & supported,
            };
            if sh.send_ctrl(conn, pdu).is_err() {
                return true;
            }
            set_step(conn, PhyStep::IndWait);
            conn.start_procedure_timer();
        }
    }
    true
}

/// Handles `LL_PHY_RSP`.
pub(crate) fn rx_rsp<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    peer_tx: PhySet,
    peer_rx: PhySet,
) {
    let waiting = match &conn.procedure {
        Procedure::PhyUpdate(p) => p.step == PhyStep::RspWait,
        _ => false,
    };
    if conn.role == Role::Peripheral || !waiting {
        control::unknown_rsp(conn, sh, ControlOpcode::PhyRsp);
        return;
    }
    resolve_central(conn, peer_tx, peer_rx);
}

/// Handles `LL_PHY_UPDATE_IND`.
pub(crate) fn rx_update_ind<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    c_to_p: PhySet,
    p_to_c: PhySet,
    instant: u16,
) {
    if conn.role == Role::Central {
        control::unknown_rsp(conn, sh, ControlOpcode::PhyUpdateInd);
        return;
    }

    let local = match &conn.procedure {
        Procedure::PhyUpdate(p) => p.local,
        _ => false,
    };

    if c_to_p.is_empty() && p_to_c.is_empty() {
        if let Procedure::PhyUpdate(_) = conn.procedure {
            if local {
                let _ = sh.notify(conn.handle, complete(conn, ErrorCode::Success));
            }
            finish(conn, sh);
        }
        return;
    }

    if instant_status(instant, conn.event_counter) == InstantStatus::Passed {
        conn.terminate_with(ErrorCode::InstantPassed);
        return;
    }

    set_step(conn, PhyStep::InstantWait);
    conn.stop_procedure_timer();
    conn.instant = Some(InstantUpdate::Phy {
        tx: p_to_c,
        rx: c_to_p,
        instant,
        local,
    });
}

/// Switches PHYs at the instant. `tx` and `rx` are from our point of view; empty sets keep the
/// current PHY.
pub(crate) fn apply<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    tx: PhySet,
    rx: PhySet,
    local: bool,
) {
    let before = (conn.phy.tx, conn.phy.rx);
    if let Some(phy) = tx.single() {
        conn.phy.tx = phy;
    }
    if let Some(phy) = rx.single() {
        conn.phy.rx = phy;
    }
    debug!("conn {:?}: phy {:?} -> {:?}", conn.handle, before, (conn.phy.tx, conn.phy.rx));

    if local || before != (conn.phy.tx, conn.phy.rx) {
        let _ = sh.notify(conn.handle, complete(conn, ErrorCode::Success));
    }
    if let Procedure::PhyUpdate(_) = conn.procedure {
        finish(conn, sh);
    } else {
        sh.token.release(conn.handle);
    }
}

/// The peer rejected or does not know our `LL_PHY_REQ`.
pub(crate) fn rejected<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, status: ErrorCode) {
    let local = match &conn.procedure {
        Procedure::PhyUpdate(p) => p.local,
        _ => return,
    };
    if status == ErrorCode::UnsupportedRemoteFeature {
        conn.features_used
            .remove(FeatureSet::LE_2M_PHY | FeatureSet::LE_CODED_PHY);
    }
    if local {
        let _ = sh.notify(conn.handle, complete(conn, status));
    }
    finish(conn, sh);
}

fn complete(conn: &Connection, status: ErrorCode) -> Notification {
    Notification::PhyUpdateComplete {
        status,
        tx: conn.phy.tx,
        rx: conn.phy.rx,
    }
}
