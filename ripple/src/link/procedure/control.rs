//! Dispatch of received and acknowledged control PDUs.

use super::{chan_map, conn_update, encryption, exchange, length, phy, NoMemory, Procedure};
use crate::{
    config::Config,
    link::{
        connection::Connection,
        controller::Shared,
        features::FeatureSet,
        llcp::{ControlOpcode, ControlPdu},
    },
    ErrorCode,
};

/// Processes a control PDU received on `conn`.
///
/// Returns `false` when the PDU cannot be processed right now. It is then not acknowledged and
/// the peer sends it again.
pub(crate) fn rx<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, payload: &[u8]) -> bool {
    // Every response needs at most one buffer and one notification slot; make sure they're there
    // before touching any state.
    if sh.ctrl_pool.free_count() == 0 || !sh.can_notify() {
        trace!("conn {:?}: no room for control PDU, nacking", conn.handle);
        return false;
    }

    let pdu = match ControlPdu::parse(payload) {
        Ok(pdu) => pdu,
        Err(e) => {
            let opcode = ControlOpcode::from(payload.first().cloned().unwrap_or(0));
            warn!("conn {:?}: malformed {:?}: {}", conn.handle, opcode, e);
            unknown_rsp(conn, sh, opcode);
            return true;
        }
    };
    info!("LLCP<- {:?}", pdu);

    match pdu {
        ControlPdu::ConnectionUpdateInd(data) => conn_update::rx_update_ind(conn, sh, data),
        ControlPdu::ChannelMapInd { map, instant } => chan_map::rx_ind(conn, sh, map, instant),
        ControlPdu::TerminateInd { error_code } => conn.terminate_with(error_code),
        ControlPdu::EncReq {
            rand,
            ediv,
            skd_m,
            iv_m,
        } => encryption::rx_enc_req(conn, sh, rand.0, ediv.0, skd_m.0, iv_m.0),
        ControlPdu::EncRsp { skd_s, iv_s } => encryption::rx_enc_rsp(conn, sh, skd_s.0, iv_s.0),
        ControlPdu::StartEncReq => encryption::rx_start_enc_req(conn, sh),
        ControlPdu::StartEncRsp => encryption::rx_start_enc_rsp(conn, sh),
        ControlPdu::PauseEncReq => encryption::rx_pause_enc_req(conn, sh),
        ControlPdu::PauseEncRsp => encryption::rx_pause_enc_rsp(conn, sh),
        ControlPdu::UnknownRsp { unknown_type } => rejected(
            conn,
            sh,
            Some(unknown_type),
            ErrorCode::UnsupportedRemoteFeature,
        ),
        ControlPdu::FeatureReq {
            features_central: features,
        }
        | ControlPdu::PeripheralFeatureReq {
            features_peripheral: features,
        } => exchange::rx_feature_req(conn, sh, pdu.opcode(), features),
        ControlPdu::FeatureRsp { features_used } => {
            exchange::rx_feature_rsp(conn, sh, features_used)
        }
        ControlPdu::VersionInd {
            vers_nr,
            comp_id,
            sub_vers_nr,
        } => exchange::rx_version_ind(conn, sh, vers_nr, comp_id, sub_vers_nr),
        ControlPdu::RejectInd { error_code } => rejected(conn, sh, None, error_code),
        ControlPdu::RejectExtInd {
            reject_opcode,
            error_code,
        } => rejected(conn, sh, Some(reject_opcode), error_code),
        ControlPdu::ConnectionParamReq(data) => {
            return conn_update::rx_param_req(conn, sh, data);
        }
        ControlPdu::ConnectionParamRsp(_) => {
            // We never send `LL_CONNECTION_PARAM_REQ` as a central.
            unknown_rsp(conn, sh, ControlOpcode::ConnectionParamRsp);
        }
        ControlPdu::PingReq => {
            let _ = sh.send_ctrl(conn, ControlPdu::PingRsp);
        }
        ControlPdu::PingRsp => exchange::rx_ping_rsp(conn, sh),
        ControlPdu::LengthReq(data) => length::rx_req(conn, sh, data),
        ControlPdu::LengthRsp(data) => length::rx_rsp(conn, sh, data),
        ControlPdu::PhyReq { tx_phys, rx_phys } => {
            return phy::rx_req(conn, sh, tx_phys, rx_phys);
        }
        ControlPdu::PhyRsp { tx_phys, rx_phys } => phy::rx_rsp(conn, sh, tx_phys, rx_phys),
        ControlPdu::PhyUpdateInd {
            c_to_p_phy,
            p_to_c_phy,
            instant,
        } => phy::rx_update_ind(conn, sh, c_to_p_phy, p_to_c_phy, instant),
        ControlPdu::Unknown { opcode, .. } => unknown_rsp(conn, sh, opcode),
    }
    true
}

/// The peer did not accept the PDU with `opcode` (or our running procedure, if `None`).
fn rejected<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    opcode: Option<ControlOpcode>,
    status: ErrorCode,
) {
    use self::ControlOpcode::*;

    if opcode == Some(LengthReq) {
        length::rejected(conn);
        return;
    }

    let ours = match (&conn.procedure, opcode) {
        (Procedure::ConnUpdate(_), None)
        | (Procedure::ConnUpdate(_), Some(ConnectionParamReq))
        | (Procedure::ConnUpdate(_), Some(ConnectionUpdateInd))
        | (Procedure::Encryption(_), None)
        | (Procedure::Encryption(_), Some(EncReq))
        | (Procedure::Encryption(_), Some(PauseEncReq))
        | (Procedure::PhyUpdate(_), None)
        | (Procedure::PhyUpdate(_), Some(PhyReq))
        | (Procedure::PhyUpdate(_), Some(PhyUpdateInd))
        | (Procedure::FeatureExchange(_), Some(FeatureReq))
        | (Procedure::FeatureExchange(_), Some(PeripheralFeatureReq))
        | (Procedure::VersionExchange(_), Some(VersionInd))
        | (Procedure::Ping(_), Some(PingReq)) => true,
        _ => false,
    };
    if !ours {
        debug!("conn {:?}: ignoring rejection of {:?}", conn.handle, opcode);
        return;
    }

    match conn.procedure {
        Procedure::ConnUpdate(_) => conn_update::rejected(conn, sh, status),
        Procedure::Encryption(_) => encryption::rejected(conn, sh, status),
        Procedure::PhyUpdate(_) => phy::rejected(conn, sh, status),
        Procedure::FeatureExchange(_) | Procedure::VersionExchange(_) | Procedure::Ping(_) => {
            exchange::rejected(conn, sh, status)
        }
        Procedure::ChannelMap(_) | Procedure::Idle => {}
    }
}

/// Called when the peer acknowledged one of our control PDUs.
pub(crate) fn acked<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    opcode: Option<ControlOpcode>,
) {
    match opcode {
        Some(ControlOpcode::TerminateInd) => {
            let reason = match conn.terminate.reason {
                ErrorCode::RemoteUserTerminated => ErrorCode::LocalHostTerminated,
                other => other,
            };
            conn.terminate_with(reason);
        }
        Some(ControlOpcode::EncReq) => encryption::enc_req_acked(conn),
        Some(ControlOpcode::PauseEncRsp) => encryption::pause_enc_rsp_acked(conn, sh),
        _ => {}
    }
}

/// Rejects a procedure the peer started, using `LL_REJECT_EXT_IND` if the peer understands it.
pub(crate) fn reject<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    opcode: ControlOpcode,
    code: ErrorCode,
) -> Result<(), NoMemory> {
    let pdu = if conn.peer_supports(FeatureSet::EXTENDED_REJECT_INDICATION) {
        ControlPdu::RejectExtInd {
            reject_opcode: opcode,
            error_code: code,
        }
    } else {
        ControlPdu::RejectInd { error_code: code }
    };
    sh.send_ctrl(conn, pdu)
}

/// Answers a PDU we don't support (or that is invalid in our role) with `LL_UNKNOWN_RSP`.
pub(crate) fn unknown_rsp<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    opcode: ControlOpcode,
) {
    if sh
        .send_ctrl(conn, ControlPdu::UnknownRsp { unknown_type: opcode })
        .is_err()
    {
        trace!("conn {:?}: no buffer for LL_UNKNOWN_RSP", conn.handle);
    }
}
