//! Feature exchange, version exchange and LE ping.
//!
//! These are simple request/response procedures without an instant. Requests from the peer are
//! answered right away, without occupying the `llcp` slot.

use super::{finish, Procedure};
use crate::{
    config::Config,
    link::{
        connection::{Connection, PeerVersion},
        controller::Shared,
        features::FeatureSet,
        llcp::{ControlOpcode, ControlPdu, VersionNumber},
        notification::Notification,
        Role,
    },
    utils::Hex,
    ErrorCode, RequestError, BLUETOOTH_VERSION,
};

#[derive(Debug)]
pub(crate) struct ExchangeProc {
    /// Whether our request was queued.
    pub sent: bool,
}

impl ExchangeProc {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

/// Starts a feature exchange.
pub(crate) fn request_features(conn: &mut Connection) -> Result<(), RequestError> {
    if conn.role == Role::Peripheral && !conn.peer_supports(FeatureSet::PERIPHERAL_FEATURE_EXCHANGE)
    {
        return Err(RequestError::UnsupportedFeature);
    }
    conn.llcp.request()?;
    conn.procedure = Procedure::FeatureExchange(ExchangeProc::new());
    Ok(())
}

/// Starts a version exchange.
///
/// Versions are only exchanged once per connection. If we already know the peer's, the
/// completion is reported right away.
pub(crate) fn request_version<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
) -> Result<(), RequestError> {
    if let (true, Some(peer)) = (conn.version_sent, conn.peer_version) {
        if conn.llcp.pending() {
            return Err(RequestError::Busy);
        }
        return sh
            .notify(conn.handle, version_complete(peer))
            .map_err(|_| RequestError::NoMemory);
    }
    conn.llcp.request()?;
    conn.procedure = Procedure::VersionExchange(ExchangeProc::new());
    Ok(())
}

/// Starts an `LL_PING_REQ` exchange if the slot is free.
pub(crate) fn start_ping(conn: &mut Connection) {
    if conn.llcp.request().is_ok() {
        debug!("conn {:?}: authenticated payload timeout close, pinging", conn.handle);
        conn.procedure = Procedure::Ping(ExchangeProc::new());
    }
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let pdu = match &conn.procedure {
        Procedure::FeatureExchange(p) if !p.sent => match conn.role {
            Role::Central => ControlPdu::FeatureReq {
                features_central: sh.settings.features,
            },
            Role::Peripheral => ControlPdu::PeripheralFeatureReq {
                features_peripheral: sh.settings.features,
            },
        },
        Procedure::VersionExchange(p) if !p.sent => {
            if conn.version_sent {
                // We answered the peer's indication in the meantime; just wait for it.
                mark_sent(conn);
                return;
            }
            version_ind(sh)
        }
        Procedure::Ping(p) if !p.sent => ControlPdu::PingReq,
        _ => return,
    };

    if sh.send_ctrl(conn, pdu).is_ok() {
        if pdu.opcode() == ControlOpcode::VersionInd {
            conn.version_sent = true;
        }
        mark_sent(conn);
        conn.start_procedure_timer();
    }
}

fn mark_sent(conn: &mut Connection) {
    match &mut conn.procedure {
        Procedure::FeatureExchange(p) | Procedure::VersionExchange(p) | Procedure::Ping(p) => {
            p.sent = true
        }
        _ => {}
    }
}

fn version_ind<C: Config>(sh: &Shared<C>) -> ControlPdu<'static> {
    ControlPdu::VersionInd {
        vers_nr: BLUETOOTH_VERSION,
        comp_id: Hex(sh.settings.company_id),
        sub_vers_nr: Hex(sh.settings.sub_version),
    }
}

fn version_complete(peer: PeerVersion) -> Notification {
    Notification::VersionExchangeComplete {
        status: ErrorCode::Success,
        version: peer.version,
        company_id: peer.company_id,
        sub_version: peer.sub_version,
    }
}

/// Handles `LL_FEATURE_REQ` and `LL_PERIPHERAL_FEATURE_REQ`.
pub(crate) fn rx_feature_req<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    opcode: ControlOpcode,
    features: FeatureSet,
) {
    let valid = match conn.role {
        Role::Central => opcode == ControlOpcode::PeripheralFeatureReq,
        Role::Peripheral => opcode == ControlOpcode::FeatureReq,
    };
    if !valid {
        super::control::unknown_rsp(conn, sh, opcode);
        return;
    }

    let ours = sh.settings.features;
    conn.features_used = ours.negotiate(features);
    // Octet 0 of the response is our own feature set, the rest is what both of us support.
    let rsp = FeatureSet::from_bits_truncate(
        (ours.bits() & 0xff) | (conn.features_used.bits() & !0xff),
    );
    let _ = sh.send_ctrl(conn, ControlPdu::FeatureRsp { features_used: rsp });
}

/// Handles `LL_FEATURE_RSP`.
pub(crate) fn rx_feature_rsp<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    features: FeatureSet,
) {
    conn.features_used = sh.settings.features.negotiate(features);
    if let Procedure::FeatureExchange(_) = conn.procedure {
        let _ = sh.notify(
            conn.handle,
            Notification::FeatureExchangeComplete {
                status: ErrorCode::Success,
                features: conn.features_used,
            },
        );
        finish(conn, sh);
    }
}

/// Handles `LL_VERSION_IND`.
pub(crate) fn rx_version_ind<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    version: VersionNumber,
    company_id: Hex<u16>,
    sub_version: Hex<u16>,
) {
    let peer = PeerVersion {
        version,
        company_id,
        sub_version,
    };
    conn.peer_version = Some(peer);

    if !conn.version_sent {
        let ind = version_ind(sh);
        if sh.send_ctrl(conn, ind).is_err() {
            return;
        }
        conn.version_sent = true;
    }

    if let Procedure::VersionExchange(_) = conn.procedure {
        let _ = sh.notify(conn.handle, version_complete(peer));
        finish(conn, sh);
    }
}

/// Handles `LL_PING_RSP`.
pub(crate) fn rx_ping_rsp<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if let Procedure::Ping(_) = conn.procedure {
        finish(conn, sh);
    }
}

/// The peer does not support our request.
pub(crate) fn rejected<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, status: ErrorCode) {
    match conn.procedure {
        Procedure::FeatureExchange(_) => {
            if conn.role == Role::Peripheral {
                conn.features_used
                    .remove(FeatureSet::PERIPHERAL_FEATURE_EXCHANGE);
            }
            let _ = sh.notify(
                conn.handle,
                Notification::FeatureExchangeComplete {
                    status,
                    features: conn.features_used,
                },
            );
        }
        Procedure::VersionExchange(_) => {
            let _ = sh.notify(
                conn.handle,
                Notification::VersionExchangeComplete {
                    status,
                    version: VersionNumber::Unknown(0),
                    company_id: Hex(0),
                    sub_version: Hex(0),
                },
            );
        }
        Procedure::Ping(_) => conn.features_used.remove(FeatureSet::LE_PING),
        _ => return,
    }
    finish(conn, sh);
}
