//! Encryption start, pause and refresh.
//!
//! The central starts encryption with `LL_ENC_REQ`; both sides contribute half of the session
//! key diversifier (`SKD`) and of the IV. The session key is derived from the long term key with
//! the block cipher supplied by the [`Cipher`] implementation, and the `LL_START_ENC_REQ` /
//! `LL_START_ENC_RSP` handshake switches both directions to encrypted PDUs.
//!
//! While this is going on, data PDUs must not be exchanged. The transmit side only sends the
//! control PDUs that are part of the procedure (see [`tx_allowed`]); everything else waits.
//!
//! An already encrypted link is first paused with `LL_PAUSE_ENC_REQ` / `LL_PAUSE_ENC_RSP`, then
//! goes through the same steps with a new key, which results in an `EncryptionRefresh`
//! notification instead of `EncryptionChange`.
//!
//! By default, the peripheral waits for the host to provide the long term key before answering
//! with `LL_ENC_RSP`. With `Settings::fast_encryption`, `LL_ENC_RSP` is sent right away and only
//! `LL_START_ENC_REQ` waits for the key.
//!
//! [`Cipher`]: trait.Cipher.html
//! [`tx_allowed`]: fn.tx_allowed.html

use super::{control, finish, Procedure};
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
    phy::Ccm,
    utils::Hex,
    ErrorCode, RequestError,
};
use byteorder::{ByteOrder, LittleEndian};
use rand_core::RngCore;

/// The AES-128 block function used to derive session keys.
///
/// CCM encryption of PDUs is done by the radio; the controller only needs the plain block
/// cipher. Keys and blocks are passed most significant octet first, as in the `e` function of the
/// core specification.
pub trait Cipher {
    /// Encrypts `block` in place using `key`.
    fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]);
}

/// Per-direction encryption state of a connection.
#[derive(Debug, Default)]
pub struct EncState {
    /// CCM parameters for received PDUs, if decryption is enabled.
    pub rx: Option<Ccm>,
    /// CCM parameters for transmitted PDUs, if encryption is enabled.
    pub tx: Option<Ccm>,
    /// Received data PDUs are a protocol violation.
    pub pause_rx: bool,
    /// Data PDUs must not be sent.
    pub pause_tx: bool,
    /// A key refresh is in progress.
    pub refresh: bool,
}

impl EncState {
    pub fn is_encrypted(&self) -> bool {
        self.rx.is_some() || self.tx.is_some()
    }
}

/// Returns whether a control PDU with `opcode` may be sent while the encryption procedure has
/// paused the transmit side.
pub fn tx_allowed(role: Role, enc: &EncState, opcode: Option<ControlOpcode>) -> bool {
    use self::ControlOpcode::*;

    if !enc.pause_tx {
        return true;
    }

    let opcode = match opcode {
        Some(op) => op,
        None => return false,
    };

    let always = match role {
        Role::Central => matches!(opcode, TerminateInd | StartEncRsp | RejectInd | RejectExtInd),
        // LL_ENC_RSP is queued right before LL_START_ENC_REQ and must not be overtaken.
        Role::Peripheral => matches!(
            opcode,
            TerminateInd | EncRsp | StartEncReq | StartEncRsp | RejectInd | RejectExtInd
        ),
    };
    let refresh = enc.refresh && role == Role::Central && matches!(opcode, PauseEncRsp | EncReq);
    always || refresh
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EncStep {
    /// Central: pause the encrypted link first.
    SendPauseReq,
    /// Central: waiting for the peripheral's `LL_PAUSE_ENC_RSP`.
    PauseRspWait,
    /// Central: send `LL_ENC_REQ`.
    SendEncReq,
    /// Central: waiting for `LL_ENC_RSP`.
    EncRspWait,
    /// Central: waiting for `LL_START_ENC_REQ`.
    StartEncReqWait,
    /// Central: enable encryption and send `LL_START_ENC_RSP`.
    CentralStartRsp,
    /// Both: waiting for the peer's `LL_START_ENC_RSP`.
    StartEncRspWait,

    /// Peripheral: waiting for the central's `LL_PAUSE_ENC_RSP`.
    PauseEncRspWait,
    /// Peripheral: link paused, waiting for `LL_ENC_REQ`.
    EncReqWait,
    /// Peripheral: waiting for the host's long term key.
    LtkWait,
    /// Peripheral: send `LL_ENC_RSP` (unless already sent) and `LL_START_ENC_REQ`.
    PeripheralRsp,
    /// Peripheral: the host has no key; reject the request.
    PeripheralReject,
    /// Peripheral: enable encryption and send `LL_START_ENC_RSP`.
    PeripheralStartRsp,
}

#[derive(Debug)]
pub(crate) struct EncProc {
    pub step: EncStep,
    pub ltk: [u8; 16],
    pub rand: u64,
    pub ediv: u16,
    pub skd_m: u64,
    pub iv_m: u32,
    pub skd_s: u64,
    pub iv_s: u32,
    /// Peripheral: `LL_ENC_RSP` was queued.
    pub rsp_sent: bool,
}

impl EncProc {
    fn new(step: EncStep) -> Self {
        Self {
            step,
            ltk: [0; 16],
            rand: 0,
            ediv: 0,
            skd_m: 0,
            iv_m: 0,
            skd_s: 0,
            iv_s: 0,
            rsp_sent: false,
        }
    }

    /// Derives the session key and returns the CCM parameters for one direction.
    fn ccm(&self, cipher: &mut impl Cipher, direction: bool) -> Ccm {
        let mut skd = [0; 16];
        LittleEndian::write_u64(&mut skd[..8], self.skd_m);
        LittleEndian::write_u64(&mut skd[8..], self.skd_s);
        // `e` works on most significant octet first.
        skd.reverse();
        let mut ltk = self.ltk;
        ltk.reverse();
        cipher.encrypt_block(&ltk, &mut skd);
        skd.reverse();

        let mut iv = [0; 8];
        LittleEndian::write_u32(&mut iv[..4], self.iv_m);
        LittleEndian::write_u32(&mut iv[4..], self.iv_s);

        Ccm {
            key: skd,
            iv,
            counter: 0,
            direction,
        }
    }
}

/// Direction bit of PDUs sent by the central.
const CENTRAL_TO_PERIPHERAL: bool = true;

/// Starts (or refreshes) encryption on a central connection.
pub(crate) fn request(
    conn: &mut Connection,
    rand: u64,
    ediv: u16,
    ltk: [u8; 16],
) -> Result<(), RequestError> {
    if conn.role != Role::Central {
        return Err(RequestError::Disallowed);
    }
    if !conn.peer_supports(FeatureSet::LE_ENCRYPTION) {
        return Err(RequestError::UnsupportedFeature);
    }
    conn.llcp.request()?;

    let step = if conn.enc.is_encrypted() {
        EncStep::SendPauseReq
    } else {
        EncStep::SendEncReq
    };
    let mut p = EncProc::new(step);
    p.rand = rand;
    p.ediv = ediv;
    p.ltk = ltk;
    conn.procedure = Procedure::Encryption(p);
    Ok(())
}

/// Handles the host's long term key (or lack thereof) for a pending `LtkRequest`.
pub(crate) fn ltk_reply(conn: &mut Connection, ltk: Option<[u8; 16]>) -> Result<(), RequestError> {
    match &mut conn.procedure {
        Procedure::Encryption(p) if p.step == EncStep::LtkWait => {
            match ltk {
                Some(ltk) => {
                    p.ltk = ltk;
                    p.step = EncStep::PeripheralRsp;
                }
                None => p.step = EncStep::PeripheralReject,
            }
            Ok(())
        }
        _ => Err(RequestError::Disallowed),
    }
}

fn step_of(conn: &Connection) -> Option<EncStep> {
    match &conn.procedure {
        Procedure::Encryption(p) => Some(p.step),
        _ => None,
    }
}

fn set_step(conn: &mut Connection, step: EncStep) {
    if let Procedure::Encryption(p) = &mut conn.procedure {
        debug!("conn {:?}: encryption {:?} -> {:?}", conn.handle, p.step, step);
        p.step = step;
    }
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let step = match step_of(conn) {
        Some(step) => step,
        None => return,
    };

    match step {
        EncStep::SendPauseReq => {
            if sh.send_ctrl(conn, ControlPdu::PauseEncReq).is_ok() {
                set_step(conn, EncStep::PauseRspWait);
                conn.start_procedure_timer();
            }
        }
        EncStep::SendEncReq => send_enc_req(conn, sh),
        EncStep::CentralStartRsp => {
            let (rx, tx) = match &conn.procedure {
                Procedure::Encryption(p) => (
                    p.ccm(&mut sh.cipher, !CENTRAL_TO_PERIPHERAL),
                    p.ccm(&mut sh.cipher, CENTRAL_TO_PERIPHERAL),
                ),
                _ => return,
            };
            conn.enc.rx = Some(rx);
            conn.enc.tx = Some(tx);
            if sh.send_ctrl(conn, ControlPdu::StartEncRsp).is_ok() {
                set_step(conn, EncStep::StartEncRspWait);
            } else {
                // Retry with the same key next time; nothing has been sent encrypted yet.
                conn.enc.tx = None;
            }
        }
        EncStep::PeripheralRsp => {
            let rsp_sent = matches!(&conn.procedure, Procedure::Encryption(p) if p.rsp_sent);
            let needed = if rsp_sent { 1 } else { 2 };
            if sh.ctrl_pool.free_count() < needed {
                trace!("conn {:?}: waiting for buffers to answer LL_ENC_REQ", conn.handle);
                return;
            }
            if !rsp_sent {
                let _ = send_enc_rsp(conn, sh);
            }
            let rx = match &conn.procedure {
                Procedure::Encryption(p) => p.ccm(&mut sh.cipher, CENTRAL_TO_PERIPHERAL),
                _ => return,
            };
            if sh.send_ctrl(conn, ControlPdu::StartEncReq).is_ok() {
                conn.enc.rx = Some(rx);
                conn.enc.pause_tx = true;
                set_step(conn, EncStep::StartEncRspWait);
            }
        }
        EncStep::PeripheralReject => {
            let sent = sh
                .send_ctrl(
                    conn,
                    ControlPdu::RejectInd {
                        error_code: ErrorCode::PinOrKeyMissing,
                    },
                )
                .is_ok();
            if sent {
                conn.enc.pause_rx = false;
                conn.enc.pause_tx = false;
                conn.enc.refresh = false;
                let _ = sh.notify(
                    conn.handle,
                    Notification::EncryptionChange {
                        status: ErrorCode::PinOrKeyMissing,
                        enabled: false,
                    },
                );
                finish(conn, sh);
            }
        }
        EncStep::PeripheralStartRsp => {
            let tx = match &conn.procedure {
                Procedure::Encryption(p) => p.ccm(&mut sh.cipher, !CENTRAL_TO_PERIPHERAL),
                _ => return,
            };
            conn.enc.tx = Some(tx);
            if sh.send_ctrl(conn, ControlPdu::StartEncRsp).is_ok() {
                complete(conn, sh);
            } else {
                conn.enc.tx = None;
            }
        }
        EncStep::PauseRspWait
        | EncStep::EncRspWait
        | EncStep::StartEncReqWait
        | EncStep::StartEncRspWait
        | EncStep::PauseEncRspWait
        | EncStep::EncReqWait
        | EncStep::LtkWait => {}
    }
}

fn send_enc_req<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let skd_m = sh.rng.next_u64();
    let iv_m = sh.rng.next_u32();
    let (rand, ediv) = match &mut conn.procedure {
        Procedure::Encryption(p) => {
            p.skd_m = skd_m;
            p.iv_m = iv_m;
            (p.rand, p.ediv)
        }
        _ => return,
    };

    let pdu = ControlPdu::EncReq {
        rand: Hex(rand),
        ediv: Hex(ediv),
        skd_m: Hex(skd_m),
        iv_m: Hex(iv_m),
    };
    if sh.send_ctrl(conn, pdu).is_ok() {
        set_step(conn, EncStep::EncRspWait);
    } else {
        set_step(conn, EncStep::SendEncReq);
    }
}

fn send_enc_rsp<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) -> bool {
    let (skd_s, iv_s) = match &conn.procedure {
        Procedure::Encryption(p) => (p.skd_s, p.iv_s),
        _ => return false,
    };
    let pdu = ControlPdu::EncRsp {
        skd_s: Hex(skd_s),
        iv_s: Hex(iv_s),
    };
    if sh.send_ctrl(conn, pdu).is_ok() {
        if let Procedure::Encryption(p) = &mut conn.procedure {
            p.rsp_sent = true;
        }
        true
    } else {
        false
    }
}

/// Encryption is up in both directions.
fn complete<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    let event = if conn.enc.refresh {
        Notification::EncryptionRefresh {
            status: ErrorCode::Success,
        }
    } else {
        Notification::EncryptionChange {
            status: ErrorCode::Success,
            enabled: true,
        }
    };
    conn.enc.pause_rx = false;
    conn.enc.pause_tx = false;
    conn.enc.refresh = false;
    conn.timers.apto_expire = conn.timers.apto_reload;
    conn.timers.appto_expire = conn.timers.appto_reload;
    let _ = sh.notify(conn.handle, event);
    finish(conn, sh);
}

/// Handles `LL_ENC_REQ` (peripheral).
pub(crate) fn rx_enc_req<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    rand: u64,
    ediv: u16,
    skd_m: u64,
    iv_m: u32,
) {
    if conn.role == Role::Central {
        control::unknown_rsp(conn, sh, ControlOpcode::EncReq);
        return;
    }

    match step_of(conn) {
        // Refresh: we paused the link already and hold the slot.
        Some(EncStep::EncReqWait) => {}
        None if !conn.llcp.pending() => {
            if conn.llcp.request().is_err() {
                return;
            }
            conn.procedure = Procedure::Encryption(EncProc::new(EncStep::LtkWait));
        }
        _ => {
            debug!("conn {:?}: LL_ENC_REQ collides with {:?}", conn.handle, conn.procedure);
            let _ = control::reject(
                conn,
                sh,
                ControlOpcode::EncReq,
                ErrorCode::DifferentTransactionCollision,
            );
            return;
        }
    }

    let skd_s = sh.rng.next_u64();
    let iv_s = sh.rng.next_u32();
    if let Procedure::Encryption(p) = &mut conn.procedure {
        p.step = EncStep::LtkWait;
        p.rand = rand;
        p.ediv = ediv;
        p.skd_m = skd_m;
        p.iv_m = iv_m;
        p.skd_s = skd_s;
        p.iv_s = iv_s;
    }
    conn.enc.pause_rx = true;
    conn.start_procedure_timer();

    if sh.settings.fast_encryption {
        let _ = send_enc_rsp(conn, sh);
    }
    let _ = sh.notify(
        conn.handle,
        Notification::LtkRequest {
            rand: Hex(rand),
            ediv: Hex(ediv),
        },
    );
}

/// Handles `LL_ENC_RSP` (central).
pub(crate) fn rx_enc_rsp<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    skd_s: u64,
    iv_s: u32,
) {
    match &mut conn.procedure {
        Procedure::Encryption(p) if p.step == EncStep::EncRspWait => {
            p.skd_s = skd_s;
            p.iv_s = iv_s;
        }
        _ => {
            control::unknown_rsp(conn, sh, ControlOpcode::EncRsp);
            return;
        }
    }
    conn.enc.pause_rx = true;
    set_step(conn, EncStep::StartEncReqWait);
}

/// Handles `LL_START_ENC_REQ` (central).
pub(crate) fn rx_start_enc_req<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if step_of(conn) == Some(EncStep::StartEncReqWait) {
        set_step(conn, EncStep::CentralStartRsp);
    } else {
        control::unknown_rsp(conn, sh, ControlOpcode::StartEncReq);
    }
}

/// Handles `LL_START_ENC_RSP` (both roles).
pub(crate) fn rx_start_enc_rsp<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if step_of(conn) != Some(EncStep::StartEncRspWait) {
        control::unknown_rsp(conn, sh, ControlOpcode::StartEncRsp);
        return;
    }
    match conn.role {
        Role::Central => complete(conn, sh),
        Role::Peripheral => set_step(conn, EncStep::PeripheralStartRsp),
    }
}

/// Handles `LL_PAUSE_ENC_REQ` (peripheral).
pub(crate) fn rx_pause_enc_req<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if conn.role == Role::Central || !conn.enc.is_encrypted() {
        control::unknown_rsp(conn, sh, ControlOpcode::PauseEncReq);
        return;
    }
    if conn.llcp.pending() {
        let _ = control::reject(
            conn,
            sh,
            ControlOpcode::PauseEncReq,
            ErrorCode::DifferentTransactionCollision,
        );
        return;
    }
    if conn.llcp.request().is_err() {
        return;
    }
    conn.procedure = Procedure::Encryption(EncProc::new(EncStep::PauseEncRspWait));
    conn.enc.refresh = true;
    conn.enc.pause_tx = true;
    let _ = sh.send_ctrl(conn, ControlPdu::PauseEncRsp);
    conn.start_procedure_timer();
}

/// Handles `LL_PAUSE_ENC_RSP`.
pub(crate) fn rx_pause_enc_rsp<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    match (conn.role, step_of(conn)) {
        (Role::Central, Some(EncStep::PauseRspWait)) => {
            // Everything from the peripheral is unencrypted from now on; our response still
            // goes out encrypted.
            conn.enc.rx = None;
            conn.enc.refresh = true;
            conn.enc.pause_rx = true;
            conn.enc.pause_tx = true;
            let _ = sh.send_ctrl(conn, ControlPdu::PauseEncRsp);
        }
        (Role::Peripheral, Some(EncStep::PauseEncRspWait)) => {
            conn.enc.rx = None;
            conn.enc.tx = None;
            conn.enc.pause_rx = true;
            set_step(conn, EncStep::EncReqWait);
        }
        _ => control::unknown_rsp(conn, sh, ControlOpcode::PauseEncRsp),
    }
}

/// Our `LL_ENC_REQ` arrived at the peripheral; stop sending data.
pub(crate) fn enc_req_acked(conn: &mut Connection) {
    conn.enc.pause_tx = true;
    conn.start_procedure_timer();
}

/// Our `LL_PAUSE_ENC_RSP` arrived; continue unencrypted with a new `LL_ENC_REQ`.
pub(crate) fn pause_enc_rsp_acked<C: Config>(conn: &mut Connection, sh: &mut Shared<C>) {
    if conn.role == Role::Central && step_of(conn) == Some(EncStep::PauseRspWait) {
        conn.enc.tx = None;
        send_enc_req(conn, sh);
    }
}

/// The peer rejected our `LL_ENC_REQ` or `LL_PAUSE_ENC_REQ`.
pub(crate) fn rejected<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, status: ErrorCode) {
    let event = if conn.enc.refresh {
        Notification::EncryptionRefresh { status }
    } else {
        Notification::EncryptionChange {
            status,
            enabled: false,
        }
    };
    conn.enc.pause_rx = false;
    conn.enc.pause_tx = false;
    conn.enc.refresh = false;
    let _ = sh.notify(conn.handle, event);
    finish(conn, sh);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockCipher;

    #[test]
    fn filter_while_paused() {
        let mut enc = EncState::default();
        assert!(tx_allowed(Role::Central, &enc, Some(ControlOpcode::FeatureReq)));

        enc.pause_tx = true;
        assert!(!tx_allowed(Role::Central, &enc, Some(ControlOpcode::FeatureReq)));
        assert!(!tx_allowed(Role::Central, &enc, None));
        assert!(tx_allowed(Role::Central, &enc, Some(ControlOpcode::StartEncRsp)));
        assert!(tx_allowed(Role::Central, &enc, Some(ControlOpcode::TerminateInd)));
        assert!(!tx_allowed(Role::Central, &enc, Some(ControlOpcode::EncReq)));
        assert!(tx_allowed(Role::Peripheral, &enc, Some(ControlOpcode::StartEncReq)));
        assert!(tx_allowed(Role::Peripheral, &enc, Some(ControlOpcode::EncRsp)));
        assert!(!tx_allowed(Role::Peripheral, &enc, Some(ControlOpcode::FeatureRsp)));

        enc.refresh = true;
        assert!(tx_allowed(Role::Central, &enc, Some(ControlOpcode::EncReq)));
        assert!(tx_allowed(Role::Central, &enc, Some(ControlOpcode::PauseEncRsp)));
        assert!(tx_allowed(Role::Peripheral, &enc, Some(ControlOpcode::EncRsp)));
        assert!(!tx_allowed(Role::Peripheral, &enc, Some(ControlOpcode::PingReq)));
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let mut p = EncProc::new(EncStep::CentralStartRsp);
        p.ltk = [0x4c; 16];
        p.skd_m = 0xACBDCEDFE0F10213;
        p.skd_s = 0x0213243546576879;
        p.iv_m = 0xBADCAB24;
        p.iv_s = 0xDEAFBABE;

        let mut cipher = MockCipher;
        let tx = p.ccm(&mut cipher, true);
        let rx = p.ccm(&mut cipher, false);
        assert_eq!(tx.key, rx.key);
        assert_ne!(tx.key, [0; 16]);
        assert_eq!(tx.iv, [0x24, 0xab, 0xdc, 0xba, 0xbe, 0xba, 0xaf, 0xde]);
        assert_eq!(tx.counter, 0);
        assert!(tx.direction);
        assert!(!rx.direction);
    }
}
