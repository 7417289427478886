//! Channel map update procedure.

use super::{
    control, finish, instant_status, next_instant, InstantStatus, InstantUpdate, Procedure,
};
use crate::{
    config::Config,
    link::{
        channel_map::ChannelMap, connection::Connection, controller::Shared,
        llcp::ControlOpcode, llcp::ControlPdu, Role,
    },
    ErrorCode, RequestError,
};

#[derive(Debug)]
pub(crate) struct ChannelMapProc {
    pub map: ChannelMap,
    /// Whether the indication was queued.
    pub sent: bool,
}

/// Starts a channel map update on a central connection.
pub(crate) fn request(conn: &mut Connection, map: ChannelMap) -> Result<(), RequestError> {
    if conn.role != Role::Central {
        return Err(RequestError::Disallowed);
    }
    if !map.is_valid() {
        return Err(RequestError::InvalidParameters);
    }
    conn.llcp.request()?;
    conn.procedure = Procedure::ChannelMap(ChannelMapProc { map, sent: false });
    Ok(())
}

pub(crate) fn advance<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, counter: u16) {
    let map = match &conn.procedure {
        Procedure::ChannelMap(p) if !p.sent => p.map,
        _ => return,
    };
    if !sh.token.acquire(conn.handle) {
        return;
    }

    let instant = next_instant(conn, counter);
    if sh
        .send_ctrl(conn, ControlPdu::ChannelMapInd { map, instant })
        .is_ok()
    {
        conn.instant = Some(InstantUpdate::ChannelMap { map, instant });
        if let Procedure::ChannelMap(p) = &mut conn.procedure {
            p.sent = true;
        }
    }
}

/// Handles `LL_CHANNEL_MAP_IND`.
pub(crate) fn rx_ind<C: Config>(
    conn: &mut Connection,
    sh: &mut Shared<C>,
    map: ChannelMap,
    instant: u16,
) {
    if conn.role == Role::Central {
        control::unknown_rsp(conn, sh, ControlOpcode::ChannelMapInd);
        return;
    }
    if instant_status(instant, conn.event_counter) == InstantStatus::Passed {
        conn.terminate_with(ErrorCode::InstantPassed);
        return;
    }
    conn.instant = Some(InstantUpdate::ChannelMap { map, instant });
}

/// Switches to the new map at the instant.
pub(crate) fn apply<C: Config>(conn: &mut Connection, sh: &mut Shared<C>, map: ChannelMap) {
    debug!("conn {:?}: channel map {:?} -> {:?}", conn.handle, conn.channel_map, map);
    conn.channel_map = map;
    if let Procedure::ChannelMap(_) = conn.procedure {
        finish(conn, sh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        link::{connect::SleepClockAccuracy, connect::ConnectInd, ConnHandle},
        utils::Hex,
    };

    fn conn(role: Role) -> Connection {
        let ind = ConnectInd {
            access_address: Hex(0x71764129),
            crc_init: Hex(0x123456),
            win_size: 1,
            win_offset: 0,
            interval: 24,
            latency: 0,
            timeout: 72,
            channel_map: ChannelMap::with_all_channels(),
            hop: 7,
            sca: SleepClockAccuracy::Ppm0To20,
        };
        Connection::new(ConnHandle::new(0), role, &ind, false, &Settings::default())
    }

    #[test]
    fn central_only() {
        let map = ChannelMap::from_raw([0xff, 0, 0, 0, 0]);
        let mut periph = conn(Role::Peripheral);
        assert_eq!(request(&mut periph, map), Err(RequestError::Disallowed));

        let mut central = conn(Role::Central);
        let single = ChannelMap::from_raw([0x01, 0, 0, 0, 0]);
        assert_eq!(
            request(&mut central, single),
            Err(RequestError::InvalidParameters)
        );
        assert!(!central.llcp.pending());

        request(&mut central, map).unwrap();
        assert!(central.llcp.pending());
        assert_eq!(request(&mut central, map), Err(RequestError::Busy));
    }
}
