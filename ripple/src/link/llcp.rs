//! Defines packet structures used by the Link Layer Control Protocol.

use crate::{
    bytes::*,
    link::{channel_map::ChannelMap, features::FeatureSet},
    phy::PhySet,
    time::Duration,
    utils::Hex,
    Error, ErrorCode,
};

/// Data transmitted with an `LL_CONNECTION_UPDATE_IND` Control PDU, containing a new set of
/// connection parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionUpdateData {
    /// Transmit window size, in 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset from the instant's anchor, in 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval, in 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency, in connection events.
    pub latency: u16,
    /// Supervision timeout, in 10 ms units.
    pub timeout: u16,
    /// Event counter value at which the new parameters take effect.
    pub instant: u16,
}

impl ConnectionUpdateData {
    /// Returns the size of the transmit window for the first PDU of the connection.
    pub fn win_size(&self) -> Duration {
        Duration::from_units_1250(self.win_size.into())
    }

    /// Returns the offset of the transmit window, as a duration since the `instant`.
    pub fn win_offset(&self) -> Duration {
        Duration::from_units_1250(self.win_offset)
    }

    /// Returns the duration between connection events.
    pub fn interval(&self) -> Duration {
        Duration::from_units_1250(self.interval)
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn timeout(&self) -> Duration {
        Duration::from_units_10ms(self.timeout)
    }
}

/// Data of `LL_CONNECTION_PARAM_REQ` and `LL_CONNECTION_PARAM_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionParamData {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    /// The interval should be a multiple of this value (in 1.25 ms units). 0 means "no
    /// preference".
    pub preferred_periodicity: u8,
    /// Event counter the `offsets` are relative to.
    pub reference_conn_event_count: u16,
    /// Acceptable window offsets in preference order. `0xFFFF` marks an unused entry.
    pub offsets: [u16; 6],
}

impl ConnectionParamData {
    /// Window offset value marking an unused entry.
    pub const NO_OFFSET: u16 = 0xffff;

    /// Returns an iterator over the valid entries of `offsets`.
    pub fn valid_offsets<'a>(&'a self) -> impl Iterator<Item = u16> + 'a {
        self.offsets
            .iter()
            .cloned()
            .filter(|&o| o != Self::NO_OFFSET)
    }
}

/// Data of `LL_LENGTH_REQ` and `LL_LENGTH_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LengthData {
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
}

/// A structured representation of an LL Control PDU used by the Link Layer Control Protocol (LLCP).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlPdu<'a> {
    /// `0x00`/`LL_CONNECTION_UPDATE_IND` - Update connection parameters.
    ///
    /// Sent by the central. The peripheral does not send a response back.
    ConnectionUpdateInd(ConnectionUpdateData),

    /// `0x01`/`LL_CHANNEL_MAP_IND` - Update the channel map.
    ///
    /// Sent by the central. The peripheral does not send a response back.
    ChannelMapInd { map: ChannelMap, instant: u16 },

    /// `0x02`/`LL_TERMINATE_IND` - Close the connection.
    ///
    /// Can be sent by central or peripheral.
    TerminateInd { error_code: ErrorCode },

    /// `0x03`/`LL_ENC_REQ` - Central starts encryption.
    EncReq {
        rand: Hex<u64>,
        ediv: Hex<u16>,
        skd_m: Hex<u64>,
        iv_m: Hex<u32>,
    },

    /// `0x04`/`LL_ENC_RSP` - Peripheral's half of the session key diversifier and IV.
    EncRsp { skd_s: Hex<u64>, iv_s: Hex<u32> },

    /// `0x05`/`LL_START_ENC_REQ`
    StartEncReq,

    /// `0x06`/`LL_START_ENC_RSP`
    StartEncRsp,

    /// `0x07`/`LL_UNKNOWN_RSP` - Response to unknown/unsupported LL Control PDUs.
    ///
    /// This is returned as a response to an incoming LL Control PDU when the opcode is
    /// unimplemented or unknown, or when the `CtrData` is invalid for the opcode.
    UnknownRsp {
        /// Opcode of the unknown PDU.
        unknown_type: ControlOpcode,
    },

    /// `0x08`/`LL_FEATURE_REQ` - Central requests peripheral's features.
    FeatureReq {
        /// Supported feature set of the central.
        features_central: FeatureSet,
    },

    /// `0x09`/`LL_FEATURE_RSP` - Answers `LL_FEATURE_REQ` or `LL_PERIPHERAL_FEATURE_REQ`.
    FeatureRsp {
        /// Features that will be used for the connection. Logical `AND` of both feature sets,
        /// except for octet 0 which is the sender's own feature set.
        features_used: FeatureSet,
    },

    /// `0x0A`/`LL_PAUSE_ENC_REQ`
    PauseEncReq,

    /// `0x0B`/`LL_PAUSE_ENC_RSP`
    PauseEncRsp,

    /// `0x0C`/`LL_VERSION_IND` - Bluetooth version indication (sent by both central and
    /// peripheral).
    VersionInd {
        vers_nr: VersionNumber,
        comp_id: Hex<u16>,
        sub_vers_nr: Hex<u16>,
    },

    /// `0x0D`/`LL_REJECT_IND`
    RejectInd { error_code: ErrorCode },

    /// `0x0E`/`LL_PERIPHERAL_FEATURE_REQ` - Peripheral-initiated feature exchange.
    PeripheralFeatureReq { features_peripheral: FeatureSet },

    /// `0x0F`/`LL_CONNECTION_PARAM_REQ`
    ConnectionParamReq(ConnectionParamData),

    /// `0x10`/`LL_CONNECTION_PARAM_RSP`
    ConnectionParamRsp(ConnectionParamData),

    /// `0x11`/`LL_REJECT_EXT_IND` - Rejects the procedure started by `reject_opcode`.
    RejectExtInd {
        reject_opcode: ControlOpcode,
        error_code: ErrorCode,
    },

    /// `0x12`/`LL_PING_REQ`
    PingReq,

    /// `0x13`/`LL_PING_RSP`
    PingRsp,

    /// `0x14`/`LL_LENGTH_REQ`
    LengthReq(LengthData),

    /// `0x15`/`LL_LENGTH_RSP`
    LengthRsp(LengthData),

    /// `0x16`/`LL_PHY_REQ`
    PhyReq { tx_phys: PhySet, rx_phys: PhySet },

    /// `0x17`/`LL_PHY_RSP`
    PhyRsp { tx_phys: PhySet, rx_phys: PhySet },

    /// `0x18`/`LL_PHY_UPDATE_IND` - Sent by the central. Empty PHY sets mean "no change".
    PhyUpdateInd {
        c_to_p_phy: PhySet,
        p_to_c_phy: PhySet,
        instant: u16,
    },

    /// Catch-all variant for unsupported opcodes.
    Unknown {
        /// The opcode we don't support. This can also be the `Unknown` variant.
        opcode: ControlOpcode,

        /// Additional data depending on the opcode.
        ctr_data: &'a [u8],
    },
}

impl<'a> ControlPdu<'a> {
    /// Decodes a complete control PDU payload.
    ///
    /// Unlike `from_bytes`, this requires the payload length to match the opcode exactly.
    pub fn parse(payload: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(payload);
        let pdu = Self::from_bytes(&mut bytes)?;
        if bytes.is_empty() {
            Ok(pdu)
        } else {
            Err(Error::IncompleteParse)
        }
    }

    /// Returns the opcode of this LL Control PDU.
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::ConnectionUpdateInd { .. } => ControlOpcode::ConnectionUpdateInd,
            ControlPdu::ChannelMapInd { .. } => ControlOpcode::ChannelMapInd,
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::EncReq { .. } => ControlOpcode::EncReq,
            ControlPdu::EncRsp { .. } => ControlOpcode::EncRsp,
            ControlPdu::StartEncReq => ControlOpcode::StartEncReq,
            ControlPdu::StartEncRsp => ControlOpcode::StartEncRsp,
            ControlPdu::UnknownRsp { .. } => ControlOpcode::UnknownRsp,
            ControlPdu::FeatureReq { .. } => ControlOpcode::FeatureReq,
            ControlPdu::FeatureRsp { .. } => ControlOpcode::FeatureRsp,
            ControlPdu::PauseEncReq => ControlOpcode::PauseEncReq,
            ControlPdu::PauseEncRsp => ControlOpcode::PauseEncRsp,
            ControlPdu::VersionInd { .. } => ControlOpcode::VersionInd,
            ControlPdu::RejectInd { .. } => ControlOpcode::RejectInd,
            ControlPdu::PeripheralFeatureReq { .. } => ControlOpcode::PeripheralFeatureReq,
            ControlPdu::ConnectionParamReq(_) => ControlOpcode::ConnectionParamReq,
            ControlPdu::ConnectionParamRsp(_) => ControlOpcode::ConnectionParamRsp,
            ControlPdu::RejectExtInd { .. } => ControlOpcode::RejectExtInd,
            ControlPdu::PingReq => ControlOpcode::PingReq,
            ControlPdu::PingRsp => ControlOpcode::PingRsp,
            ControlPdu::LengthReq(_) => ControlOpcode::LengthReq,
            ControlPdu::LengthRsp(_) => ControlOpcode::LengthRsp,
            ControlPdu::PhyReq { .. } => ControlOpcode::PhyReq,
            ControlPdu::PhyRsp { .. } => ControlOpcode::PhyRsp,
            ControlPdu::PhyUpdateInd { .. } => ControlOpcode::PhyUpdateInd,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Returns the encoded size of this LLCPDU, including the opcode byte.
    pub fn encoded_size(&self) -> u8 {
        match self {
            ControlPdu::Unknown { ctr_data, .. } => 1 + ctr_data.len() as u8,
            _ => 1 + self.opcode().ctr_data_len().unwrap_or(0),
        }
    }
}

impl<'a> FromBytes<'a> for ControlPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        Ok(match opcode {
            ControlOpcode::ConnectionUpdateInd => {
                ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
                    win_size: bytes.read_u8()?,
                    win_offset: bytes.read_u16_le()?,
                    interval: bytes.read_u16_le()?,
                    latency: bytes.read_u16_le()?,
                    timeout: bytes.read_u16_le()?,
                    instant: bytes.read_u16_le()?,
                })
            }
            ControlOpcode::ChannelMapInd => ControlPdu::ChannelMapInd {
                map: ChannelMap::from_raw(bytes.read_array()?),
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::EncReq => ControlPdu::EncReq {
                rand: Hex(bytes.read_u64_le()?),
                ediv: Hex(bytes.read_u16_le()?),
                skd_m: Hex(bytes.read_u64_le()?),
                iv_m: Hex(bytes.read_u32_le()?),
            },
            ControlOpcode::EncRsp => ControlPdu::EncRsp {
                skd_s: Hex(bytes.read_u64_le()?),
                iv_s: Hex(bytes.read_u32_le()?),
            },
            ControlOpcode::StartEncReq => ControlPdu::StartEncReq,
            ControlOpcode::StartEncRsp => ControlPdu::StartEncRsp,
            ControlOpcode::UnknownRsp => ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::from(bytes.read_u8()?),
            },
            ControlOpcode::FeatureReq => ControlPdu::FeatureReq {
                features_central: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::FeatureRsp => ControlPdu::FeatureRsp {
                features_used: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::PauseEncReq => ControlPdu::PauseEncReq,
            ControlOpcode::PauseEncRsp => ControlPdu::PauseEncRsp,
            ControlOpcode::VersionInd => ControlPdu::VersionInd {
                vers_nr: VersionNumber::from(bytes.read_u8()?),
                comp_id: Hex(bytes.read_u16_le()?),
                sub_vers_nr: Hex(bytes.read_u16_le()?),
            },
            ControlOpcode::RejectInd => ControlPdu::RejectInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::PeripheralFeatureReq => ControlPdu::PeripheralFeatureReq {
                features_peripheral: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::ConnectionParamReq => {
                ControlPdu::ConnectionParamReq(read_param_data(bytes)?)
            }
            ControlOpcode::ConnectionParamRsp => {
                ControlPdu::ConnectionParamRsp(read_param_data(bytes)?)
            }
            ControlOpcode::RejectExtInd => ControlPdu::RejectExtInd {
                reject_opcode: ControlOpcode::from(bytes.read_u8()?),
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::PingReq => ControlPdu::PingReq,
            ControlOpcode::PingRsp => ControlPdu::PingRsp,
            ControlOpcode::LengthReq => ControlPdu::LengthReq(read_length_data(bytes)?),
            ControlOpcode::LengthRsp => ControlPdu::LengthRsp(read_length_data(bytes)?),
            ControlOpcode::PhyReq => ControlPdu::PhyReq {
                tx_phys: PhySet::from_bytes(bytes)?,
                rx_phys: PhySet::from_bytes(bytes)?,
            },
            ControlOpcode::PhyRsp => ControlPdu::PhyRsp {
                tx_phys: PhySet::from_bytes(bytes)?,
                rx_phys: PhySet::from_bytes(bytes)?,
            },
            ControlOpcode::PhyUpdateInd => ControlPdu::PhyUpdateInd {
                c_to_p_phy: PhySet::from_bytes(bytes)?,
                p_to_c_phy: PhySet::from_bytes(bytes)?,
                instant: bytes.read_u16_le()?,
            },
            _ => ControlPdu::Unknown {
                opcode,
                ctr_data: bytes.read_rest(),
            },
        })
    }
}

fn read_param_data(bytes: &mut ByteReader<'_>) -> Result<ConnectionParamData, Error> {
    let mut data = ConnectionParamData {
        interval_min: bytes.read_u16_le()?,
        interval_max: bytes.read_u16_le()?,
        latency: bytes.read_u16_le()?,
        timeout: bytes.read_u16_le()?,
        preferred_periodicity: bytes.read_u8()?,
        reference_conn_event_count: bytes.read_u16_le()?,
        offsets: [0; 6],
    };
    for offset in &mut data.offsets {
        *offset = bytes.read_u16_le()?;
    }
    Ok(data)
}

fn write_param_data(buffer: &mut ByteWriter<'_>, data: &ConnectionParamData) -> Result<(), Error> {
    buffer.write_u16_le(data.interval_min)?;
    buffer.write_u16_le(data.interval_max)?;
    buffer.write_u16_le(data.latency)?;
    buffer.write_u16_le(data.timeout)?;
    buffer.write_u8(data.preferred_periodicity)?;
    buffer.write_u16_le(data.reference_conn_event_count)?;
    for offset in &data.offsets {
        buffer.write_u16_le(*offset)?;
    }
    Ok(())
}

fn read_length_data(bytes: &mut ByteReader<'_>) -> Result<LengthData, Error> {
    Ok(LengthData {
        max_rx_octets: bytes.read_u16_le()?,
        max_rx_time: bytes.read_u16_le()?,
        max_tx_octets: bytes.read_u16_le()?,
        max_tx_time: bytes.read_u16_le()?,
    })
}

fn write_length_data(buffer: &mut ByteWriter<'_>, data: &LengthData) -> Result<(), Error> {
    buffer.write_u16_le(data.max_rx_octets)?;
    buffer.write_u16_le(data.max_rx_time)?;
    buffer.write_u16_le(data.max_tx_octets)?;
    buffer.write_u16_le(data.max_tx_time)
}

impl<'a> ToBytes for ControlPdu<'a> {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::ConnectionUpdateInd(data) => {
                buffer.write_u8(data.win_size)?;
                buffer.write_u16_le(data.win_offset)?;
                buffer.write_u16_le(data.interval)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u16_le(data.instant)
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                buffer.write_slice(&map.to_raw())?;
                buffer.write_u16_le(*instant)
            }
            ControlPdu::TerminateInd { error_code } | ControlPdu::RejectInd { error_code } => {
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                buffer.write_u64_le(rand.0)?;
                buffer.write_u16_le(ediv.0)?;
                buffer.write_u64_le(skd_m.0)?;
                buffer.write_u32_le(iv_m.0)
            }
            ControlPdu::EncRsp { skd_s, iv_s } => {
                buffer.write_u64_le(skd_s.0)?;
                buffer.write_u32_le(iv_s.0)
            }
            ControlPdu::StartEncReq
            | ControlPdu::StartEncRsp
            | ControlPdu::PauseEncReq
            | ControlPdu::PauseEncRsp
            | ControlPdu::PingReq
            | ControlPdu::PingRsp => Ok(()),
            ControlPdu::UnknownRsp { unknown_type } => buffer.write_u8(u8::from(*unknown_type)),
            ControlPdu::FeatureReq {
                features_central: features,
            }
            | ControlPdu::FeatureRsp {
                features_used: features,
            }
            | ControlPdu::PeripheralFeatureReq {
                features_peripheral: features,
            } => features.to_bytes(buffer),
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                buffer.write_u8(u8::from(*vers_nr))?;
                buffer.write_u16_le(comp_id.0)?;
                buffer.write_u16_le(sub_vers_nr.0)
            }
            ControlPdu::ConnectionParamReq(data) | ControlPdu::ConnectionParamRsp(data) => {
                write_param_data(buffer, data)
            }
            ControlPdu::RejectExtInd {
                reject_opcode,
                error_code,
            } => {
                buffer.write_u8(u8::from(*reject_opcode))?;
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::LengthReq(data) | ControlPdu::LengthRsp(data) => {
                write_length_data(buffer, data)
            }
            ControlPdu::PhyReq { tx_phys, rx_phys } | ControlPdu::PhyRsp { tx_phys, rx_phys } => {
                tx_phys.to_bytes(buffer)?;
                rx_phys.to_bytes(buffer)
            }
            ControlPdu::PhyUpdateInd {
                c_to_p_phy,
                p_to_c_phy,
                instant,
            } => {
                c_to_p_phy.to_bytes(buffer)?;
                p_to_c_phy.to_bytes(buffer)?;
                buffer.write_u16_le(*instant)
            }
            ControlPdu::Unknown { ctr_data, .. } => buffer.write_slice(ctr_data),
        }
    }
}

enum_with_unknown! {
    /// Enumeration of all known LL Control PDU opcodes (not all of which might be supported).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        PeripheralFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectExtInd = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
        PhyReq = 0x16,
        PhyRsp = 0x17,
        PhyUpdateInd = 0x18,
        MinUsedChannelsInd = 0x19,
    }
}

impl ControlOpcode {
    /// Returns the length of `CtrData` for this opcode, or `None` if the opcode is unknown.
    pub fn ctr_data_len(&self) -> Option<u8> {
        use self::ControlOpcode::*;

        Some(match self {
            ConnectionUpdateInd => 1 + 2 + 2 + 2 + 2 + 2,
            ChannelMapInd => 5 + 2,
            TerminateInd => 1,
            EncReq => 8 + 2 + 8 + 4,
            EncRsp => 8 + 4,
            StartEncReq | StartEncRsp => 0,
            UnknownRsp => 1,
            FeatureReq | FeatureRsp => 8,
            PauseEncReq | PauseEncRsp => 0,
            VersionInd => 1 + 2 + 2,
            RejectInd => 1,
            PeripheralFeatureReq => 8,
            ConnectionParamReq | ConnectionParamRsp => 2 + 2 + 2 + 2 + 1 + 2 + 6 * 2,
            RejectExtInd => 1 + 1,
            PingReq | PingRsp => 0,
            LengthReq | LengthRsp => 2 + 2 + 2 + 2,
            PhyReq | PhyRsp => 1 + 1,
            PhyUpdateInd => 1 + 1 + 2,
            MinUsedChannelsInd => 1 + 1,
            Unknown(_) => return None,
        })
    }
}

enum_with_unknown! {
    /// Enumeration of all possible `VersNr` for `LL_VERSION_IND` PDUs.
    ///
    /// According to https://www.bluetooth.com/specifications/assigned-numbers/link-layer
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}
