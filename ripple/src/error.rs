use core::fmt;

/// Errors returned while encoding or decoding PDUs.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// Control PDUs hitting this are answered with an `LL_UNKNOWN_RSP`.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when the application tries to fit too much data into a
    /// PDU or other fixed-size buffer, and also when reaching EOF prematurely
    /// while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
        })
    }
}

enum_with_unknown! {
    /// Status and reason codes exchanged with the peer and reported to the host.
    ///
    /// These share the numbering of the controller error codes in Vol 1, Part F of the core
    /// specification.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ErrorCode(u8) {
        Success = 0x00,
        UnknownConnectionId = 0x02,
        PinOrKeyMissing = 0x06,
        MemoryCapacityExceeded = 0x07,
        ConnectionTimeout = 0x08,
        CommandDisallowed = 0x0C,
        InvalidCommandParameters = 0x12,
        RemoteUserTerminated = 0x13,
        LocalHostTerminated = 0x16,
        UnsupportedRemoteFeature = 0x1A,
        InvalidLlParameters = 0x1E,
        UnspecifiedError = 0x1F,
        UnsupportedLlParameterValue = 0x20,
        LlResponseTimeout = 0x22,
        LlProcedureCollision = 0x23,
        InstantPassed = 0x28,
        DifferentTransactionCollision = 0x2A,
        ControllerBusy = 0x3A,
        UnacceptableConnectionParameters = 0x3B,
        AdvertisingTimeout = 0x3C,
        MicFailure = 0x3D,
        ConnectionFailedToEstablish = 0x3E,
    }
}

impl ErrorCode {
    /// Returns whether `self` is `Success`.
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Success => f.write_str("success"),
            ErrorCode::UnknownConnectionId => f.write_str("unknown connection identifier"),
            ErrorCode::PinOrKeyMissing => f.write_str("PIN or key missing"),
            ErrorCode::MemoryCapacityExceeded => f.write_str("memory capacity exceeded"),
            ErrorCode::ConnectionTimeout => f.write_str("connection timeout"),
            ErrorCode::CommandDisallowed => f.write_str("command disallowed"),
            ErrorCode::InvalidCommandParameters => f.write_str("invalid command parameters"),
            ErrorCode::RemoteUserTerminated => f.write_str("remote user terminated connection"),
            ErrorCode::LocalHostTerminated => f.write_str("connection terminated by local host"),
            ErrorCode::UnsupportedRemoteFeature => f.write_str("unsupported remote feature"),
            ErrorCode::InvalidLlParameters => f.write_str("invalid LL parameters"),
            ErrorCode::UnspecifiedError => f.write_str("unspecified error"),
            ErrorCode::UnsupportedLlParameterValue => {
                f.write_str("unsupported LL parameter value")
            }
            ErrorCode::LlResponseTimeout => f.write_str("LL response timeout"),
            ErrorCode::LlProcedureCollision => f.write_str("LL procedure collision"),
            ErrorCode::InstantPassed => f.write_str("instant passed"),
            ErrorCode::DifferentTransactionCollision => {
                f.write_str("different transaction collision")
            }
            ErrorCode::ControllerBusy => f.write_str("controller busy"),
            ErrorCode::UnacceptableConnectionParameters => {
                f.write_str("unacceptable connection parameters")
            }
            ErrorCode::AdvertisingTimeout => f.write_str("advertising timeout"),
            ErrorCode::MicFailure => f.write_str("connection terminated due to MIC failure"),
            ErrorCode::ConnectionFailedToEstablish => {
                f.write_str("connection failed to be established")
            }
            ErrorCode::Unknown(code) => write!(f, "unknown error code {:#04x}", code),
        }
    }
}

/// Reasons a host request to the controller can be refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    /// The connection handle does not refer to an established connection.
    UnknownConnection,

    /// A procedure of the requested kind (or one it cannot run alongside) is already pending.
    Busy,

    /// The supplied parameters are out of range or inconsistent.
    InvalidParameters,

    /// The request is not permitted in the connection's current role or state.
    Disallowed,

    /// A buffer or context pool is exhausted.
    NoMemory,

    /// The peer does not support the feature the request depends on.
    UnsupportedFeature,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestError::UnknownConnection => "unknown connection",
            RequestError::Busy => "procedure already pending",
            RequestError::InvalidParameters => "invalid parameters",
            RequestError::Disallowed => "request disallowed",
            RequestError::NoMemory => "out of memory",
            RequestError::UnsupportedFeature => "feature not supported by peer",
        })
    }
}

impl From<RequestError> for ErrorCode {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::UnknownConnection => ErrorCode::UnknownConnectionId,
            RequestError::Busy => ErrorCode::ControllerBusy,
            RequestError::InvalidParameters => ErrorCode::InvalidLlParameters,
            RequestError::Disallowed => ErrorCode::CommandDisallowed,
            RequestError::NoMemory => ErrorCode::MemoryCapacityExceeded,
            RequestError::UnsupportedFeature => ErrorCode::UnsupportedRemoteFeature,
        }
    }
}
