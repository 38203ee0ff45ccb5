//! Error kinds shared by the registry, dispatcher and client
//!
//! Every variant maps to a stable negative code so a failure can travel in a
//! `REPLY` payload and be rebuilt on the other side of the socket.

/// Errors surfaced by registry operations and relayed to clients
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("unknown message tag {0}")]
    UnknownMessage(u32),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("no such entry")]
    NotFound,

    #[error("combination not supported by the input device")]
    CapabilityNotSupported,

    #[error("combination is reserved by the system")]
    OccupiedBySystem,

    #[error("combination is held by another client")]
    OccupiedByOther,

    #[error("session is gone")]
    SessionGone,
}

pub type Result<T> = std::result::Result<T, InputError>;

impl InputError {
    /// Negative wire code for this error
    pub fn code(&self) -> i32 {
        match self {
            InputError::MalformedPayload(_) => -1,
            InputError::UnknownMessage(_) => -2,
            InputError::InvalidParameter(_) => -3,
            InputError::NotFound => -4,
            InputError::CapabilityNotSupported => -5,
            InputError::OccupiedBySystem => -6,
            InputError::OccupiedByOther => -7,
            InputError::SessionGone => -8,
        }
    }

    /// Rebuild an error from a wire code. Details carried by the variant are
    /// not transmitted, so a generic description is substituted.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -1 => InputError::MalformedPayload("rejected by peer"),
            -2 => InputError::UnknownMessage(0),
            -3 => InputError::InvalidParameter("rejected by peer"),
            -4 => InputError::NotFound,
            -5 => InputError::CapabilityNotSupported,
            -6 => InputError::OccupiedBySystem,
            -7 => InputError::OccupiedByOther,
            -8 => InputError::SessionGone,
            _ => return None,
        };
        Some(err)
    }
}

/// Split a reply value into its success value or the error it encodes
pub fn result_from_code(value: i32) -> Result<i32> {
    if value >= 0 {
        return Ok(value);
    }
    Err(InputError::from_code(value).unwrap_or(InputError::MalformedPayload("unknown error code")))
}
