use crate::calendar::CalendarError;

/// Message shown to the public when a slot could not be taken, whether the
/// slot filled up since it was listed or the admission lost a race.
pub const SLOT_TAKEN_MESSAGE: &str = "horário preenchido, escolha outro";

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input. Never retried automatically.
    InvalidArgument(String),
    /// Referenced business, service, appointment, block or client is absent.
    NotFound(String),
    /// Expected contention outcome: the interval cannot absorb the requested spots.
    CapacityExceeded { remaining: u32 },
    /// The admission could not be serialized (lock wait timed out). Nothing was
    /// written; safe to retry the whole admission once.
    Conflict(String),
    /// The write-ahead log could not be written.
    StoreUnavailable(String),
}

impl EngineError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// `CapacityExceeded` is a normal booking outcome, not a fault.
    pub fn is_business_outcome(&self) -> bool {
        matches!(self, EngineError::CapacityExceeded { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    /// Text for the public booking page: capacity and conflict look the same there.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::CapacityExceeded { .. } | EngineError::Conflict(_) => {
                SLOT_TAKEN_MESSAGE.to_string()
            }
            EngineError::StoreUnavailable(_) => "tente novamente mais tarde".to_string(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::CapacityExceeded { remaining } => {
                write!(f, "capacity exceeded: only {remaining} spot(s) left")
            }
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::InvalidArgument(e.to_string())
    }
}
