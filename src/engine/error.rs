use ulid::Ulid;

use crate::model::SlotKey;

/// Coarse classification callers use to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a request the current state can't honour. Never retried.
    Validation,
    NotFound,
    /// The store could not make progress or confirm a write (I/O failure, timeout).
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid slot {slot}: {reason}")]
    InvalidSlot { slot: SlotKey, reason: &'static str },
    #[error("slot not found: {0}")]
    SlotNotFound(SlotKey),
    #[error("slot already exists: {0}")]
    SlotExists(SlotKey),
    #[error("user {user_id} already holds confirmed booking {booking_id}")]
    DuplicateActiveBooking { user_id: String, booking_id: Ulid },
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("booking {0} is not active")]
    BookingNotActive(Ulid),
    #[error("booking {0} is already on that slot")]
    SameSlot(Ulid),
    #[error("slot {0} has no seats left")]
    SlotFull(SlotKey),
    #[error("slot {0} still has seats; book it instead")]
    SlotNotFull(SlotKey),
    #[error("user {user_id} is already waitlisted on {slot}")]
    AlreadyWaitlisted { user_id: String, slot: SlotKey },
    #[error("waitlist entry not found: {0}")]
    WaitlistEntryNotFound(Ulid),
    #[error("cannot set capacity of {slot} to {requested}: {booked} seats already booked")]
    CapacityBelowBooked { slot: SlotKey, booked: u32, requested: u32 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The write reached the WAL but its flush failed. The commit may or may not
    /// survive a restart.
    #[error("write outcome unknown: {0}")]
    OutcomeUnknown(String),
    #[error("commit timed out; it is still queued and may be applied")]
    CommitTimeout,
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidSlot { .. }
            | EngineError::SlotExists(_)
            | EngineError::DuplicateActiveBooking { .. }
            | EngineError::BookingNotActive(_)
            | EngineError::SameSlot(_)
            | EngineError::SlotFull(_)
            | EngineError::SlotNotFull(_)
            | EngineError::AlreadyWaitlisted { .. }
            | EngineError::CapacityBelowBooked { .. }
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::SlotNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::WaitlistEntryNotFound(_) => ErrorKind::NotFound,
            EngineError::StoreUnavailable(_)
            | EngineError::OutcomeUnknown(_)
            | EngineError::CommitTimeout => ErrorKind::Unavailable,
            EngineError::Invariant(_) => ErrorKind::Internal,
        }
    }
}
