use ulid::Ulid;

use crate::store::StoreError;

/// Why a write lost. Callers see a single `Conflict` kind; the cause feeds logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCause {
    /// A CONFIRMED appointment overlaps the requested interval.
    Overlap,
    /// The exact slot row is already CONFIRMED.
    SlotTaken,
    /// The row changed between read and write.
    LostUpdate,
    /// Another request inserted the same `(doctor, start)` row first.
    UniqueViolation,
}

impl ConflictCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCause::Overlap => "overlap",
            ConflictCause::SlotTaken => "slot_taken",
            ConflictCause::LostUpdate => "lost_update",
            ConflictCause::UniqueViolation => "unique_violation",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ConflictCause::Overlap | ConflictCause::SlotTaken => "slot already booked",
            ConflictCause::LostUpdate | ConflictCause::UniqueViolation => {
                "slot booked by another request"
            }
        }
    }
}

impl std::fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Conflict(ConflictCause),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn conflict_cause(&self) -> Option<ConflictCause> {
        match self {
            EngineError::Conflict(cause) => Some(*cause),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(_) => EngineError::Conflict(ConflictCause::UniqueViolation),
            StoreError::VersionConflict { .. } => EngineError::Conflict(ConflictCause::LostUpdate),
            StoreError::RangeOverlap(_) => EngineError::Conflict(ConflictCause::Overlap),
            StoreError::UnknownDoctor(id) | StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            other @ (StoreError::NothingStaged(_) | StoreError::Wal(_)) => EngineError::Store(other),
        }
    }
}
