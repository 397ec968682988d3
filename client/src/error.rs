use noughts_store::StoreError;
use thiserror::Error;

/// Everything a room operation can fail with. Store contention is the only
/// retryable case; the rest map directly to user-facing outcomes and are
/// surfaced immediately.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("room code already taken")]
    RoomCodeTaken,
    #[error("could not allocate an unused room code")]
    RoomCreateFailed,
    #[error("active room limit of {0} reached")]
    RoomLimitReached(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RoomError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoomError::Store(err) if err.is_retryable())
    }
}
