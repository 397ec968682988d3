//! Shared transactional room mutations. Every state-dependent write in the
//! system funnels through [`transact`]: read the versioned document, decide
//! on the freshest normalized copy, commit against the version that was
//! read, and retry with backoff when another client won the race.

use std::time::Duration;

use noughts_protocol::{GameStatus, Millis, PlayerPresence, RoomState, Slot};
use noughts_store::{DocumentStore, StoreError, Write};

use crate::config::{EMPTY_ROOM_RETENTION_MS, RETRY_BASE_DELAY, RETRY_LIMIT};
use crate::error::RoomError;

/// Decision produced by a transaction closure.
pub(crate) enum Txn<T> {
    /// Commit this state as the new document.
    Put(RoomState, T),
    /// Delete the document.
    Delete(T),
    /// Leave the document alone. Validation failures against a stale local
    /// view land here: they are expected races, not errors.
    Skip(T),
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt)
}

/// Run one atomic read-modify-write cycle against a room document, retrying
/// store contention up to `attempts` times. The closure sees the normalized
/// current state (`None` when the document is absent) and the store-anchored
/// now that the cycle was read at.
pub(crate) async fn transact<T, F>(
    store: &dyn DocumentStore,
    room: &str,
    attempts: u32,
    mut f: F,
) -> Result<T, RoomError>
where
    F: FnMut(Option<RoomState>, Millis) -> Result<Txn<T>, RoomError>,
{
    let mut attempt = 0;
    loop {
        let read = store.get_versioned(room).await?;
        let now = store.server_now().await?;
        let state = read.doc.as_ref().map(RoomState::normalize);
        let (write, value) = match f(state, now)? {
            Txn::Skip(value) => return Ok(value),
            Txn::Put(next, value) => {
                let doc = next.to_document().map_err(StoreError::from)?;
                (Write::Put(doc), value)
            }
            Txn::Delete(value) => (Write::Delete, value),
        };
        match store.commit(room, read.version, write).await {
            Ok(()) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Whose slot a release targets: a known slot, or whichever slot a player
/// id currently occupies (used for orphan recovery after an unclean exit).
#[derive(Debug, Clone)]
pub(crate) enum ClearTarget {
    Slot(Slot),
    Player(String),
}

/// Release one slot and settle the round accordingly. While a round is
/// running and the opponent is still connected (or when `force_forfeit` is
/// set) the remaining player is awarded the win; a release with no round at
/// stake just resets the room to waiting. Releasing the last occupant
/// deletes the document in the same commit.
pub(crate) async fn clear_slot(
    store: &dyn DocumentStore,
    room: &str,
    target: ClearTarget,
    force_forfeit: bool,
) -> Result<Option<Slot>, RoomError> {
    transact(store, room, RETRY_LIMIT, move |state, now| {
        let Some(mut state) = state else {
            return Ok(Txn::Skip(None));
        };
        let slot = match &target {
            ClearTarget::Slot(slot) => *slot,
            ClearTarget::Player(player_id) => match state.players.slot_of(player_id) {
                Some(slot) => slot,
                None => return Ok(Txn::Skip(None)),
            },
        };
        let occupied = state.players.slot(slot).occupied();
        if !occupied && !force_forfeit {
            return Ok(Txn::Skip(None));
        }
        let opponent = slot.opponent();
        let opponent_connected = state.players.slot(opponent).occupied();

        *state.players.slot_mut(slot) = PlayerPresence::vacant();
        if state.players.both_empty() {
            return Ok(Txn::Delete(Some(slot)));
        }

        let forfeit = state.status == GameStatus::Playing
            && state.winner.is_none()
            && (opponent_connected || force_forfeit);
        if forfeit {
            state.status = GameStatus::Finished;
            state.winner = Some(opponent.into());
            state.result_at = Some(now);
            state.rematch_votes.set(slot, false);
        } else {
            state.reset_waiting();
        }
        state.touch(now);
        Ok(Txn::Put(state, Some(slot)))
    })
    .await
}

/// Delete the room only if it is still empty and past the retention window
/// at commit time. The empty-check runs inside the same transaction as the
/// delete, so a claim racing this prune cannot be lost.
pub(crate) async fn prune_room_if_empty(
    store: &dyn DocumentStore,
    room: &str,
) -> Result<bool, RoomError> {
    transact(store, room, RETRY_LIMIT, |state, now| {
        let Some(state) = state else {
            return Ok(Txn::Skip(false));
        };
        if !state.players.both_empty() {
            return Ok(Txn::Skip(false));
        }
        let last_active = state.last_activity_at.or(state.result_at);
        match last_active {
            Some(at) if now - at < EMPTY_ROOM_RETENTION_MS => Ok(Txn::Skip(false)),
            _ => Ok(Txn::Delete(true)),
        }
    })
    .await
}
