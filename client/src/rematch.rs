//! Vote collection and atomic round restart after a finished round.

use std::sync::Arc;

use noughts_protocol::{should_auto_start_rematch, GameStatus, Slot};
use noughts_store::DocumentStore;

use crate::config::RETRY_LIMIT;
use crate::error::RoomError;
use crate::rooms::{transact, Txn};

pub struct RematchNegotiator {
    store: Arc<dyn DocumentStore>,
    room: String,
}

impl RematchNegotiator {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, room: String) -> Self {
        RematchNegotiator { store, room }
    }

    /// Record a rematch vote for `slot`. Re-voting is harmless. Once both
    /// slots have voted and both are still occupied, the same commit resets
    /// the board, flips status back to playing and hands the opening move to
    /// the alternated starter. A vote cast while the opponent's slot is
    /// empty records but does not restart.
    pub async fn vote(&self, slot: Slot) -> Result<(), RoomError> {
        transact(self.store.as_ref(), &self.room, RETRY_LIMIT, |state, now| {
            let Some(mut state) = state else {
                return Ok(Txn::Skip(()));
            };
            if state.status != GameStatus::Finished || !state.players.slot(slot).occupied() {
                return Ok(Txn::Skip(()));
            }
            state.rematch_votes.set(slot, true);
            state.updated_at = Some(now);
            if should_auto_start_rematch(&state.rematch_votes) && state.players.both_occupied() {
                state.start_round();
                state.touch(now);
            }
            Ok(Txn::Put(state, ()))
        })
        .await
    }
}
