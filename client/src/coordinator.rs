//! The per-room coordinator: claims a slot, applies moves, reacts to pushed
//! snapshots and settles forfeits. One instance per joined room.

use std::sync::Arc;

use noughts_protocol::{
    cleanup_players, choose_slot, evaluate_board, should_start_round, Cell, GameStatus, Millis,
    RematchVotes, RoomState, Slot,
};
use noughts_store::DocumentStore;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    JOIN_RETRY_LIMIT, OPPONENT_DISCONNECT_GRACE_MS, RETRY_LIMIT, STALE_PLAYER_THRESHOLD_MS,
};
use crate::error::RoomError;
use crate::events::RoomEvent;
use crate::presence::{PresenceSignal, PresenceTracker};
use crate::profile::{ProfileStore, ACTIVE_ROOM_KEY};
use crate::rematch::RematchNegotiator;
use crate::rooms::{clear_slot, prune_room_if_empty, transact, ClearTarget, Txn};

/// Lifecycle of this client's participation in one room. Exactly one phase
/// holds at a time, which is what guarantees a single in-flight join or
/// leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Active,
    Leaving,
}

pub struct MatchCoordinator {
    store: Arc<dyn DocumentStore>,
    profile: Arc<dyn ProfileStore>,
    player_id: String,
    room: String,
    /// The slot this client currently holds. A plain mutex-guarded field so
    /// background tasks (heartbeat, sweeps) read it synchronously.
    my_slot: Arc<Mutex<Option<Slot>>>,
    phase: Mutex<SessionPhase>,
    /// Set once a snapshot has shown our id in the claimed slot; only then
    /// does its disappearance count as an eviction.
    slot_confirmed: Mutex<bool>,
    last_result_at: Mutex<Option<Millis>>,
    presence: PresenceTracker,
    rematch: RematchNegotiator,
    events: mpsc::UnboundedSender<RoomEvent>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MatchCoordinator {
    /// Attach to a room document and start consuming its change feed. The
    /// returned receiver carries every [`RoomEvent`] for the UI layer.
    pub fn connect(
        store: Arc<dyn DocumentStore>,
        profile: Arc<dyn ProfileStore>,
        player_id: String,
        room: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let my_slot = Arc::new(Mutex::new(None));
        let coordinator = Arc::new(MatchCoordinator {
            presence: PresenceTracker::new(
                store.clone(),
                room.clone(),
                player_id.clone(),
                my_slot.clone(),
            ),
            rematch: RematchNegotiator::new(store.clone(), room.clone()),
            store,
            profile,
            player_id,
            room,
            my_slot,
            phase: Mutex::new(SessionPhase::Idle),
            slot_confirmed: Mutex::new(false),
            last_result_at: Mutex::new(None),
            events,
            watch_task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&coordinator).run());
        *coordinator.watch_task.lock() = Some(task);
        (coordinator, events_rx)
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn my_slot(&self) -> Option<Slot> {
        *self.my_slot.lock()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.presence.set_foreground(foreground);
    }

    /// Claim a seat in the room. Returns the claimed slot, or `None` when a
    /// join or leave was already in flight (at most one join attempt runs
    /// at a time). `RoomFull` and `RoomNotFound` surface immediately;
    /// contention retries with backoff up to the join limit.
    pub async fn join(&self) -> Result<Option<Slot>, RoomError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                SessionPhase::Joining | SessionPhase::Leaving => return Ok(None),
                SessionPhase::Active => {
                    if let Some(slot) = *self.my_slot.lock() {
                        return Ok(Some(slot));
                    }
                    *phase = SessionPhase::Joining;
                }
                SessionPhase::Idle => *phase = SessionPhase::Joining,
            }
        }

        let player_id = self.player_id.clone();
        let claimed = transact(
            self.store.as_ref(),
            &self.room,
            JOIN_RETRY_LIMIT,
            move |state, now| {
                let Some(mut state) = state else {
                    return Err(RoomError::RoomNotFound);
                };
                // Anyone whose heartbeat aged out is treated as vacated and
                // cleared as part of this same claim.
                let cleaned = cleanup_players(&state.players, now, STALE_PLAYER_THRESHOLD_MS);
                let Some(slot) = choose_slot(&cleaned, &player_id) else {
                    return Err(RoomError::RoomFull);
                };
                let slot_was_empty = !cleaned.slot(slot).occupied();
                let opponent_active = cleaned.slot(slot.opponent()).occupied();
                state.players = cleaned;
                let presence = state.players.slot_mut(slot);
                presence.id = Some(player_id.clone());
                presence.last_seen = Some(now);

                // Reclaiming the vacated seat of a finished (forfeited) round
                // against a still-active opponent re-arms the next round.
                let rearm_after_forfeit = state.status == GameStatus::Finished
                    && slot_was_empty
                    && opponent_active;
                if should_start_round(&state) || rearm_after_forfeit {
                    state.start_round();
                }
                state.touch(now);
                Ok(Txn::Put(state, slot))
            },
        )
        .await;

        match claimed {
            Ok(slot) => {
                *self.my_slot.lock() = Some(slot);
                *self.slot_confirmed.lock() = false;
                *self.phase.lock() = SessionPhase::Active;
                info!(room = %self.room, %slot, "joined room");
                if let Err(err) = self.profile.set(ACTIVE_ROOM_KEY, &self.room).await {
                    warn!(error = %err, "failed to persist active room pointer");
                }
                self.presence.start_heartbeat();
                let _ = self.events.send(RoomEvent::SlotAssigned(slot));
                Ok(Some(slot))
            }
            Err(err) => {
                *self.phase.lock() = SessionPhase::Idle;
                Err(err)
            }
        }
    }

    /// Place this client's symbol on `cell`. A claim that no longer matches
    /// the stored round (not playing, not our turn, cell taken) is a silent
    /// no-op: the UI disabled the action optimistically and the race simply
    /// resolved the other way.
    pub async fn apply_move(&self, cell: usize) -> Result<(), RoomError> {
        let Some(slot) = *self.my_slot.lock() else {
            return Ok(());
        };
        if cell >= 9 {
            return Ok(());
        }
        transact(self.store.as_ref(), &self.room, RETRY_LIMIT, |state, now| {
            let Some(mut state) = state else {
                return Ok(Txn::Skip(()));
            };
            if state.status != GameStatus::Playing
                || state.current_turn != slot
                || state.board[cell] != Cell::Empty
            {
                return Ok(Txn::Skip(()));
            }
            state.board[cell] = Cell::from(slot);
            state.rematch_votes = RematchVotes::default();
            match evaluate_board(&state.board) {
                Some(winner) => {
                    state.status = GameStatus::Finished;
                    state.winner = Some(winner);
                    state.result_at = Some(now);
                }
                None => state.current_turn = slot.opponent(),
            }
            state.touch(now);
            Ok(Txn::Put(state, ()))
        })
        .await
    }

    /// Cast this client's rematch vote; see [`RematchNegotiator::vote`].
    pub async fn vote_rematch(&self) -> Result<(), RoomError> {
        let Some(slot) = *self.my_slot.lock() else {
            return Ok(());
        };
        self.rematch.vote(slot).await
    }

    /// Stop participating: release the seat, prune the room if that emptied
    /// it, drop the active-room pointer and tear every timer and
    /// subscription down. Cleanup failures are logged, never propagated.
    pub async fn leave(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Leaving {
                return;
            }
            *phase = SessionPhase::Leaving;
        }
        self.presence.stop_heartbeat();
        let slot = self.my_slot.lock().take();
        *self.slot_confirmed.lock() = false;

        let target = match slot {
            Some(slot) => ClearTarget::Slot(slot),
            None => ClearTarget::Player(self.player_id.clone()),
        };
        match clear_slot(self.store.as_ref(), &self.room, target, false).await {
            Ok(_) => {
                if let Err(err) = prune_room_if_empty(self.store.as_ref(), &self.room).await {
                    warn!(room = %self.room, error = %err, "failed to prune room on leave");
                }
            }
            Err(err) => warn!(room = %self.room, error = %err, "failed to release slot on leave"),
        }

        self.presence.reset();
        *self.last_result_at.lock() = None;
        if let Err(err) = self.profile.remove(ACTIVE_ROOM_KEY).await {
            warn!(error = %err, "failed to clear active room pointer");
        }
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        *self.phase.lock() = SessionPhase::Idle;
        info!(room = %self.room, "left room");
    }

    async fn run(self: Arc<Self>) {
        let mut feed = self.store.subscribe(&self.room);
        while let Some(snapshot) = feed.recv().await {
            match snapshot {
                Some(doc) => {
                    let state = RoomState::normalize(&doc);
                    self.handle_snapshot(&state);
                }
                None => {
                    if *self.phase.lock() != SessionPhase::Leaving {
                        debug!(room = %self.room, "room document disappeared");
                        let _ = self.events.send(RoomEvent::RoomClosed);
                    }
                    break;
                }
            }
        }
    }

    /// Re-derive everything from one pushed snapshot. The snapshot is the
    /// complete current truth; nothing here patches local state
    /// incrementally.
    fn handle_snapshot(&self, state: &RoomState) {
        let _ = self.events.send(RoomEvent::StateChanged(state.clone()));

        // Result edge: announce each terminal state once, and push the
        // disconnect grace deadline past it so the loser backing out for a
        // moment is not immediately declared gone.
        if state.status == GameStatus::Finished {
            if let Some(result_at) = state.result_at {
                let fresh = {
                    let mut last = self.last_result_at.lock();
                    if *last == Some(result_at) {
                        false
                    } else {
                        *last = Some(result_at);
                        true
                    }
                };
                if fresh {
                    self.presence
                        .arm_grace_at(result_at + OPPONENT_DISCONNECT_GRACE_MS);
                    if let Some(winner) = state.winner {
                        let _ = self.events.send(RoomEvent::RoundFinished { winner });
                    }
                }
            }
        }

        // Slot confirmation / eviction.
        let my = *self.my_slot.lock();
        if let Some(slot) = my {
            let ours = state.players.slot(slot).id.as_deref() == Some(self.player_id.as_str());
            if ours {
                *self.slot_confirmed.lock() = true;
            } else if *self.slot_confirmed.lock() {
                *self.my_slot.lock() = None;
                *self.slot_confirmed.lock() = false;
                self.presence.stop_heartbeat();
                self.presence.reset();
                *self.phase.lock() = SessionPhase::Idle;
                let _ = self.events.send(RoomEvent::SlotLost);
            }
        }

        let my = *self.my_slot.lock();
        match self.presence.observe(state, my) {
            Some(PresenceSignal::OpponentLeft { forfeit }) => {
                let _ = self.events.send(RoomEvent::OpponentLeft);
                if forfeit {
                    if let Some(slot) = my {
                        let store = self.store.clone();
                        let room = self.room.clone();
                        let opponent = slot.opponent();
                        tokio::spawn(async move {
                            if let Err(err) = clear_slot(
                                store.as_ref(),
                                &room,
                                ClearTarget::Slot(opponent),
                                true,
                            )
                            .await
                            {
                                warn!(room = %room, error = %err, "failed to forfeit opponent slot");
                            }
                        });
                    }
                }
            }
            Some(PresenceSignal::OpponentReturned) => {
                let _ = self.events.send(RoomEvent::OpponentReturned);
            }
            None => {}
        }
        self.presence.sweep_stale(state);
    }
}

/// Best-effort recovery after an unclean exit: if the profile still points
/// at a room, force-release whatever slot this player holds there, then
/// clear the pointer. Failures are logged; the next launch tries again.
pub async fn recover_orphaned_room(
    store: &Arc<dyn DocumentStore>,
    profile: &dyn ProfileStore,
    player_id: &str,
) {
    let pointer = match profile.get(ACTIVE_ROOM_KEY).await {
        Ok(pointer) => pointer,
        Err(err) => {
            warn!(error = %err, "failed to read active room pointer");
            return;
        }
    };
    let Some(room) = pointer else { return };
    match clear_slot(
        store.as_ref(),
        &room,
        ClearTarget::Player(player_id.to_string()),
        true,
    )
    .await
    {
        Ok(_) => {
            info!(room = %room, "released orphaned slot");
            if let Err(err) = profile.remove(ACTIVE_ROOM_KEY).await {
                warn!(error = %err, "failed to clear stale room pointer");
            }
        }
        Err(err) => warn!(room = %room, error = %err, "failed to release orphaned slot"),
    }
}
