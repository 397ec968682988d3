//! Heartbeat emission and opponent liveness tracking for the slot this
//! client occupies.
//!
//! Liveness is evaluated against timestamps the store itself stamped: the
//! heartbeat loop writes store-anchored `lastSeen` values, and the watcher
//! judges them against `RoomState::latest_server_timestamp` of each pushed
//! snapshot. Local clocks never enter the math. Because every heartbeat
//! mutates the room document, the snapshot feed ticks at least at heartbeat
//! cadence while anyone is seated, which is what drives the grace-deadline
//! checks below.

use std::collections::HashSet;
use std::sync::Arc;

use noughts_protocol::{GameStatus, Millis, RoomState, Slot};
use noughts_store::DocumentStore;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{
    HEARTBEAT_INTERVAL, OPPONENT_DISCONNECT_GRACE_MS, RETRY_LIMIT, STALE_PLAYER_THRESHOLD_MS,
};
use crate::error::RoomError;
use crate::rooms::{clear_slot, transact, ClearTarget, Txn};

/// What the watcher concluded from one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// The opponent's heartbeat stopped past the grace deadline. `forfeit`
    /// is set while a round was running, in which case their slot must be
    /// force-released so the remaining player is awarded the win.
    OpponentLeft { forfeit: bool },
    /// The opponent reappeared with a newer heartbeat after having been
    /// declared gone; the local disconnected override is cleared.
    OpponentReturned,
}

#[derive(Default)]
struct OpponentWatch {
    previous_opponent: Option<String>,
    last_heartbeat: Option<Millis>,
    grace_until: Millis,
    override_active: bool,
    alerted_opponent: Option<String>,
}

pub struct PresenceTracker {
    store: Arc<dyn DocumentStore>,
    room: String,
    player_id: String,
    my_slot: Arc<Mutex<Option<Slot>>>,
    foreground: watch::Sender<bool>,
    beat_task: Mutex<Option<JoinHandle<()>>>,
    watch: Mutex<OpponentWatch>,
    clearing: Arc<Mutex<HashSet<Slot>>>,
}

impl PresenceTracker {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        room: String,
        player_id: String,
        my_slot: Arc<Mutex<Option<Slot>>>,
    ) -> Self {
        PresenceTracker {
            store,
            room,
            player_id,
            my_slot,
            foreground: watch::channel(true).0,
            beat_task: Mutex::new(None),
            watch: Mutex::new(OpponentWatch::default()),
            clearing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Begin heartbeating the occupied slot: once immediately, then on the
    /// fixed interval while the client stays in the foreground. Backgrounding
    /// pauses the loop; returning to the foreground beats again at once.
    pub fn start_heartbeat(&self) {
        self.stop_heartbeat();
        let store = self.store.clone();
        let room = self.room.clone();
        let player_id = self.player_id.clone();
        let my_slot = self.my_slot.clone();
        let mut foreground = self.foreground.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                if !*foreground.borrow() {
                    if foreground.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                if let Err(err) = send_heartbeat(store.as_ref(), &room, &player_id, &my_slot).await
                {
                    warn!(room = %room, error = %err, "heartbeat write failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    changed = foreground.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        *self.beat_task.lock() = Some(handle);
    }

    pub fn stop_heartbeat(&self) {
        if let Some(task) = self.beat_task.lock().take() {
            task.abort();
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.send_replace(foreground);
    }

    /// Move the grace deadline outright, e.g. right after a round result so
    /// a leaver is not instantly re-declared disconnected.
    pub(crate) fn arm_grace_at(&self, until: Millis) {
        self.watch.lock().grace_until = until;
    }

    /// Feed one pushed room snapshot through the opponent watcher.
    pub(crate) fn observe(&self, state: &RoomState, my_slot: Option<Slot>) -> Option<PresenceSignal> {
        let mut watch = self.watch.lock();
        let Some(my) = my_slot else {
            watch.previous_opponent = None;
            watch.last_heartbeat = None;
            return None;
        };
        let now = state.latest_server_timestamp();
        let opponent = state.players.slot(my.opponent());

        if let Some(opponent_id) = &opponent.id {
            let fresh_heartbeat = opponent.last_seen.is_some()
                && (watch.last_heartbeat.is_none() || opponent.last_seen > watch.last_heartbeat);
            watch.last_heartbeat = opponent.last_seen;
            watch.previous_opponent = Some(opponent_id.clone());
            if fresh_heartbeat {
                if let Some(now) = now {
                    watch.grace_until = now + OPPONENT_DISCONNECT_GRACE_MS;
                }
            }
            if watch.override_active && watch.alerted_opponent.is_some() && !fresh_heartbeat {
                // Same stalled occupant we already declared gone.
                return None;
            }
            let was_overridden = watch.override_active;
            watch.override_active = false;
            watch.alerted_opponent = None;
            return was_overridden.then_some(PresenceSignal::OpponentReturned);
        }

        let Some(now) = now else {
            watch.previous_opponent = None;
            return None;
        };
        let previous = watch.previous_opponent.take();
        let heartbeat_stalled = match (watch.last_heartbeat, opponent.last_seen) {
            (Some(prev), Some(current)) => current <= prev,
            _ => true,
        };
        let declare = previous.is_some() && heartbeat_stalled && now >= watch.grace_until;
        if declare && watch.alerted_opponent != previous {
            watch.alerted_opponent = previous;
            watch.override_active = true;
            return Some(PresenceSignal::OpponentLeft {
                forfeit: state.status == GameStatus::Playing,
            });
        }
        None
    }

    /// Release any slot whose heartbeat aged past the staleness threshold.
    /// One clear per slot may be in flight at a time; failures are logged
    /// and never interrupt the game.
    pub(crate) fn sweep_stale(&self, state: &RoomState) {
        let Some(now) = state.latest_server_timestamp() else {
            return;
        };
        // Right after a result everyone stops heartbeating while the rematch
        // prompt is up; hold off so the finished room is not torn down.
        if state.status == GameStatus::Finished {
            if let Some(result_at) = state.result_at {
                if now - result_at < STALE_PLAYER_THRESHOLD_MS {
                    return;
                }
            }
        }
        for slot in Slot::ALL {
            let info = state.players.slot(slot);
            let stale = matches!(
                (&info.id, info.last_seen),
                (Some(_), Some(seen)) if now - seen > STALE_PLAYER_THRESHOLD_MS
            );
            if !stale {
                continue;
            }
            if !self.clearing.lock().insert(slot) {
                continue;
            }
            let store = self.store.clone();
            let room = self.room.clone();
            let clearing = self.clearing.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    clear_slot(store.as_ref(), &room, ClearTarget::Slot(slot), false).await
                {
                    warn!(room = %room, %slot, error = %err, "failed to release stale slot");
                }
                clearing.lock().remove(&slot);
            });
        }
    }

    pub(crate) fn reset(&self) {
        *self.watch.lock() = OpponentWatch::default();
        self.clearing.lock().clear();
    }
}

/// Refresh this client's own presence. Skips silently when the room is gone,
/// the slot moved mid-retry, or someone else holds it now.
async fn send_heartbeat(
    store: &dyn DocumentStore,
    room: &str,
    player_id: &str,
    my_slot: &Mutex<Option<Slot>>,
) -> Result<(), RoomError> {
    let Some(slot) = *my_slot.lock() else {
        return Ok(());
    };
    transact(store, room, RETRY_LIMIT, |state, now| {
        if *my_slot.lock() != Some(slot) {
            return Ok(Txn::Skip(()));
        }
        let Some(mut state) = state else {
            return Ok(Txn::Skip(()));
        };
        if let Some(occupant) = state.players.slot(slot).id.as_deref() {
            if occupant != player_id {
                return Ok(Txn::Skip(()));
            }
        }
        let presence = state.players.slot_mut(slot);
        presence.id = Some(player_id.to_string());
        presence.last_seen = Some(now);
        state.touch(now);
        Ok(Txn::Put(state, ()))
    })
    .await
}
