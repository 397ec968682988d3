//! Room listing, creation and pruning: everything the lobby needs.

use std::sync::Arc;

use noughts_protocol::{
    cleanup_players, generate_room_code, sanitize_room_code, LobbyRoom, RoomState, Slot,
};
use noughts_store::{Document, DocumentStore, StoreError, Write};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::ServerClock;
use crate::config::{
    EMPTY_ROOM_RETENTION_MS, LOBBY_RESWEEP_INTERVAL, MAX_ACTIVE_ROOMS, MAX_ROOM_CREATE_ATTEMPTS,
    ROOM_LIST_LIMIT, STALE_PLAYER_THRESHOLD_MS,
};
use crate::error::RoomError;
use crate::rooms::{clear_slot, prune_room_if_empty, ClearTarget};

pub struct RoomDirectory {
    store: Arc<dyn DocumentStore>,
    clock: ServerClock,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let clock = ServerClock::new(store.clone());
        RoomDirectory { store, clock }
    }

    /// Create a room under `desired` (when given) or a freshly generated
    /// code. The create is a commit against the absent document, so two
    /// clients racing for the same code cannot both win.
    pub async fn create_room(&self, desired: Option<&str>) -> Result<String, RoomError> {
        if self.active_room_count().await? >= MAX_ACTIVE_ROOMS {
            return Err(RoomError::RoomLimitReached(MAX_ACTIVE_ROOMS));
        }

        if let Some(desired) = desired.map(sanitize_room_code).filter(|c| !c.is_empty()) {
            if self.store.get(&desired).await?.is_some() {
                return Err(RoomError::RoomCodeTaken);
            }
            return match self.initialize_room(&desired).await {
                Ok(()) => Ok(desired),
                Err(RoomError::Store(StoreError::Contention)) => Err(RoomError::RoomCodeTaken),
                Err(err) => Err(err),
            };
        }

        for _ in 0..MAX_ROOM_CREATE_ATTEMPTS {
            let code = generate_room_code();
            if self.store.get(&code).await?.is_some() {
                continue;
            }
            match self.initialize_room(&code).await {
                Ok(()) => return Ok(code),
                // Someone else claimed the candidate first; try another.
                Err(RoomError::Store(StoreError::Contention)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RoomError::RoomCreateFailed)
    }

    async fn initialize_room(&self, code: &str) -> Result<(), RoomError> {
        let now = self.clock.now().await?;
        let mut state = RoomState::new_waiting();
        state.created_at = Some(now);
        state.touch(now);
        let doc = state.to_document().map_err(StoreError::from)?;
        self.store.commit(code, 0, Write::Put(doc)).await?;
        debug!(room = %code, "created room");
        Ok(())
    }

    /// Validate a code a player typed or tapped; returns the sanitized code.
    pub async fn find_room(&self, code: &str) -> Result<String, RoomError> {
        let code = sanitize_room_code(code);
        if code.is_empty() || self.store.get(&code).await?.is_none() {
            return Err(RoomError::RoomNotFound);
        }
        Ok(code)
    }

    pub async fn prune_room_if_empty(&self, code: &str) -> Result<bool, RoomError> {
        prune_room_if_empty(self.store.as_ref(), code).await
    }

    /// Rooms with at least one claimed slot, counted over the recent page.
    async fn active_room_count(&self) -> Result<usize, RoomError> {
        let recent = self.store.list_recent(MAX_ACTIVE_ROOMS + 5).await?;
        Ok(recent
            .iter()
            .map(|(_, doc)| RoomState::normalize(doc))
            .filter(|state| state.players.occupied_count() > 0)
            .count())
    }

    /// Subscribe to the lobby. Each incoming feed snapshot is re-derived in
    /// full: presence is filtered through the staleness threshold before
    /// anything is published, and cleanup of stale slots plus expired empty
    /// rooms is kicked off as a side effect (failures logged, never
    /// surfaced). Processing is serialized and coalescing: a snapshot that
    /// arrives mid-cycle replaces any queued one, so a burst collapses to
    /// the newest truth.
    pub fn watch_lobby(&self) -> LobbyWatch {
        let store = self.store.clone();
        let (tx, rx) = watch::channel(Vec::new());
        let task = tokio::spawn(async move {
            let mut feed = store.subscribe_recent(ROOM_LIST_LIMIT);
            let mut latest: Option<Vec<(String, Document)>> = None;
            let mut resweep = tokio::time::interval(LOBBY_RESWEEP_INTERVAL);
            resweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    snapshot = feed.recv() => {
                        let Some(mut snapshot) = snapshot else { break };
                        while let Ok(newer) = feed.try_recv() {
                            snapshot = newer;
                        }
                        latest = Some(snapshot);
                        process_snapshot(store.as_ref(), &tx, latest.as_deref().unwrap_or(&[])).await;
                    }
                    _ = resweep.tick() => {
                        if let Some(snapshot) = &latest {
                            process_snapshot(store.as_ref(), &tx, snapshot).await;
                        }
                    }
                }
            }
        });
        LobbyWatch { rx, task }
    }
}

/// Handle on the lobby subscription; dropping it tears the feed down.
pub struct LobbyWatch {
    rx: watch::Receiver<Vec<LobbyRoom>>,
    task: JoinHandle<()>,
}

impl LobbyWatch {
    pub fn rooms(&self) -> Vec<LobbyRoom> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published lobby view. Returns `false` once the
    /// feed has shut down.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl Drop for LobbyWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn process_snapshot(
    store: &dyn DocumentStore,
    tx: &watch::Sender<Vec<LobbyRoom>>,
    snapshot: &[(String, Document)],
) {
    let now = match store.server_now().await {
        Ok(now) => now,
        Err(err) => {
            warn!(error = %err, "could not fetch server time for lobby snapshot");
            return;
        }
    };

    let mut rooms = Vec::with_capacity(snapshot.len());
    let mut stale_slots: Vec<(String, Slot)> = Vec::new();
    let mut expired: Vec<String> = Vec::new();
    for (id, doc) in snapshot {
        let state = RoomState::normalize(doc);
        let effective = cleanup_players(&state.players, now, STALE_PLAYER_THRESHOLD_MS);
        for slot in Slot::ALL {
            if state.players.slot(slot).occupied() && !effective.slot(slot).occupied() {
                stale_slots.push((id.clone(), slot));
            }
        }
        if effective.both_empty() {
            let last_active = state.last_activity_at.or(state.result_at);
            if last_active.map_or(true, |at| now - at >= EMPTY_ROOM_RETENTION_MS) {
                expired.push(id.clone());
            }
        }
        rooms.push(LobbyRoom {
            id: id.clone(),
            status: state.status,
            players: effective,
            last_activity_at: state.last_activity_at,
        });
    }
    let _ = tx.send(rooms);

    for (id, slot) in stale_slots {
        if let Err(err) = clear_slot(store, &id, ClearTarget::Slot(slot), false).await {
            warn!(room = %id, %slot, error = %err, "failed to release stale slot from lobby");
        }
    }
    for id in expired {
        if let Err(err) = prune_room_if_empty(store, &id).await {
            warn!(room = %id, error = %err, "failed to prune expired room");
        }
    }
}
