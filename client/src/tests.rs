use std::sync::Arc;
use std::time::Duration;

use noughts_protocol::{Cell, GameStatus, GameWinner, PlayerPresence, RoomState, Slot};
use noughts_store::{DocumentStore, MemoryStore};
use tokio::sync::mpsc;

use crate::config::{EMPTY_ROOM_RETENTION_MS, MAX_ACTIVE_ROOMS, STALE_PLAYER_THRESHOLD_MS};
use crate::coordinator::{recover_orphaned_room, MatchCoordinator, SessionPhase};
use crate::directory::RoomDirectory;
use crate::error::RoomError;
use crate::events::RoomEvent;
use crate::profile::{MemoryProfileStore, ProfileStore, ACTIVE_ROOM_KEY};

/// The concrete handle keeps the clock-skew knob reachable; the trait object
/// is what the components under test see.
fn shared_store() -> (MemoryStore, Arc<dyn DocumentStore>) {
    let mem = MemoryStore::new();
    (mem.clone(), Arc::new(mem))
}

fn connect(
    store: &Arc<dyn DocumentStore>,
    player: &str,
    room: &str,
) -> (Arc<MatchCoordinator>, mpsc::UnboundedReceiver<RoomEvent>) {
    MatchCoordinator::connect(
        store.clone(),
        Arc::new(MemoryProfileStore::new()),
        player.to_string(),
        room.to_string(),
    )
}

async fn room_state(store: &Arc<dyn DocumentStore>, room: &str) -> Option<RoomState> {
    store
        .get(room)
        .await
        .unwrap()
        .as_ref()
        .map(RoomState::normalize)
}

/// Poll until `cond` holds, giving spawned cleanup tasks time to land.
async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_event<F>(rx: &mut mpsc::UnboundedReceiver<RoomEvent>, mut pred: F)
where
    F: FnMut(&RoomEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event not delivered in time");
}

mod joining {
    use super::*;

    #[tokio::test]
    async fn sequential_joins_assign_x_then_o_and_start_the_round() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _alice_rx) = connect(&store, "alice", &room);
        assert_eq!(alice.join().await.unwrap(), Some(Slot::X));
        assert_eq!(alice.phase(), SessionPhase::Active);

        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Waiting);

        let (bob, _bob_rx) = connect(&store, "bob", &room);
        assert_eq!(bob.join().await.unwrap(), Some(Slot::O));

        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Playing);
        assert_eq!(state.current_turn, Slot::X);
        assert_eq!(state.next_starter, Slot::O);
        assert_eq!(state.players.x.id.as_deref(), Some("alice"));
        assert_eq!(state.players.o.id.as_deref(), Some("bob"));

        alice.leave().await;
        bob.leave().await;
    }

    #[tokio::test]
    async fn a_third_identity_is_rejected_without_retry() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _a) = connect(&store, "alice", &room);
        let (bob, _b) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();

        let (carol, _c) = connect(&store, "carol", &room);
        assert!(matches!(carol.join().await, Err(RoomError::RoomFull)));
        assert_eq!(carol.phase(), SessionPhase::Idle);

        alice.leave().await;
        bob.leave().await;
    }

    #[tokio::test]
    async fn joining_a_missing_room_fails_immediately() {
        let (_mem, store) = shared_store();
        let (alice, _rx) = connect(&store, "alice", "QQQQQ");
        assert!(matches!(alice.join().await, Err(RoomError::RoomNotFound)));
    }

    #[tokio::test]
    async fn rejoining_returns_the_held_slot() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _rx) = connect(&store, "alice", &room);
        assert_eq!(alice.join().await.unwrap(), Some(Slot::X));
        assert_eq!(alice.join().await.unwrap(), Some(Slot::X));

        alice.leave().await;
    }
}

mod rounds {
    use super::*;

    #[tokio::test]
    async fn a_scripted_round_plays_to_a_win_and_rematches_with_the_other_opener() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, mut alice_rx) = connect(&store, "alice", &room);
        let (bob, _bob_rx) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();

        // Out-of-turn taps resolve as silent no-ops.
        bob.apply_move(0).await.unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.current_turn, Slot::X);
        assert_eq!(state.board, noughts_protocol::empty_board());

        alice.apply_move(0).await.unwrap();
        // So does tapping an already occupied cell.
        bob.apply_move(0).await.unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.board[0], Cell::X);
        assert_eq!(state.current_turn, Slot::O);

        bob.apply_move(3).await.unwrap();
        alice.apply_move(1).await.unwrap();
        bob.apply_move(4).await.unwrap();
        alice.apply_move(2).await.unwrap();

        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Finished);
        assert_eq!(state.winner, Some(GameWinner::X));
        assert!(state.result_at.is_some());
        assert!(!state.rematch_votes.x && !state.rematch_votes.o);

        wait_for_event(&mut alice_rx, |event| {
            matches!(event, RoomEvent::RoundFinished { winner: GameWinner::X })
        })
        .await;

        // One vote records but does not restart.
        alice.vote_rematch().await.unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert!(state.rematch_votes.x);
        assert_eq!(state.status, GameStatus::Finished);

        // The second vote restarts atomically with the opener flipped.
        bob.vote_rematch().await.unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Playing);
        assert_eq!(state.board, noughts_protocol::empty_board());
        assert_eq!(state.current_turn, Slot::O);
        assert_eq!(state.next_starter, Slot::X);
        assert!(!state.rematch_votes.x && !state.rematch_votes.o);

        alice.leave().await;
        bob.leave().await;
    }

    #[tokio::test]
    async fn a_full_board_without_a_line_is_a_draw() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _a) = connect(&store, "alice", &room);
        let (bob, _b) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();

        // X: 0 1 5 6 8, O: 2 3 4 7; no line for either side.
        for (who, cell) in [
            (&alice, 0),
            (&bob, 2),
            (&alice, 1),
            (&bob, 3),
            (&alice, 5),
            (&bob, 4),
            (&alice, 6),
            (&bob, 7),
            (&alice, 8),
        ] {
            who.apply_move(cell).await.unwrap();
        }

        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Finished);
        assert_eq!(state.winner, Some(GameWinner::Draw));

        alice.leave().await;
        bob.leave().await;
    }
}

mod presence {
    use super::*;
    use crate::rooms::{clear_slot, ClearTarget};

    #[tokio::test]
    async fn a_stale_opponent_is_swept_and_the_round_forfeited() {
        let (mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, mut alice_rx) = connect(&store, "alice", &room);
        let (bob, _bob_rx) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        drain_events(&mut alice_rx);

        // Bob's device goes dark: his heartbeat freezes while the server
        // clock moves past the staleness threshold.
        bob.set_foreground(false);
        mem.advance(STALE_PLAYER_THRESHOLD_MS + 5_000);

        // Alice's next heartbeat-equivalent write pushes a snapshot whose
        // timestamps expose bob as stale.
        let mut state = room_state(&store, &room).await.unwrap();
        let now = store.server_now().await.unwrap();
        state.players.x.last_seen = Some(now);
        state.touch(now);
        store.put(&room, state.to_document().unwrap()).await.unwrap();

        wait_for(|| async {
            room_state(&store, &room)
                .await
                .map(|state| {
                    state.status == GameStatus::Finished
                        && state.winner == Some(GameWinner::X)
                        && !state.players.o.occupied()
                })
                .unwrap_or(false)
        })
        .await;

        // A vote with the opponent's slot empty records but cannot restart.
        alice.vote_rematch().await.unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert!(state.rematch_votes.x);
        assert_eq!(state.status, GameStatus::Finished);

        alice.leave().await;
    }

    #[tokio::test]
    async fn opponent_walking_away_after_a_finished_round_raises_the_alert() {
        let (mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, mut alice_rx) = connect(&store, "alice", &room);
        let (bob, _bob_rx) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();

        for (who, cell) in [(&alice, 0), (&bob, 3), (&alice, 1), (&bob, 4), (&alice, 2)] {
            who.apply_move(cell).await.unwrap();
        }
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.winner, Some(GameWinner::X));
        drain_events(&mut alice_rx);

        // Bob never votes and walks away; well past both the post-result
        // sweep holdoff and the grace window, his slot is released and the
        // room falls back to waiting, which is what raises the alert.
        bob.set_foreground(false);
        mem.advance(STALE_PLAYER_THRESHOLD_MS + 2_000);
        let mut state = room_state(&store, &room).await.unwrap();
        let now = store.server_now().await.unwrap();
        state.players.x.last_seen = Some(now);
        state.updated_at = Some(now);
        store.put(&room, state.to_document().unwrap()).await.unwrap();

        wait_for(|| async {
            room_state(&store, &room)
                .await
                .map(|state| state.status == GameStatus::Waiting && !state.players.o.occupied())
                .unwrap_or(false)
        })
        .await;
        wait_for_event(&mut alice_rx, |event| matches!(event, RoomEvent::OpponentLeft)).await;

        alice.leave().await;
    }

    #[tokio::test]
    async fn reclaiming_a_forfeited_room_rearms_the_round() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _a) = connect(&store, "alice", &room);
        let (bob, _b) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();

        // Bob drops mid-round and his slot is force-released.
        bob.set_foreground(false);
        clear_slot(store.as_ref(), &room, ClearTarget::Slot(Slot::O), true)
            .await
            .unwrap();
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Finished);
        assert_eq!(state.winner, Some(GameWinner::X));

        // The first round opened with X, so the re-armed one opens with O.
        let (bob2, _b2) = connect(&store, "bob", &room);
        assert_eq!(bob2.join().await.unwrap(), Some(Slot::O));
        let state = room_state(&store, &room).await.unwrap();
        assert_eq!(state.status, GameStatus::Playing);
        assert_eq!(state.current_turn, Slot::O);
        assert_eq!(state.next_starter, Slot::X);
        assert_eq!(state.winner, None);

        alice.leave().await;
        bob2.leave().await;
    }

    #[tokio::test]
    async fn leaving_a_waiting_room_deletes_it_once_empty() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let profile = Arc::new(MemoryProfileStore::new());
        let (alice, _rx) = MatchCoordinator::connect(
            store.clone(),
            profile.clone(),
            "alice".to_string(),
            room.clone(),
        );
        alice.join().await.unwrap();
        assert_eq!(
            profile.get(ACTIVE_ROOM_KEY).await.unwrap(),
            Some(room.clone())
        );

        alice.leave().await;
        assert_eq!(room_state(&store, &room).await, None);
        assert_eq!(profile.get(ACTIVE_ROOM_KEY).await.unwrap(), None);
        assert_eq!(alice.my_slot(), None);
    }

    #[tokio::test]
    async fn orphan_recovery_forfeits_the_abandoned_slot() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        let (alice, _a) = connect(&store, "alice", &room);
        let (bob, _b) = connect(&store, "bob", &room);
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        bob.set_foreground(false);

        // Bob's next launch finds the stale pointer and releases his seat.
        let profile = MemoryProfileStore::new();
        profile.set(ACTIVE_ROOM_KEY, &room).await.unwrap();
        recover_orphaned_room(&store, &profile, "bob").await;

        let state = room_state(&store, &room).await.unwrap();
        assert!(!state.players.o.occupied());
        assert_eq!(state.status, GameStatus::Finished);
        assert_eq!(state.winner, Some(GameWinner::X));
        assert_eq!(profile.get(ACTIVE_ROOM_KEY).await.unwrap(), None);

        alice.leave().await;
    }
}

mod lobby {
    use super::*;

    #[tokio::test]
    async fn desired_codes_are_claimed_once() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());

        let code = directory.create_room(Some("my room 7")).await.unwrap();
        assert_eq!(code, "MYROOM7");
        assert!(matches!(
            directory.create_room(Some("myroom7")).await,
            Err(RoomError::RoomCodeTaken)
        ));
    }

    #[tokio::test]
    async fn find_room_sanitizes_and_rejects_unknown_codes() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let code = directory.create_room(None).await.unwrap();

        let typed = format!(" {} ", code.to_lowercase());
        assert_eq!(directory.find_room(&typed).await.unwrap(), code);
        assert!(matches!(
            directory.find_room("ZZZZ9").await,
            Err(RoomError::RoomNotFound)
        ));
        assert!(matches!(
            directory.find_room("!!!").await,
            Err(RoomError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn the_active_room_cap_blocks_creation() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let now = store.server_now().await.unwrap();

        for i in 0..MAX_ACTIVE_ROOMS {
            let mut state = RoomState::new_waiting();
            state.players.x = PlayerPresence {
                id: Some(format!("player-{i}")),
                last_seen: Some(now),
            };
            state.touch(now);
            store
                .put(&format!("ROOM{i}"), state.to_document().unwrap())
                .await
                .unwrap();
        }

        assert!(matches!(
            directory.create_room(None).await,
            Err(RoomError::RoomLimitReached(_))
        ));

        // Empty rooms do not count against the cap.
        store.delete("ROOM0").await.unwrap();
        let mut idle = RoomState::new_waiting();
        idle.touch(now);
        store.put("IDLE1", idle.to_document().unwrap()).await.unwrap();
        assert!(directory.create_room(None).await.is_ok());
    }

    #[tokio::test]
    async fn prune_honors_the_retention_window() {
        let (mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let room = directory.create_room(None).await.unwrap();

        assert!(!directory.prune_room_if_empty(&room).await.unwrap());
        assert!(room_state(&store, &room).await.is_some());

        mem.advance(EMPTY_ROOM_RETENTION_MS + 1_000);
        assert!(directory.prune_room_if_empty(&room).await.unwrap());
        assert_eq!(room_state(&store, &room).await, None);
    }

    #[tokio::test]
    async fn the_lobby_derives_effective_presence_and_cleans_up() {
        let (_mem, store) = shared_store();
        let directory = RoomDirectory::new(store.clone());
        let now = store.server_now().await.unwrap();

        // One live room and one whose only occupant went stale long ago.
        let mut live = RoomState::new_waiting();
        live.players.x = PlayerPresence {
            id: Some("alice".into()),
            last_seen: Some(now),
        };
        live.touch(now);
        store.put("ALIVE", live.to_document().unwrap()).await.unwrap();

        let stale_seen = now - STALE_PLAYER_THRESHOLD_MS - EMPTY_ROOM_RETENTION_MS;
        let mut dead = RoomState::new_waiting();
        dead.players.o = PlayerPresence {
            id: Some("ghost".into()),
            last_seen: Some(stale_seen),
        };
        dead.touch(stale_seen);
        store.put("GHOST", dead.to_document().unwrap()).await.unwrap();

        let watch = directory.watch_lobby();

        // The stale slot is released, which empties the room, and the
        // expired empty document is pruned away.
        wait_for(|| async { room_state(&store, "GHOST").await.is_none() }).await;
        assert!(room_state(&store, "ALIVE").await.is_some());

        wait_for(|| {
            let rooms = watch.rooms();
            async move {
                rooms
                    .iter()
                    .any(|room| room.id == "ALIVE" && room.players.x.occupied())
                    && !rooms.iter().any(|room| room.id == "GHOST")
            }
        })
        .await;
    }
}
