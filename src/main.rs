use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use noughts::{
    load_or_create_identity, MatchCoordinator, MemoryProfileStore, RoomDirectory, RoomEvent,
};
use noughts_protocol::{Cell, RoomState, Slot};
use noughts_store::{DocumentStore, MemoryStore};

#[derive(Parser)]
#[command(name = "noughts-combined")]
#[command(about = "Noughts - two-player rooms over an embedded document store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate two clients sharing a room: a full round, then a rematch
    Demo,
    /// Create a few rooms and print the watched lobby
    Lobby,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => run_demo().await,
        Commands::Lobby => run_lobby().await,
    }
}

fn narrate(name: &'static str, mut events: UnboundedReceiver<RoomEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::StateChanged(state) => {
                    debug!(player = name, status = ?state.status, "state changed")
                }
                other => info!(player = name, event = ?other, "room event"),
            }
        }
    });
}

fn render(board: &[Cell; 9]) -> String {
    board
        .chunks(3)
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Cell::X => "X",
                    Cell::O => "O",
                    Cell::Empty => ".",
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn print_room(store: &Arc<dyn DocumentStore>, room: &str) {
    if let Ok(Some(doc)) = store.get(room).await {
        let state = RoomState::normalize(&doc);
        println!("room {room} [{:?}]", state.status);
        println!("{}", render(&state.board));
    }
}

async fn run_demo() -> Result<()> {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room(None).await?;
    info!(room = %room, "room created");

    let alice_profile = Arc::new(MemoryProfileStore::new());
    let alice_id = load_or_create_identity(alice_profile.as_ref()).await?;
    let (alice, alice_events) =
        MatchCoordinator::connect(store.clone(), alice_profile, alice_id, room.clone());
    narrate("alice", alice_events);

    let bob_profile = Arc::new(MemoryProfileStore::new());
    let bob_id = load_or_create_identity(bob_profile.as_ref()).await?;
    let (bob, bob_events) =
        MatchCoordinator::connect(store.clone(), bob_profile, bob_id, room.clone());
    narrate("bob", bob_events);

    let alice_slot = alice.join().await?.expect("no join in flight yet");
    let bob_slot = bob.join().await?.expect("no join in flight yet");
    info!(%alice_slot, %bob_slot, "both players seated");
    assert_eq!(alice_slot, Slot::X);
    assert_eq!(bob_slot, Slot::O);

    // X takes the top row while O answers in the middle one.
    for (who, cell) in [(&alice, 0), (&bob, 3), (&alice, 1), (&bob, 4), (&alice, 2)] {
        who.apply_move(cell).await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_room(&store, &room).await;

    info!("both players vote for a rematch");
    alice.vote_rematch().await?;
    bob.vote_rematch().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_room(&store, &room).await;

    alice.leave().await;
    bob.leave().await;
    info!(rooms_left = store.list_recent(10).await?.len(), "demo finished");
    Ok(())
}

async fn run_lobby() -> Result<()> {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let directory = RoomDirectory::new(store.clone());

    let first = directory.create_room(Some("LOBBY")).await?;
    let second = directory.create_room(None).await?;

    let profile = Arc::new(MemoryProfileStore::new());
    let player = load_or_create_identity(profile.as_ref()).await?;
    let (seat, events) = MatchCoordinator::connect(store.clone(), profile, player, first.clone());
    narrate("host", events);
    let _ = seat.join().await?;
    info!(occupied = %first, empty = %second, "rooms created");

    let watch = directory.watch_lobby();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for room in watch.rooms() {
        println!(
            "{}  {:?}  {}/2",
            room.id,
            room.status,
            room.players.occupied_count()
        );
    }
    seat.leave().await;
    Ok(())
}
