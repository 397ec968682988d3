//! Client-side coordinator for two-player rooms whose authoritative state
//! lives in a shared, transactionally-updatable document store.
//!
//! Everything that mutates a room based on its current state (joining,
//! moves, forfeits, rematch votes, deletion) runs as an optimistic
//! read-modify-write against the store; pushed snapshots are the only way
//! state flows back in, and each one is treated as the complete truth.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod events;
pub mod presence;
pub mod profile;
pub mod rematch;
mod rooms;

#[cfg(test)]
mod tests;

pub use clock::ServerClock;
pub use coordinator::{recover_orphaned_room, MatchCoordinator, SessionPhase};
pub use directory::{LobbyWatch, RoomDirectory};
pub use error::RoomError;
pub use events::RoomEvent;
pub use profile::{
    load_or_create_identity, FileProfileStore, MemoryProfileStore, ProfileStore, ACTIVE_ROOM_KEY,
    PLAYER_ID_KEY,
};
