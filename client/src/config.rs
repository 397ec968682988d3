//! Fixed process-wide configuration. Every elapsed-time constant here is
//! measured against the store-anchored clock, never the local one.

use noughts_protocol::Millis;
use std::time::Duration;

// ==== knobs ====
/// How often a seated, foregrounded client refreshes its own heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
/// Heartbeat age past which a slot counts as vacated.
pub const STALE_PLAYER_THRESHOLD_MS: Millis = 15_000;
/// How long after the opponent's heartbeat stops before declaring them gone.
pub const OPPONENT_DISCONNECT_GRACE_MS: Millis = 7_000;
/// Contention retries for the join claim specifically.
pub const JOIN_RETRY_LIMIT: u32 = 10;
/// Contention retries for every other transactional room operation.
pub const RETRY_LIMIT: u32 = 4;
/// First backoff step; doubles on each further attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
/// Page size of the lobby listing feed.
pub const ROOM_LIST_LIMIT: usize = 25;
/// How often the lobby re-derives presence from its latest snapshot even
/// when the feed is quiet.
pub const LOBBY_RESWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// Random-code allocation attempts before giving up on room creation.
pub const MAX_ROOM_CREATE_ATTEMPTS: u32 = 5;
/// Cap on rooms with at least one occupied slot.
pub const MAX_ACTIVE_ROOMS: usize = 5;
/// How long an empty room lingers before it may be deleted.
pub const EMPTY_ROOM_RETENTION_MS: Millis = 5 * 60 * 1000;
