use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Milliseconds since the Unix epoch, as stamped by the document store.
pub type Millis = i64;

/// ---- Slots ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Slot {
    X,
    O,
}

impl Slot {
    /// Claim order for free slots: X is always tried before O.
    pub const ALL: [Slot; 2] = [Slot::X, Slot::O];

    pub fn opponent(self) -> Slot {
        match self {
            Slot::X => Slot::O,
            Slot::O => Slot::X,
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Slot::X
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::X => write!(f, "X"),
            Slot::O => write!(f, "O"),
        }
    }
}

/// ---- Board ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Cell {
    #[serde(rename = "")]
    Empty,
    X,
    O,
}

impl Cell {
    pub fn slot(self) -> Option<Slot> {
        match self {
            Cell::X => Some(Slot::X),
            Cell::O => Some(Slot::O),
            Cell::Empty => None,
        }
    }
}

impl From<Slot> for Cell {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::X => Cell::X,
            Slot::O => Cell::O,
        }
    }
}

pub type Board = [Cell; 9];

pub fn empty_board() -> Board {
    [Cell::Empty; 9]
}

/// Rows, columns and the two diagonals of the 3x3 grid.
pub const WINNING_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// A fully occupied line decides the round; a full board with no line is a
/// draw; anything else means the round is still running.
pub fn evaluate_board(board: &Board) -> Option<GameWinner> {
    for [a, b, c] in WINNING_LINES {
        if let Some(slot) = board[a].slot() {
            if board[b] == board[a] && board[c] == board[a] {
                return Some(GameWinner::from(slot));
            }
        }
    }
    if board.iter().all(|cell| *cell != Cell::Empty) {
        Some(GameWinner::Draw)
    } else {
        None
    }
}

/// ---- Round status ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Waiting,
    Playing,
    Finished,
}

impl Default for GameStatus {
    fn default() -> Self {
        GameStatus::Waiting
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GameWinner {
    X,
    O,
    #[serde(rename = "draw")]
    Draw,
}

impl GameWinner {
    pub fn slot(self) -> Option<Slot> {
        match self {
            GameWinner::X => Some(Slot::X),
            GameWinner::O => Some(Slot::O),
            GameWinner::Draw => None,
        }
    }
}

impl From<Slot> for GameWinner {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::X => GameWinner::X,
            Slot::O => GameWinner::O,
        }
    }
}

/// ---- Presence ----
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlayerPresence {
    pub id: Option<String>,
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<Millis>,
}

impl PlayerPresence {
    pub fn vacant() -> Self {
        PlayerPresence::default()
    }

    pub fn occupied(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Players {
    #[serde(rename = "X")]
    pub x: PlayerPresence,
    #[serde(rename = "O")]
    pub o: PlayerPresence,
}

impl Players {
    pub fn slot(&self, slot: Slot) -> &PlayerPresence {
        match slot {
            Slot::X => &self.x,
            Slot::O => &self.o,
        }
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut PlayerPresence {
        match slot {
            Slot::X => &mut self.x,
            Slot::O => &mut self.o,
        }
    }

    pub fn slot_of(&self, player_id: &str) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .find(|&slot| self.slot(slot).id.as_deref() == Some(player_id))
    }

    pub fn occupied_count(&self) -> usize {
        Slot::ALL
            .into_iter()
            .filter(|&slot| self.slot(slot).occupied())
            .count()
    }

    pub fn both_occupied(&self) -> bool {
        self.occupied_count() == 2
    }

    pub fn both_empty(&self) -> bool {
        self.occupied_count() == 0
    }
}

/// Vacate every slot whose heartbeat is older than `threshold` relative to
/// the store-anchored `now`. A slot without an id or without a heartbeat is
/// vacated as well. Applying this twice with the same inputs gives the same
/// result as applying it once.
pub fn cleanup_players(players: &Players, now: Millis, threshold: Millis) -> Players {
    let mut result = players.clone();
    for slot in Slot::ALL {
        let info = result.slot_mut(slot);
        let alive = match (&info.id, info.last_seen) {
            (Some(_), Some(seen)) => now - seen <= threshold,
            _ => false,
        };
        if !alive {
            *info = PlayerPresence::vacant();
        }
    }
    result
}

/// Slot selection for a joining player: an already-owned slot is reused,
/// otherwise the first free slot in X, O order; `None` when the room is full.
pub fn choose_slot(players: &Players, player_id: &str) -> Option<Slot> {
    if let Some(slot) = players.slot_of(player_id) {
        return Some(slot);
    }
    Slot::ALL
        .into_iter()
        .find(|&slot| !players.slot(slot).occupied())
}

/// ---- Rematch votes ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RematchVotes {
    #[serde(rename = "X")]
    pub x: bool,
    #[serde(rename = "O")]
    pub o: bool,
}

impl RematchVotes {
    pub fn get(&self, slot: Slot) -> bool {
        match slot {
            Slot::X => self.x,
            Slot::O => self.o,
        }
    }

    pub fn set(&mut self, slot: Slot, value: bool) {
        match slot {
            Slot::X => self.x = value,
            Slot::O => self.o = value,
        }
    }
}

pub fn should_auto_start_rematch(votes: &RematchVotes) -> bool {
    votes.x && votes.o
}

/// ---- Room state ----
///
/// The canonical shape of one room document. Field names match the persisted
/// wire shape, so serializing a `RoomState` produces exactly the document the
/// store holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomState {
    pub board: Board,
    #[serde(rename = "currentTurn")]
    pub current_turn: Slot,
    pub status: GameStatus,
    pub winner: Option<GameWinner>,
    #[serde(rename = "resultAt")]
    pub result_at: Option<Millis>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: Option<Millis>,
    pub players: Players,
    #[serde(rename = "rematchVotes")]
    pub rematch_votes: RematchVotes,
    #[serde(rename = "nextStarter")]
    pub next_starter: Slot,
    #[serde(rename = "createdAt")]
    pub created_at: Option<Millis>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<Millis>,
}

impl RoomState {
    /// The shape a freshly created room starts in.
    pub fn new_waiting() -> Self {
        RoomState {
            board: empty_board(),
            current_turn: Slot::X,
            status: GameStatus::Waiting,
            winner: None,
            result_at: None,
            last_activity_at: None,
            players: Players::default(),
            rematch_votes: RematchVotes::default(),
            next_starter: Slot::X,
            created_at: None,
            updated_at: None,
        }
    }

    /// Defensive normalization of whatever the store returned. Every field
    /// that is missing, mistyped or out of range falls back to the
    /// `new_waiting` default for that field; the board is always exactly nine
    /// cells afterwards.
    pub fn normalize(value: &Value) -> RoomState {
        let mut state = RoomState::new_waiting();
        state.board = normalize_board(value.get("board"));
        state.current_turn = normalize_slot(value.get("currentTurn"));
        state.status = match value.get("status").and_then(Value::as_str) {
            Some("playing") => GameStatus::Playing,
            Some("finished") => GameStatus::Finished,
            _ => GameStatus::Waiting,
        };
        state.winner = match value.get("winner").and_then(Value::as_str) {
            Some("X") => Some(GameWinner::X),
            Some("O") => Some(GameWinner::O),
            Some("draw") => Some(GameWinner::Draw),
            _ => None,
        };
        state.result_at = value.get("resultAt").and_then(Value::as_i64);
        state.last_activity_at = value.get("lastActivityAt").and_then(Value::as_i64);
        state.players = Players {
            x: normalize_presence(value.pointer("/players/X")),
            o: normalize_presence(value.pointer("/players/O")),
        };
        state.rematch_votes = RematchVotes {
            x: value
                .pointer("/rematchVotes/X")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            o: value
                .pointer("/rematchVotes/O")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        state.next_starter = normalize_slot(value.get("nextStarter"));
        state.created_at = value.get("createdAt").and_then(Value::as_i64);
        state.updated_at = value.get("updatedAt").and_then(Value::as_i64);
        state
    }

    pub fn to_document(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Stamp the activity fields that every mutation refreshes.
    pub fn touch(&mut self, now: Millis) {
        self.last_activity_at = Some(now);
        self.updated_at = Some(now);
    }

    /// Open a fresh round: clear the board and the result, hand the opening
    /// move to `next_starter` and flip it so consecutive rounds alternate.
    pub fn start_round(&mut self) {
        let opener = self.next_starter;
        self.board = empty_board();
        self.current_turn = opener;
        self.status = GameStatus::Playing;
        self.winner = None;
        self.result_at = None;
        self.rematch_votes = RematchVotes::default();
        self.next_starter = opener.opponent();
    }

    /// Fall back to an idle waiting room without touching `next_starter`.
    pub fn reset_waiting(&mut self) {
        self.board = empty_board();
        self.current_turn = self.next_starter;
        self.status = GameStatus::Waiting;
        self.winner = None;
        self.result_at = None;
        self.rematch_votes = RematchVotes::default();
    }

    /// The most recent store-stamped timestamp embedded in this snapshot.
    /// Lets a pushed snapshot be judged against server time without another
    /// round-trip.
    pub fn latest_server_timestamp(&self) -> Option<Millis> {
        [
            self.players.x.last_seen,
            self.players.o.last_seen,
            self.result_at,
            self.last_activity_at,
            self.updated_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

fn normalize_slot(value: Option<&Value>) -> Slot {
    match value.and_then(Value::as_str) {
        Some("O") => Slot::O,
        _ => Slot::X,
    }
}

fn normalize_board(value: Option<&Value>) -> Board {
    let mut board = empty_board();
    if let Some(cells) = value.and_then(Value::as_array) {
        if cells.len() == 9 {
            for (i, cell) in cells.iter().enumerate() {
                board[i] = match cell.as_str() {
                    Some("X") => Cell::X,
                    Some("O") => Cell::O,
                    _ => Cell::Empty,
                };
            }
        }
    }
    board
}

fn normalize_presence(value: Option<&Value>) -> PlayerPresence {
    PlayerPresence {
        id: value
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        last_seen: value.and_then(|v| v.get("lastSeen")).and_then(Value::as_i64),
    }
}

/// A round starts as soon as a waiting room has both slots occupied.
pub fn should_start_round(state: &RoomState) -> bool {
    state.status == GameStatus::Waiting && state.players.both_occupied()
}

/// ---- Lobby projection ----
///
/// Read-only view of a room for the lobby list; derived from a snapshot,
/// never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LobbyRoom {
    pub id: String,
    pub status: GameStatus,
    pub players: Players,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: Option<Millis>,
}

/// ---- Room codes ----
///
/// Fixed-length codes from an alphabet without visually ambiguous characters
/// (no I, L, O, 0, 1).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 5;

pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Strip everything that cannot appear in a code and uppercase the rest.
pub fn sanitize_room_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
