use noughts_protocol::{GameWinner, RoomState, Slot};

/// Pushed to the embedding UI layer over an unbounded channel. Rendering,
/// navigation and alert presentation happen entirely on the consumer side.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A fresh, fully re-derived view of the room document.
    StateChanged(RoomState),
    /// The join claim succeeded and this client now owns the slot.
    SlotAssigned(Slot),
    /// The store no longer shows this client in its confirmed slot.
    SlotLost,
    /// A round just reached a terminal state.
    RoundFinished { winner: GameWinner },
    /// The opponent's heartbeat stopped past the grace window. Emitted
    /// before the forfeit write lands so the UI can react immediately.
    OpponentLeft,
    /// A previously declared-gone opponent showed up with a fresh heartbeat.
    OpponentReturned,
    /// The room document was deleted out from under us.
    RoomClosed,
}
