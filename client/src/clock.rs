use std::sync::Arc;

use noughts_protocol::Millis;
use noughts_store::DocumentStore;

use crate::error::RoomError;

/// Store-anchored time source. The two clients' local clocks are never
/// assumed to agree, so every staleness or retention decision goes through
/// here (or through the timestamps already embedded in a pushed snapshot,
/// see `RoomState::latest_server_timestamp`).
#[derive(Clone)]
pub struct ServerClock {
    store: Arc<dyn DocumentStore>,
}

impl ServerClock {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ServerClock { store }
    }

    pub async fn now(&self) -> Result<Millis, RoomError> {
        Ok(self.store.server_now().await?)
    }
}
