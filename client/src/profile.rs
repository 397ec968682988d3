//! Per-device local persistence: the stable player identity and a pointer
//! to the room the device is currently seated in. The pointer is what lets
//! the next launch release a slot left behind by an unclean exit.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use uuid::Uuid;

pub const PLAYER_ID_KEY: &str = "playerId";
pub const ACTIVE_ROOM_KEY: &str = "activeRoomId";

/// Small string key-value persistence, local to the device.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, key: &str) -> io::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> io::Result<()>;
    async fn remove(&self, key: &str) -> io::Result<()>;
}

/// File-backed profile: one JSON object per data directory.
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new(data_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(FileProfileStore {
            path: data_dir.join("profile.json"),
        })
    }

    async fn load(&self) -> io::Result<HashMap<String, String>> {
        match async_fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_default()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err),
        }
    }

    async fn save(&self, entries: &HashMap<String, String>) -> io::Result<()> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        async_fs::write(&self.path, content).await
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.load().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries).await
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}

/// In-memory profile for tests and simulated clients.
#[derive(Default)]
pub struct MemoryProfileStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// The opaque identity this device plays under, created on first use and
/// stable afterwards.
pub async fn load_or_create_identity(profile: &dyn ProfileStore) -> io::Result<String> {
    if let Some(id) = profile.get(PLAYER_ID_KEY).await? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    profile.set(PLAYER_ID_KEY, &id).await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_profile_round_trips_and_removes() {
        let dir = tempdir().unwrap();
        let store = FileProfileStore::new(dir.path()).unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        // A second handle over the same directory sees the same data.
        let reopened = FileProfileStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some("v".to_string()));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn identity_is_created_once_and_reused() {
        let dir = tempdir().unwrap();
        let store = FileProfileStore::new(dir.path()).unwrap();

        let first = load_or_create_identity(&store).await.unwrap();
        let second = load_or_create_identity(&store).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn corrupt_profile_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("profile.json"), "{not json").unwrap();
        let store = FileProfileStore::new(dir.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
