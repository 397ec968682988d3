use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use noughts_protocol::Millis;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Document, DocumentStore, StoreError, Version, Versioned, Write};

struct Entry {
    doc: Document,
    version: Version,
    touched: Millis,
}

struct Shared {
    docs: HashMap<String, Entry>,
    next_version: Version,
    key_subs: HashMap<String, Vec<mpsc::UnboundedSender<Option<Document>>>>,
    recent_subs: Vec<(usize, mpsc::UnboundedSender<Vec<(String, Document)>>)>,
    /// Test knob: offset added to the wall clock so staleness and retention
    /// windows can be crossed without sleeping.
    skew: Millis,
}

/// Complete in-process implementation of [`DocumentStore`], used by the test
/// suites and the demo launcher. One shared map behind a mutex; every
/// mutation fans the new truth out to subscribers.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(Mutex::new(Shared {
                docs: HashMap::new(),
                next_version: 1,
                key_subs: HashMap::new(),
                recent_subs: Vec::new(),
                skew: 0,
            })),
        }
    }

    /// Shift the store clock forward by `ms`.
    pub fn advance(&self, ms: Millis) {
        self.shared.lock().skew += ms;
    }

    pub fn len(&self) -> usize {
        self.shared.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Shared {
    fn now(&self) -> Millis {
        Utc::now().timestamp_millis() + self.skew
    }

    fn recent(&self, limit: usize) -> Vec<(String, Document)> {
        let mut entries: Vec<_> = self.docs.iter().collect();
        entries.sort_by(|a, b| b.1.touched.cmp(&a.1.touched).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(limit)
            .map(|(key, entry)| (key.clone(), entry.doc.clone()))
            .collect()
    }

    fn apply(&mut self, key: &str, write: Write) {
        match write {
            Write::Put(doc) => {
                let version = self.next_version;
                self.next_version += 1;
                let touched = self.now();
                self.docs.insert(key.to_string(), Entry { doc, version, touched });
            }
            Write::Delete => {
                self.docs.remove(key);
            }
        }
        self.notify(key);
    }

    fn notify(&mut self, key: &str) {
        let snapshot = self.docs.get(key).map(|entry| entry.doc.clone());
        if let Some(senders) = self.key_subs.get_mut(key) {
            senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
        let mut lists: Vec<(usize, Vec<(String, Document)>)> = Vec::new();
        for (limit, _) in &self.recent_subs {
            if !lists.iter().any(|(l, _)| l == limit) {
                lists.push((*limit, self.recent(*limit)));
            }
        }
        self.recent_subs.retain(|(limit, tx)| {
            let list = lists
                .iter()
                .find(|(l, _)| l == limit)
                .map(|(_, list)| list.clone())
                .unwrap_or_default();
            tx.send(list).is_ok()
        });
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.shared.lock().docs.get(key).map(|entry| entry.doc.clone()))
    }

    async fn get_versioned(&self, key: &str) -> Result<Versioned, StoreError> {
        let shared = self.shared.lock();
        Ok(match shared.docs.get(key) {
            Some(entry) => Versioned {
                doc: Some(entry.doc.clone()),
                version: entry.version,
            },
            None => Versioned { doc: None, version: 0 },
        })
    }

    async fn put(&self, key: &str, doc: Document) -> Result<(), StoreError> {
        self.shared.lock().apply(key, Write::Put(doc));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.shared.lock().apply(key, Write::Delete);
        Ok(())
    }

    async fn commit(&self, key: &str, expected: Version, write: Write) -> Result<(), StoreError> {
        let mut shared = self.shared.lock();
        let current = shared.docs.get(key).map(|entry| entry.version).unwrap_or(0);
        if current != expected {
            debug!(key, expected, current, "commit lost the version race");
            return Err(StoreError::Contention);
        }
        shared.apply(key, write);
        Ok(())
    }

    async fn server_now(&self) -> Result<Millis, StoreError> {
        Ok(self.shared.lock().now())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<(String, Document)>, StoreError> {
        Ok(self.shared.lock().recent(limit))
    }

    fn subscribe(&self, key: &str) -> mpsc::UnboundedReceiver<Option<Document>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        let snapshot = shared.docs.get(key).map(|entry| entry.doc.clone());
        let _ = tx.send(snapshot);
        shared.key_subs.entry(key.to_string()).or_default().push(tx);
        rx
    }

    fn subscribe_recent(&self, limit: usize) -> mpsc::UnboundedReceiver<Vec<(String, Document)>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        let _ = tx.send(shared.recent(limit));
        shared.recent_subs.push((limit, tx));
        rx
    }
}
