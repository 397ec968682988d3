use async_trait::async_trait;
use noughts_protocol::Millis;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;

pub use memory::MemoryStore;

/// Documents travel as plain JSON values; typed views are the caller's job.
pub type Document = Value;

/// Monotonic per-document revision. `0` always means "document absent", so a
/// commit against version 0 is an atomic create.
pub type Version = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The document changed between read and commit. Safe to retry.
    #[error("document version moved during commit")]
    Contention,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed document: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Contention)
    }
}

/// The write half of an optimistic read-modify-write cycle.
#[derive(Debug, Clone)]
pub enum Write {
    Put(Document),
    Delete,
}

/// A document read together with the version to commit against.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub doc: Option<Document>,
    pub version: Version,
}

/// The shared document store at its interface: versioned reads, atomic
/// compare-and-commit writes, store-side timestamps and push subscriptions.
///
/// Every subscription snapshot is the complete current truth for its scope,
/// never an incremental patch, so consumers re-derive their view from each
/// one and reordered or coalesced deliveries cannot corrupt local state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    async fn get_versioned(&self, key: &str) -> Result<Versioned, StoreError>;

    /// Unconditional write. Most callers want `commit` instead.
    async fn put(&self, key: &str, doc: Document) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Apply `write` only if the document is still at `expected`; fails with
    /// `StoreError::Contention` otherwise. This is the primitive every
    /// racing mutation in the system is built on.
    async fn commit(&self, key: &str, expected: Version, write: Write) -> Result<(), StoreError>;

    /// Store-anchored wall clock in epoch milliseconds. All staleness and
    /// retention math uses this, never a local clock.
    async fn server_now(&self) -> Result<Millis, StoreError>;

    /// One-shot read of the most recently touched documents, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<(String, Document)>, StoreError>;

    /// Push feed for a single key. The current value is delivered
    /// immediately, then again after every mutation; `None` means deleted.
    fn subscribe(&self, key: &str) -> mpsc::UnboundedReceiver<Option<Document>>;

    /// Push feed of the `limit` most recently touched documents, newest
    /// first. Delivered immediately and after every store mutation.
    fn subscribe_recent(&self, limit: usize) -> mpsc::UnboundedReceiver<Vec<(String, Document)>>;
}
