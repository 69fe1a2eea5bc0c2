//! History Store - Persisted Analysis Records
//!
//! ## Responsibilities
//!
//! - Append/remove analysis records per identity
//! - Snapshot subscriptions: each change delivers the full record list,
//!   newest first
//! - A store failure ends a subscription with a single error item; the
//!   subscriber decides whether to subscribe again
//!
//! Appends are best-effort from the session's point of view: a failed
//! write is logged by the caller and never blocks a report.

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub mod memory;
pub mod rest;
pub mod types;

pub use memory::MemoryHistoryStore;
pub use rest::RestHistoryStore;
pub use types::HistoryRecord;

/// One item on a snapshot subscription: the full list, or the error
/// that terminated the stream
pub type SnapshotItem = Result<Vec<HistoryRecord>>;

/// Stream of history snapshots. Ends after an error item; subscribing
/// again starts a fresh stream.
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<SnapshotItem>,
}

impl SnapshotStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SnapshotItem>) -> Self {
        Self { rx }
    }

    /// Next snapshot; None once the stream has terminated
    pub async fn next(&mut self) -> Option<SnapshotItem> {
        self.rx.recv().await
    }
}

impl Stream for SnapshotStream {
    type Item = SnapshotItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Store abstraction implemented by the REST and in-memory backends
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record for the identity
    async fn append(&self, uid: &str, record: HistoryRecord) -> Result<()>;

    /// Remove a record. Removing an id that is already gone is not an
    /// error.
    async fn remove(&self, uid: &str, record_id: &str) -> Result<()>;

    /// Subscribe to snapshots for the identity. The current snapshot is
    /// delivered first, then one per observed change.
    async fn subscribe(&self, uid: &str) -> SnapshotStream;
}
