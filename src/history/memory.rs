//! In-memory history store
//!
//! 開発・テスト用のバックエンド。レコードをプロセス内に保持し、
//! 変更のたびに購読者へスナップショットを同期配信する。

use super::types::{sort_records, HistoryRecord};
use super::{HistoryStore, SnapshotItem, SnapshotStream};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct Shard {
    records: Vec<HistoryRecord>,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<SnapshotItem>>,
}

/// Deliver the current snapshot to every subscriber, pruning closed ones
fn notify(shard: &mut Shard) {
    let mut snapshot = shard.records.clone();
    sort_records(&mut snapshot);

    shard.subscribers.retain(|id, tx| {
        if tx.send(Ok(snapshot.clone())).is_ok() {
            true
        } else {
            tracing::debug!(subscriber_id = %id, "Pruned closed history subscriber");
            false
        }
    });
}

/// In-memory HistoryStore, keyed by identity
#[derive(Clone, Default)]
pub struct MemoryHistoryStore {
    inner: Arc<Mutex<HashMap<String, Shard>>>,
}

impl MemoryHistoryStore {
    /// Create new MemoryHistoryStore
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers across all identities
    pub async fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .values()
            .map(|shard| shard.subscribers.len())
            .sum()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, uid: &str, record: HistoryRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let shard = inner.entry(uid.to_string()).or_default();

        tracing::debug!(uid = %uid, record_id = %record.id, "Appending history record");
        shard.records.push(record);
        notify(shard);

        Ok(())
    }

    async fn remove(&self, uid: &str, record_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(shard) = inner.get_mut(uid) else {
            return Ok(());
        };

        let before = shard.records.len();
        shard.records.retain(|record| record.id != record_id);

        if shard.records.len() != before {
            tracing::debug!(uid = %uid, record_id = %record_id, "Removed history record");
            notify(shard);
        }

        Ok(())
    }

    async fn subscribe(&self, uid: &str) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().await;
        let shard = inner.entry(uid.to_string()).or_default();

        // 初回スナップショットを即時配信
        let mut snapshot = shard.records.clone();
        sort_records(&mut snapshot);
        let _ = tx.send(Ok(snapshot));

        shard.subscribers.insert(Uuid::new_v4(), tx);
        SnapshotStream::new(rx)
    }
}
