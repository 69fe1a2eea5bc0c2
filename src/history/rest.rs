//! REST-backed history store
//!
//! ## Responsibilities
//!
//! - CRUD against the history service (`/users/{uid}/records`)
//! - Snapshot subscriptions by polling: a change in the fetched list is
//!   pushed to the subscriber; a poll failure ends the stream with one
//!   error item

use super::types::{sort_records, HistoryRecord};
use super::{HistoryStore, SnapshotStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_POLL_SECS: u64 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// HistoryStore talking to the REST history service
#[derive(Clone)]
pub struct RestHistoryStore {
    client: reqwest::Client,
    base_url: String,
    poll_secs: u64,
}

impl RestHistoryStore {
    /// Create new RestHistoryStore
    pub fn new(base_url: &str) -> Self {
        Self::with_poll_interval(base_url, DEFAULT_POLL_SECS)
    }

    /// Create with custom poll interval (for testing)
    pub fn with_poll_interval(base_url: &str, poll_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_secs,
        }
    }

    fn records_url(&self, uid: &str) -> String {
        format!("{}/users/{}/records", self.base_url, uid)
    }

    /// Fetch the full record list, newest first
    async fn fetch(&self, uid: &str) -> Result<Vec<HistoryRecord>> {
        let response = self
            .client
            .get(self.records_url(uid))
            .send()
            .await
            .map_err(|e| Error::Persistence(format!("history fetch failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Persistence(format!(
                "history service returned {} on fetch",
                status
            )));
        }

        let mut records: Vec<HistoryRecord> = response
            .json()
            .await
            .map_err(|e| Error::Persistence(format!("malformed history payload: {}", e)))?;
        sort_records(&mut records);

        Ok(records)
    }
}

#[async_trait]
impl HistoryStore for RestHistoryStore {
    async fn append(&self, uid: &str, record: HistoryRecord) -> Result<()> {
        let response = self
            .client
            .post(self.records_url(uid))
            .json(&record)
            .send()
            .await
            .map_err(|e| Error::Persistence(format!("history append failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Persistence(format!(
                "history service returned {} on append",
                status
            )));
        }

        tracing::debug!(uid = %uid, record_id = %record.id, "History record stored");
        Ok(())
    }

    async fn remove(&self, uid: &str, record_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.records_url(uid), record_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::Persistence(format!("history remove failed: {}", e)))?;

        let status = response.status();
        // 404はリトライや再削除で既に消えているケース。成功扱い。
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Persistence(format!(
                "history service returned {} on remove",
                status
            )));
        }

        tracing::debug!(uid = %uid, record_id = %record_id, "History record removed");
        Ok(())
    }

    async fn subscribe(&self, uid: &str) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let uid = uid.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(store.poll_secs));
            let mut last: Option<Vec<HistoryRecord>> = None;

            loop {
                interval.tick().await;

                if tx.is_closed() {
                    tracing::debug!(uid = %uid, "History subscriber gone, stopping poll");
                    break;
                }

                match store.fetch(&uid).await {
                    Ok(snapshot) => {
                        if last.as_ref() != Some(&snapshot) {
                            if tx.send(Ok(snapshot.clone())).is_err() {
                                break;
                            }
                            last = Some(snapshot);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(uid = %uid, error = %e, "History poll failed, ending subscription");
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        SnapshotStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DehydrationStatus, Report, ReportMetrics};
    use axum::extract::{Json, Path, State};
    use axum::http::StatusCode;
    use axum::routing::{delete, get};
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Db = Arc<Mutex<HashMap<String, Vec<HistoryRecord>>>>;

    async fn list(State(db): State<Db>, Path(uid): Path<String>) -> Json<Vec<HistoryRecord>> {
        Json(db.lock().unwrap().get(&uid).cloned().unwrap_or_default())
    }

    async fn create(
        State(db): State<Db>,
        Path(uid): Path<String>,
        Json(record): Json<HistoryRecord>,
    ) -> StatusCode {
        db.lock().unwrap().entry(uid).or_default().push(record);
        StatusCode::CREATED
    }

    async fn remove(State(db): State<Db>, Path((uid, id)): Path<(String, String)>) -> StatusCode {
        let mut db = db.lock().unwrap();
        match db.get_mut(&uid) {
            Some(records) => {
                let before = records.len();
                records.retain(|r| r.id != id);
                if records.len() == before {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::NO_CONTENT
                }
            }
            None => StatusCode::NOT_FOUND,
        }
    }

    async fn spawn_server() -> (String, Db) {
        let db: Db = Arc::new(Mutex::new(HashMap::new()));
        let app = Router::new()
            .route("/users/:uid/records", get(list).post(create))
            .route("/users/:uid/records/:id", delete(remove))
            .with_state(db.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), db)
    }

    fn record_at(ts: i64, id: &str) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            captured_at: Utc.timestamp_opt(ts, 0).unwrap(),
            thumbnail: "aW1n".to_string(),
            report: Report {
                dehydration_status: DehydrationStatus::SeverelyDehydrated,
                metrics: ReportMetrics {
                    crack_intensity: 80,
                    dryness_level: 85,
                    moisture_score: 15,
                    color_description: Some("pale".to_string()),
                },
                visual_observations: vec!["Deep cracks".to_string()],
                recommendations: vec!["See a professional".to_string()],
                summary: "Severe dryness.".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_append_and_subscribe_roundtrip() {
        let (base, db) = spawn_server().await;
        let store = RestHistoryStore::with_poll_interval(&base, 1);

        store.append("u1", record_at(100, "a")).await.unwrap();
        assert_eq!(db.lock().unwrap()["u1"].len(), 1);

        let mut stream = store.subscribe("u1").await;
        let snapshot = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(
            snapshot[0].report.dehydration_status,
            DehydrationStatus::SeverelyDehydrated
        );
    }

    #[tokio::test]
    async fn test_subscription_sees_later_appends() {
        let (base, _db) = spawn_server().await;
        let store = RestHistoryStore::with_poll_interval(&base, 1);

        let mut stream = store.subscribe("u1").await;
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(first.is_empty());

        store.append("u1", record_at(100, "a")).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_orders_newest_first() {
        let (base, db) = spawn_server().await;
        let store = RestHistoryStore::with_poll_interval(&base, 1);

        {
            let mut db = db.lock().unwrap();
            db.insert(
                "u1".to_string(),
                vec![record_at(100, "a"), record_at(300, "b"), record_at(200, "c")],
            );
        }

        let records = store.fetch("u1").await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_remove_absent_record_is_ok() {
        let (base, _db) = spawn_server().await;
        let store = RestHistoryStore::with_poll_interval(&base, 1);

        store.remove("u1", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_deletes_record() {
        let (base, db) = spawn_server().await;
        let store = RestHistoryStore::with_poll_interval(&base, 1);

        store.append("u1", record_at(100, "a")).await.unwrap();
        store.remove("u1", "a").await.unwrap();
        assert!(db.lock().unwrap()["u1"].is_empty());

        // Second delete hits the 404 path
        store.remove("u1", "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_append() {
        let store = RestHistoryStore::with_poll_interval("http://127.0.0.1:1", 1);

        let err = store.append("u1", record_at(100, "a")).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn test_poll_failure_ends_stream_with_error_item() {
        let store = RestHistoryStore::with_poll_interval("http://127.0.0.1:1", 1);

        let mut stream = store.subscribe("u1").await;
        let item = tokio::time::timeout(Duration::from_secs(15), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Err(Error::Persistence(_))));

        // Stream is over after the error item
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
