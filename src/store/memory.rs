use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::ambulance::AmbulanceStatus;
use crate::store::{AmbulanceQuery, Document, DocumentStore, SnapshotStream, AMBULANCES, REQUESTS};

/// In-process document store with per-document live watchers.
///
/// `set_offline` simulates losing the connection to the backend: every call
/// fails with a retrieval error and all open watch streams end.
pub struct MemoryStore {
    ambulances: Collection,
    requests: Collection,
    offline: AtomicBool,
    query_delay_ms: AtomicU64,
}

struct Collection {
    name: &'static str,
    docs: DashMap<String, Value>,
    watchers: Watchers,
    buffer_size: usize,
}

type Watchers = Arc<DashMap<String, broadcast::Sender<Document>>>;

impl Collection {
    fn new(name: &'static str, buffer_size: usize) -> Self {
        Self {
            name,
            docs: DashMap::new(),
            watchers: Arc::new(DashMap::new()),
            buffer_size,
        }
    }

    fn get(&self, id: &str) -> Option<Document> {
        self.docs
            .get(id)
            .map(|entry| Document::new(id, entry.value().clone()))
    }

    fn put(&self, id: &str, data: Value) {
        let mut entry = self.docs.entry(id.to_string()).or_insert(Value::Null);
        *entry = data;
        // Notify while the entry is locked so watchers see writes in order.
        self.notify(Document::new(id, entry.value().clone()));
    }

    fn insert_new(&self, id: &str, data: Value) -> Result<(), AppError> {
        match self.docs.entry(id.to_string()) {
            Entry::Occupied(_) => Err(AppError::Conflict(format!(
                "{} document {id} already exists",
                self.name
            ))),
            Entry::Vacant(slot) => {
                let entry = slot.insert(data);
                self.notify(Document::new(id, entry.value().clone()));
                Ok(())
            }
        }
    }

    fn merge(&self, id: &str, fields: Map<String, Value>) -> Result<(), AppError> {
        self.modify(id, |target| {
            target.extend(fields);
            Ok(true)
        })
        .map(|_| ())
    }

    /// Applies `apply` to the document while holding its entry lock. Watchers
    /// are notified only when `apply` reports a change.
    fn modify<F>(&self, id: &str, apply: F) -> Result<bool, AppError>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<bool, AppError>,
    {
        let mut entry = self
            .docs
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("{} document {id} not found", self.name)))?;

        let Some(target) = entry.as_object_mut() else {
            return Err(AppError::Internal(format!(
                "{} document {id} is not an object",
                self.name
            )));
        };
        let changed = apply(target)?;

        if changed {
            self.notify(Document::new(id, entry.value().clone()));
        }
        Ok(changed)
    }

    fn notify(&self, snapshot: Document) {
        if let Some(tx) = self.watchers.get(&snapshot.id) {
            let _ = tx.send(snapshot);
        }
    }

    fn watch(&self, id: &str) -> Result<SnapshotStream, AppError> {
        let rx = self
            .watchers
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe();

        // Subscribed before reading, so no write can fall between the two.
        let Some(current) = self.get(id) else {
            drop(rx);
            prune(&self.watchers, id);
            return Err(AppError::NotFound(format!(
                "{} document {id} not found",
                self.name
            )));
        };

        let updates =
            BroadcastStream::new(rx).filter_map(|snapshot| snapshot.ok().map(Ok::<_, AppError>));

        Ok(Box::pin(WatchStream {
            inner: Some(Box::pin(tokio_stream::once(Ok(current)).chain(updates))),
            watchers: self.watchers.clone(),
            id: id.to_string(),
        }))
    }

    fn sever(&self) {
        self.watchers.clear();
    }

    fn receiver_count(&self, id: &str) -> usize {
        self.watchers
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// A document watch that drops its sender from the watcher map once the
/// last receiver for that document goes away.
struct WatchStream {
    inner: Option<SnapshotStream>,
    watchers: Watchers,
    id: String,
}

impl Stream for WatchStream {
    type Item = Result<Document, AppError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => inner.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        // The receiver has to be gone before the count is checked.
        drop(self.inner.take());
        prune(&self.watchers, &self.id);
    }
}

fn prune(watchers: &Watchers, id: &str) {
    watchers.remove_if(id, |_, tx| tx.receiver_count() == 0);
}

impl MemoryStore {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            ambulances: Collection::new(AMBULANCES, buffer_size),
            requests: Collection::new(REQUESTS, buffer_size),
            offline: AtomicBool::new(false),
            query_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.ambulances.sever();
            self.requests.sever();
            warn!("document store marked offline; live watchers dropped");
        } else {
            info!("document store back online");
        }
    }

    /// Artificial latency applied to ambulance batch queries.
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stands in for the external dispatch process, which owns request
    /// status and assignment changes.
    pub fn update_request(&self, id: &str, fields: Value) -> Result<(), AppError> {
        self.ensure_online()?;
        let mut fields = into_fields(fields)?;
        fields.insert("updatedAt".to_string(), Value::String(now()));
        self.requests.merge(id, fields)
    }

    pub fn ambulance_watchers(&self, id: &str) -> usize {
        self.ambulances.receiver_count(id)
    }

    pub fn request_watchers(&self, id: &str) -> usize {
        self.requests.receiver_count(id)
    }

    /// Documents with at least one open watch, across both collections.
    pub fn watched_documents(&self) -> usize {
        self.ambulances.watchers.len() + self.requests.watchers.len()
    }

    /// Loads a JSON array of ambulance documents, each carrying its own `id`.
    pub async fn load_seed_file(&self, path: &Path) -> Result<usize, AppError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            AppError::Internal(format!("failed to read seed file {}: {err}", path.display()))
        })?;
        let records: Vec<Value> = serde_json::from_str(&raw).map_err(|err| {
            AppError::Internal(format!("invalid seed file {}: {err}", path.display()))
        })?;

        let mut loaded = 0;
        for record in records {
            let mut fields = into_fields(record)?;
            let id = match fields.remove("id") {
                Some(Value::String(id)) if !id.is_empty() => id,
                _ => {
                    return Err(AppError::Internal(
                        "seed ambulance without a string id".to_string(),
                    ));
                }
            };
            fields
                .entry("lastUpdated")
                .or_insert_with(|| Value::String(now()));
            self.ambulances.put(&id, Value::Object(fields));
            loaded += 1;
        }

        info!(count = loaded, path = %path.display(), "seeded ambulances");
        Ok(loaded)
    }

    fn ensure_online(&self) -> Result<(), AppError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Retrieval("document store unreachable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query_ambulances(&self, query: AmbulanceQuery) -> Result<Vec<Document>, AppError> {
        self.ensure_online()?;

        let delay = self.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut matches: Vec<Document> = self
            .ambulances
            .docs
            .iter()
            .filter(|entry| {
                entry.value().get("status").and_then(Value::as_str) == Some(query.status.as_str())
            })
            .map(|entry| Document::new(entry.key().clone(), entry.value().clone()))
            .collect();

        matches.sort_by(|a, b| {
            timestamp(&b.data, "lastUpdated")
                .cmp(&timestamp(&a.data, "lastUpdated"))
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(query.limit);

        debug!(status = query.status.as_str(), count = matches.len(), "ambulance query");
        Ok(matches)
    }

    async fn get_ambulance(&self, id: &str) -> Result<Option<Document>, AppError> {
        self.ensure_online()?;
        Ok(self.ambulances.get(id))
    }

    async fn get_request(&self, id: &str) -> Result<Option<Document>, AppError> {
        self.ensure_online()?;
        Ok(self.requests.get(id))
    }

    async fn query_requests_by_user(&self, user_id: &str) -> Result<Vec<Document>, AppError> {
        self.ensure_online()?;

        let mut matches: Vec<Document> = self
            .requests
            .docs
            .iter()
            .filter(|entry| entry.value().get("userId").and_then(Value::as_str) == Some(user_id))
            .map(|entry| Document::new(entry.key().clone(), entry.value().clone()))
            .collect();

        matches.sort_by(|a, b| {
            timestamp(&b.data, "createdAt")
                .cmp(&timestamp(&a.data, "createdAt"))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matches)
    }

    async fn watch_ambulance(&self, id: &str) -> Result<SnapshotStream, AppError> {
        self.ensure_online()?;
        self.ambulances.watch(id)
    }

    async fn watch_request(&self, id: &str) -> Result<SnapshotStream, AppError> {
        self.ensure_online()?;
        self.requests.watch(id)
    }

    async fn create_request(&self, id: &str, data: Value) -> Result<(), AppError> {
        self.ensure_online()?;

        let mut fields = into_fields(data)?;
        let stamp = now();
        fields.insert("createdAt".to_string(), Value::String(stamp.clone()));
        fields.insert("updatedAt".to_string(), Value::String(stamp));

        self.requests.insert_new(id, Value::Object(fields))
    }

    async fn update_ambulance(&self, id: &str, fields: Value) -> Result<(), AppError> {
        self.ensure_online()?;
        let mut fields = into_fields(fields)?;
        fields.insert("lastUpdated".to_string(), Value::String(now()));
        self.ambulances.merge(id, fields)
    }

    async fn put_ambulance(&self, id: &str, data: Value) -> Result<(), AppError> {
        self.ensure_online()?;
        let fields = into_fields(data)?;
        self.ambulances.put(id, Value::Object(fields));
        Ok(())
    }

    async fn claim_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError> {
        self.ensure_online()?;
        let stamp = now();

        self.ambulances.modify(id, |fields| {
            let status = fields.get("status").and_then(Value::as_str).unwrap_or_default();
            if status != AmbulanceStatus::Available.as_str() {
                return Err(AppError::Conflict(format!("ambulance {id} is {status}")));
            }

            fields.insert(
                "status".to_string(),
                Value::String(AmbulanceStatus::OnCall.as_str().to_string()),
            );
            fields.insert(
                "currentRequestId".to_string(),
                Value::String(request_id.to_string()),
            );
            fields.insert("lastUpdated".to_string(), Value::String(stamp));
            Ok(true)
        })?;

        debug!(ambulance_id = id, request_id, "ambulance claimed");
        Ok(())
    }

    async fn release_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError> {
        self.ensure_online()?;
        let stamp = now();

        let released = self.ambulances.modify(id, |fields| {
            if fields.get("currentRequestId").and_then(Value::as_str) != Some(request_id) {
                return Ok(false);
            }

            fields.insert(
                "status".to_string(),
                Value::String(AmbulanceStatus::Available.as_str().to_string()),
            );
            fields.insert("currentRequestId".to_string(), Value::Null);
            fields.insert("lastUpdated".to_string(), Value::String(stamp));
            Ok(true)
        })?;

        if released {
            debug!(ambulance_id = id, request_id, "ambulance released");
        }
        Ok(())
    }
}

fn into_fields(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(AppError::Validation(format!(
            "document must be an object, got {other}"
        ))),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp(data: &Value, field: &str) -> Option<DateTime<Utc>> {
    data.get(field)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}
