use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::geo::{haversine_km, AVERAGE_SPEED_KMH};
use crate::models::ambulance::Ambulance;
use crate::models::request::Request;
use crate::models::tracking::{EtaEstimate, TrackingUpdate};
use crate::observability::metrics::Metrics;
use crate::store::{load_request, Document, DocumentStore, SnapshotStream, AMBULANCES, REQUESTS};

type FeedItem = Result<TrackingUpdate, AppError>;

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub average_speed_kmh: f64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub buffer_size: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            average_speed_kmh: AVERAGE_SPEED_KMH,
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_millis(200),
            buffer_size: 256,
        }
    }
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            average_speed_kmh: config.average_speed_kmh,
            reconnect_max_attempts: config.reconnect_max_attempts,
            reconnect_base_delay: config.reconnect_base_delay(),
            buffer_size: config.event_buffer_size,
        }
    }
}

/// Follows requests and their assigned ambulances, publishing a fresh ETA on
/// every ambulance snapshot.
///
/// Each request id has at most one live feed. Observers of the same request
/// share it, and the feed stops as soon as the last observer goes away.
pub struct RequestTracker {
    store: Arc<dyn DocumentStore>,
    settings: TrackerSettings,
    feeds: Arc<DashMap<String, Weak<Feed>>>,
    metrics: Metrics,
}

impl RequestTracker {
    pub fn new(store: Arc<dyn DocumentStore>, settings: TrackerSettings, metrics: Metrics) -> Self {
        Self {
            store,
            settings,
            feeds: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Starts observing a request. Fails with `NotFound` before anything is
    /// emitted when the request does not exist.
    pub async fn track(&self, request_id: &str) -> Result<Tracking, AppError> {
        if let Some(feed) = self.live_feed(request_id) {
            debug!(request_id, "joining existing tracking feed");
            return Ok(Tracking::attach(feed));
        }

        let request = load_request(self.store.as_ref(), request_id).await?;

        let mut stale = None;
        let feed = match self.feeds.entry(request_id.to_string()) {
            Entry::Occupied(mut slot) => match slot.get().upgrade() {
                Some(feed) if !feed.shared.is_closed() => feed,
                other => {
                    stale = other;
                    let feed = self.spawn_feed(request);
                    slot.insert(Arc::downgrade(&feed));
                    feed
                }
            },
            Entry::Vacant(slot) => {
                let feed = self.spawn_feed(request);
                slot.insert(Arc::downgrade(&feed));
                feed
            }
        };
        // Released only once the registry entry is unlocked; its Drop touches the map.
        drop(stale);

        Ok(Tracking::attach(feed))
    }

    /// Number of requests with a running feed.
    pub fn active_feeds(&self) -> usize {
        let feeds: Vec<Arc<Feed>> = self
            .feeds
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        feeds.iter().filter(|feed| !feed.shared.is_closed()).count()
    }

    fn live_feed(&self, request_id: &str) -> Option<Arc<Feed>> {
        let feed = self
            .feeds
            .get(request_id)
            .and_then(|entry| entry.value().upgrade())?;
        (!feed.shared.is_closed()).then_some(feed)
    }

    fn spawn_feed(&self, request: Request) -> Arc<Feed> {
        let request_id = request.id.clone();
        let shared = Arc::new(Shared::new(self.settings.buffer_size));
        let follower = Follower {
            store: self.store.clone(),
            settings: self.settings.clone(),
            shared: shared.clone(),
            metrics: self.metrics.clone(),
        };

        let task = tokio::spawn(follower.run(request));
        self.metrics.active_trackers.inc();
        info!(request_id = %request_id, "tracking feed started");

        Arc::new(Feed {
            request_id,
            shared,
            task,
            registry: self.feeds.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

/// Last published item plus the channel that fans it out. Both live behind
/// one lock so a new observer gets exactly the updates it has not seen.
struct Shared {
    state: Mutex<SharedState>,
}

struct SharedState {
    tx: Option<broadcast::Sender<FeedItem>>,
    last: Option<FeedItem>,
}

impl Shared {
    fn new(buffer_size: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer_size);
        Self {
            state: Mutex::new(SharedState {
                tx: Some(tx),
                last: None,
            }),
        }
    }

    fn publish(&self, item: FeedItem) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = &state.tx {
            let _ = tx.send(item.clone());
        }
        state.last = Some(item);
    }

    fn subscribe(&self) -> (Option<FeedItem>, Option<broadcast::Receiver<FeedItem>>) {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (
            state.last.clone(),
            state.tx.as_ref().map(broadcast::Sender::subscribe),
        )
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.tx = None;
    }

    fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.tx.is_none()
    }
}

struct Feed {
    request_id: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
    registry: Arc<DashMap<String, Weak<Feed>>>,
    metrics: Metrics,
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.task.abort();
        self.metrics.active_trackers.dec();
        self.registry
            .remove_if(&self.request_id, |_, feed| feed.strong_count() == 0);
        info!(request_id = %self.request_id, "tracking feed stopped");
    }
}

/// An observer's handle on a request feed. Yields the last known update
/// first, then every new one. Dropping it unsubscribes.
pub struct Tracking {
    updates: Pin<Box<dyn Stream<Item = FeedItem> + Send>>,
    feed: Arc<Feed>,
}

impl Tracking {
    fn attach(feed: Arc<Feed>) -> Self {
        let (last, rx) = feed.shared.subscribe();
        let backlog = tokio_stream::iter(last);

        let updates: Pin<Box<dyn Stream<Item = FeedItem> + Send>> = match rx {
            // A lagging observer skips ahead; every item is a full snapshot.
            Some(rx) => Box::pin(backlog.chain(BroadcastStream::new(rx).filter_map(Result::ok))),
            None => Box::pin(backlog),
        };

        Self { updates, feed }
    }

    pub fn request_id(&self) -> &str {
        &self.feed.request_id
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Tracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracking")
            .field("request_id", &self.feed.request_id)
            .finish_non_exhaustive()
    }
}

impl Stream for Tracking {
    type Item = FeedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.as_mut().poll_next(cx)
    }
}

enum Event {
    Request(Option<Result<Document, AppError>>),
    Ambulance(Option<Result<Document, AppError>>),
}

/// The single consumer of one request's store subscriptions.
struct Follower {
    store: Arc<dyn DocumentStore>,
    settings: TrackerSettings,
    shared: Arc<Shared>,
    metrics: Metrics,
}

impl Follower {
    async fn run(self, request: Request) {
        let request_id = request.id.clone();
        if let Err(err) = self.follow(request).await {
            warn!(request_id = %request_id, error = %err, "tracking feed failed");
            self.shared.publish(Err(err));
        }
        self.shared.close();
    }

    async fn follow(&self, mut request: Request) -> Result<(), AppError> {
        let request_id = request.id.clone();
        let mut request_stream = self
            .open(|| self.store.watch_request(&request_id))
            .await?;

        let mut ambulance: Option<Ambulance> = None;
        let mut ambulance_stream = match request.ambulance_id.clone() {
            Some(id) => Some(self.open_ambulance(&id).await?),
            None => {
                self.emit(&request, None);
                None
            }
        };

        loop {
            let event = tokio::select! {
                snapshot = request_stream.next() => Event::Request(snapshot),
                snapshot = next_snapshot(&mut ambulance_stream) => Event::Ambulance(snapshot),
            };

            match event {
                Event::Request(Some(Ok(doc))) => {
                    let next: Request = match doc.decode(REQUESTS) {
                        Ok(next) => next,
                        Err(err) => {
                            self.shared.publish(Err(err));
                            continue;
                        }
                    };
                    if next == request {
                        continue;
                    }

                    let reassigned = next.ambulance_id != request.ambulance_id;
                    if next.status.is_terminal() && !request.status.is_terminal() {
                        info!(request_id = %next.id, status = ?next.status, "request reached a final status");
                    }
                    request = next;

                    if reassigned {
                        ambulance = None;
                        ambulance_stream = match request.ambulance_id.clone() {
                            Some(id) => {
                                info!(request_id = %request.id, ambulance_id = %id, "ambulance assigned");
                                Some(self.open_ambulance(&id).await?)
                            }
                            None => {
                                self.emit(&request, None);
                                None
                            }
                        };
                    } else {
                        self.emit(&request, ambulance.as_ref());
                    }
                }
                Event::Ambulance(Some(Ok(doc))) => match doc.decode::<Ambulance>(AMBULANCES) {
                    Ok(snapshot) => {
                        self.emit(&request, Some(&snapshot));
                        ambulance = Some(snapshot);
                    }
                    Err(err) => self.shared.publish(Err(err)),
                },
                Event::Request(lost) => {
                    if let Some(Err(err)) = lost {
                        warn!(request_id = %request.id, error = %err, "request subscription error");
                    }
                    request_stream = self
                        .open(|| self.store.watch_request(&request_id))
                        .await?;
                }
                Event::Ambulance(lost) => {
                    if let Some(Err(err)) = lost {
                        warn!(request_id = %request.id, error = %err, "ambulance subscription error");
                    }
                    ambulance_stream = match request.ambulance_id.clone() {
                        Some(id) => Some(self.open_ambulance(&id).await?),
                        None => None,
                    };
                }
            }
        }
    }

    async fn open_ambulance(&self, ambulance_id: &str) -> Result<SnapshotStream, AppError> {
        self.open(|| self.store.watch_ambulance(ambulance_id)).await
    }

    /// Opens a subscription, retrying retryable failures with exponential
    /// backoff. The resumed stream starts with the document's current state.
    async fn open<F, Fut>(&self, connect: F) -> Result<SnapshotStream, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<SnapshotStream, AppError>>,
    {
        let max_attempts = self.settings.reconnect_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match connect().await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.settings.reconnect_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    self.metrics.tracker_reconnects_total.inc();
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "subscription unavailable; retrying");
                    sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(AppError::Retrieval(format!(
                        "live updates unavailable after {max_attempts} attempts: {err}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn emit(&self, request: &Request, ambulance: Option<&Ambulance>) {
        let eta = ambulance.map(|ambulance| {
            let distance_km = haversine_km(&ambulance.location, &request.pickup);
            EtaEstimate::from_distance(distance_km, self.settings.average_speed_kmh)
        });

        if let Some(eta) = &eta {
            self.metrics.eta_updates_total.inc();
            debug!(request_id = %request.id, minutes = eta.minutes, distance_km = eta.distance_km, "eta recomputed");
        }

        self.shared.publish(Ok(TrackingUpdate {
            request_id: request.id.clone(),
            request_status: request.status,
            ambulance: ambulance.cloned(),
            eta,
        }));
    }
}

async fn next_snapshot(stream: &mut Option<SnapshotStream>) -> Option<Result<Document, AppError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
