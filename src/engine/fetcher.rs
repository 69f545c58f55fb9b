// Deduplicated download pipeline — at most one network fetch per cache key,
// executed on a bounded worker pool with retry, backoff and cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventEmitter, ImageEvent};
use crate::error::EngineError;
use crate::resolver::CacheKey;
use crate::source::ImageSource;
use crate::store::{CacheEntry, DiskStore};

/// Per-key fetch state shared by every concurrent requester of that key.
/// `ids` collects the logical reference of every requester that joined, so
/// the terminal event reaches each of them under its own id.
struct InFlightFetch {
    notify: Notify,
    outcome: Mutex<Option<Result<CacheEntry, EngineError>>>,
    waiters: Mutex<usize>,
    ids: Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl InFlightFetch {
    fn new(parent: &CancellationToken, id: String) -> Self {
        Self {
            notify: Notify::new(),
            outcome: Mutex::new(None),
            waiters: Mutex::new(1),
            ids: Mutex::new(vec![id]),
            cancel: parent.child_token(),
        }
    }
}

/// Decrements the waiter count when a requester's future is dropped. The
/// last withdrawal cancels the underlying network operation.
struct WaiterGuard {
    record: Arc<InFlightFetch>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.record.waiters.lock();
        *waiters = waiters.saturating_sub(1);
        if *waiters == 0 && self.record.outcome.lock().is_none() {
            debug!("last waiter withdrew, cancelling fetch");
            self.record.cancel.cancel();
        }
    }
}

pub struct Fetcher {
    source: Arc<dyn ImageSource>,
    store: Arc<DiskStore>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<CacheKey, Arc<InFlightFetch>>>>,
    events: EventEmitter,
    shutdown: CancellationToken,
    retry_limit: u32,
    backoff_base: Duration,
    fetch_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        source: Arc<dyn ImageSource>,
        store: Arc<DiskStore>,
        events: EventEmitter,
        max_concurrent: u32,
        retry_limit: u32,
        backoff_base: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events,
            shutdown: CancellationToken::new(),
            retry_limit,
            backoff_base,
            fetch_timeout,
        }
    }

    /// Cancel all in-flight fetches and reject new work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let in_flight = self.in_flight.lock();
        for record in in_flight.values() {
            record.cancel.cancel();
        }
    }

    /// Fetch `url` into the cache under `key`. Concurrent calls for the same
    /// key share one network operation and receive the same terminal
    /// outcome; the terminal event is emitted once per requester id.
    /// Dropping the returned future withdraws from the waiter set.
    pub async fn fetch(
        &self,
        id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        key: &CacheKey,
    ) -> Result<CacheEntry, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShutDown);
        }

        let record = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(key) {
                *existing.waiters.lock() += 1;
                existing.ids.lock().push(id.to_string());
                debug!("joining in-flight fetch for {}", key);
                existing.clone()
            } else {
                let record = Arc::new(InFlightFetch::new(&self.shutdown, id.to_string()));
                in_flight.insert(key.clone(), record.clone());
                self.spawn_driver(id.to_string(), url.to_string(), headers.clone(), key.clone());
                record
            }
        };

        let _guard = WaiterGuard {
            record: record.clone(),
        };

        loop {
            let notified = record.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = record.outcome.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    fn spawn_driver(&self, id: String, url: String, headers: BTreeMap<String, String>, key: CacheKey) {
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let events = self.events.clone();
        let retry_limit = self.retry_limit;
        let backoff_base = self.backoff_base;
        let fetch_timeout = self.fetch_timeout;

        tokio::spawn(async move {
            let record = {
                let map = in_flight.lock();
                match map.get(&key) {
                    Some(r) => r.clone(),
                    None => return,
                }
            };

            let outcome = Self::drive(
                &id,
                &url,
                &headers,
                &key,
                source,
                store,
                semaphore,
                &events,
                &record,
                retry_limit,
                backoff_base,
                fetch_timeout,
            )
            .await;

            // Every requester that joined gets the terminal event under its
            // own id, not just the one that started the fetch.
            let ids = record.ids.lock().clone();
            for waiter_id in &ids {
                match &outcome {
                    Ok(entry) => events.emit(ImageEvent::Succeeded {
                        id: waiter_id.clone(),
                        local_path: entry.path.clone(),
                    }),
                    Err(EngineError::Cancelled) => {
                        events.emit(ImageEvent::Cancelled { id: waiter_id.clone() })
                    }
                    Err(e) => events.emit(ImageEvent::Failed {
                        id: waiter_id.clone(),
                        reason: e.to_string(),
                    }),
                }
            }

            *record.outcome.lock() = Some(outcome);
            record.notify.notify_waiters();
            in_flight.lock().remove(&key);
        });
    }

    /// One key's full fetch lifecycle: queue for a worker slot, then attempt
    /// with retry and exponential backoff until a terminal outcome.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        key: &CacheKey,
        source: Arc<dyn ImageSource>,
        store: Arc<DiskStore>,
        semaphore: Arc<Semaphore>,
        events: &EventEmitter,
        record: &InFlightFetch,
        retry_limit: u32,
        backoff_base: Duration,
        fetch_timeout: Duration,
    ) -> Result<CacheEntry, EngineError> {
        // Queued only materializes when the pool is saturated.
        if semaphore.available_permits() == 0 {
            events.emit(ImageEvent::Queued { id: id.to_string() });
        }

        let _permit = tokio::select! {
            permit = semaphore.acquire() => {
                permit.map_err(|_| EngineError::ShutDown)?
            }
            _ = record.cancel.cancelled() => {
                debug!("fetch {} cancelled while queued", key);
                return Err(EngineError::Cancelled);
            }
        };

        events.emit(ImageEvent::Started { id: id.to_string() });

        for attempt in 0..=retry_limit {
            if record.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // Cancellation aborts the attempt at its next suspension point;
            // dropping the attempt future discards any partial write.
            let attempt_result = tokio::select! {
                res = tokio::time::timeout(
                    fetch_timeout,
                    Self::attempt(id, url, headers, key, &source, &store, events, record),
                ) => res.unwrap_or_else(|_| {
                    Err(EngineError::NetworkTransient(format!(
                        "fetch of {} timed out",
                        url
                    )))
                }),
                _ = record.cancel.cancelled() => {
                    debug!("fetch {} cancelled mid-attempt", key);
                    return Err(EngineError::Cancelled);
                }
            };

            match attempt_result {
                Ok(entry) => {
                    debug!("fetch {} complete ({} bytes)", key, entry.len);
                    return Ok(entry);
                }
                Err(e) if e.is_transient() && attempt < retry_limit => {
                    let backoff = backoff_base * 2u32.saturating_pow(attempt);
                    warn!(
                        "fetch {} failed (attempt {}): {}; retrying in {:?}",
                        key, attempt, e, backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = record.cancel.cancelled() => {
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
                Err(e) => {
                    warn!("fetch {} failed terminally: {}", key, e);
                    return Err(e);
                }
            }
        }

        // Not reachable: the final attempt always returns above. Kept as a
        // terminal error rather than a panic.
        Err(EngineError::NetworkTransient(format!(
            "fetch of {} exhausted retries",
            url
        )))
    }

    /// One network attempt: open the response and stream it into the store,
    /// reporting progress and honoring cancellation at chunk boundaries.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        key: &CacheKey,
        source: &Arc<dyn ImageSource>,
        store: &Arc<DiskStore>,
        events: &EventEmitter,
        record: &InFlightFetch,
    ) -> Result<CacheEntry, EngineError> {
        let body = source.fetch(url, headers).await?;
        let bytes_total = body.content_length;
        let mut stream = body.stream;
        let mut pending = store.begin(key)?;

        while let Some(chunk) = stream.next().await {
            if record.cancel.is_cancelled() {
                // Dropping `pending` discards the partial file.
                return Err(EngineError::Cancelled);
            }
            let chunk = chunk?;
            pending.write_chunk(&chunk)?;
            events.emit(ImageEvent::Progress {
                id: id.to_string(),
                bytes_received: pending.written(),
                bytes_total,
            });
        }

        store.commit(key, pending)
    }
}
