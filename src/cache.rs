//! In-memory response cache shared by every GET handler.
//!
//! Entries are immutable once built and handed out as `Arc` snapshots; an
//! update swaps the whole `Arc` under the write lock, so readers never see a
//! partially written entry. Nothing is evicted: stale entries stay
//! addressable and are revalidated on their next use.

use crate::cache_control::CacheDirectives;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{
    CONNECTION, CONTENT_LENGTH, ETAG, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    TRANSFER_ENCODING,
};
use hyper::{HeaderMap, Response, StatusCode, header::HeaderValue};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Normalized request target: `http://host[:port]/path?query`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(host: &str, port: u16, path_and_query: &str) -> Self {
        let host = host.to_ascii_lowercase();
        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        let path = if path_and_query.is_empty() { "/" } else { path_and_query };
        if port == 80 {
            CacheKey(format!("http://{}{}", host, path))
        } else {
            CacheKey(format!("http://{}:{}{}", host, port, path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// `no-cache` or `must-revalidate` on the stored response.
    RevalidationRequired,
    Expired { age_secs: u64, max_age: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
    pub directives: CacheDirectives,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, stored_at: DateTime<Utc>) -> Self {
        let directives = CacheDirectives::from_headers(&headers);
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());

        Self {
            status,
            headers,
            body,
            stored_at,
            directives,
            etag,
            last_modified,
        }
    }

    pub fn is_storable(&self) -> bool {
        self.directives.is_storable()
    }

    /// Seconds since the entry was stored, clamped at zero.
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.stored_at).num_seconds().max(0) as u64
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.directives.requires_revalidation() {
            return Freshness::Stale(StaleReason::RevalidationRequired);
        }

        match self.directives.max_age {
            Some(max_age) => {
                let age_secs = self.age_secs(now);
                if age_secs < max_age {
                    Freshness::Fresh
                } else {
                    Freshness::Stale(StaleReason::Expired { age_secs, max_age })
                }
            }
            None => Freshness::Fresh,
        }
    }

    /// Validators for a conditional request against this entry.
    pub fn conditional_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(etag) = self.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = self.last_modified {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(last_modified)) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
        headers
    }

    /// Build the replacement entry after a `304 Not Modified`: same status
    /// and body, headers refreshed from the 304, stored now.
    pub fn revalidated(&self, not_modified: &HeaderMap, now: DateTime<Utc>) -> CacheEntry {
        let mut headers = self.headers.clone();
        let names: Vec<&HeaderName> = not_modified.keys().collect();
        for name in names {
            if is_framing_header(name) {
                continue;
            }
            headers.remove(name);
            for value in not_modified.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        CacheEntry::new(self.status, headers, self.body.clone(), now)
    }

    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

// A 304 describes no body, so its framing headers must not leak onto the
// stored one.
fn is_framing_header(name: &HeaderName) -> bool {
    name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub stores: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    stores: AtomicU64,
}

type FlightMap = HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive right to fetch or revalidate one key. The key's lock is
/// dropped from the store once nobody holds or waits on it.
pub struct FlightGuard {
    key: CacheKey,
    lock: Option<OwnedMutexGuard<()>>,
    flights: Arc<Mutex<FlightMap>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release first: the owned guard keeps its own reference to the lock.
        drop(self.lock.take());
        let mut flights = self.flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Waiters clone the lock under this map mutex, so a count of one
        // means only the map still refers to it.
        if flights.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            flights.remove(&self.key);
        }
    }
}

#[derive(Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    // One lock per key so that only one handler at a time fetches or
    // revalidates it.
    flights: Arc<Mutex<FlightMap>>,
    counters: CacheCounters,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Insert or replace the entry for `key`. Entries that are not storable
    /// (`no-store`, `private`) are refused and the existing entry, if any,
    /// is left untouched.
    pub async fn insert(&self, key: CacheKey, entry: CacheEntry) -> bool {
        if !entry.is_storable() {
            debug!("Not caching {}: {:?}", key, entry.directives);
            return false;
        }
        debug!("Caching {} (max-age {:?})", key, entry.directives.max_age);
        self.entries.write().await.insert(key, Arc::new(entry));
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Wait for exclusive rights to fetch or revalidate `key`.
    pub async fn begin_flight(&self, key: &CacheKey) -> FlightGuard {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            flights.entry(key.clone()).or_default().clone()
        };
        let lock = flight.lock_owned().await;
        FlightGuard {
            key: key.clone(),
            lock: Some(lock),
            flights: self.flights.clone(),
        }
    }

    #[cfg(test)]
    fn flights_in_progress(&self) -> usize {
        self.flights.lock().map(|flights| flights.len()).unwrap_or(0)
    }

    pub fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation(&self) {
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
        }
    }
}
