//! Versioned cache storage.
//!
//! ```text
//! CacheStorage (caches)
//!     ├── novira-v2.5.0  (stale, deleted on activate)
//!     └── novira-v2.6.0  (current)
//!             └── "GET <url>" → CacheEntry
//! ```
//!
//! Entries are replaced whole under the storage write lock, so a reader sees
//! either the previous snapshot or the new one.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, StatusCode};
use novira_common::NoviraError;
use novira_net::Response;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// Cache storage shared between the router, background refreshes and the
/// lifecycle handlers.
pub type SharedCaches = Arc<RwLock<CacheStorage>>;

/// Errors raised by cache writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry {key} is {size} bytes, limit is {limit}")]
    EntryTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
}

impl From<CacheError> for NoviraError {
    fn from(err: CacheError) -> Self {
        NoviraError::cache(err.to_string())
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, raw bytes kept as received.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    pub fn from_response(method: &str, response: &Response) -> Self {
        Self {
            url: response.url.clone(),
            method: method.to_string(),
            status: response.status.as_u16(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        Response {
            url: self.url.clone(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A cache instance.
#[derive(Debug)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Largest body accepted by `put`.
    max_entry_bytes: usize,

    /// Cached entries keyed by `"<METHOD> <url>"`.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str, max_entry_bytes: usize) -> Self {
        Self {
            name: name.to_string(),
            max_entry_bytes,
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store or replace an entry.
    pub fn put(&mut self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.body.len() > self.max_entry_bytes {
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size: entry.body.len(),
                limit: self.max_entry_bytes,
            });
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    /// Store a batch; nothing is written unless every entry fits.
    pub fn put_all(&mut self, entries: Vec<(String, CacheEntry)>) -> Result<(), CacheError> {
        if let Some((key, entry)) = entries
            .iter()
            .find(|(_, entry)| entry.body.len() > self.max_entry_bytes)
        {
            return Err(CacheError::EntryTooLarge {
                key: key.clone(),
                size: entry.body.len(),
                limit: self.max_entry_bytes,
            });
        }
        self.entries.extend(entries);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache storage (caches global).
#[derive(Debug)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,

    /// Creation order, searched front to back by `match_request`.
    order: Vec<String>,

    max_entry_bytes: usize,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new(max_entry_bytes: usize) -> Self {
        Self {
            caches: HashMap::new(),
            order: Vec::new(),
            max_entry_bytes,
        }
    }

    /// Wrap for sharing across tasks.
    pub fn shared(max_entry_bytes: usize) -> SharedCaches {
        Arc::new(RwLock::new(Self::new(max_entry_bytes)))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        let limit = self.max_entry_bytes;
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name, limit))
    }

    /// Look at a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Mutable access to an existing cache; never creates one.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches, oldest first.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(key))
    }

    /// Match in one named cache only.
    pub fn match_in(&self, name: &str, key: &str) -> Option<&CacheEntry> {
        self.caches.get(name).and_then(|c| c.match_request(key))
    }

    /// Delete every cache except `keep`. Returns the deleted names.
    pub fn retain_only(&mut self, keep: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .order
            .iter()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();
        for name in &stale {
            self.delete(name);
        }
        stale
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderName, HeaderValue};

    fn entry(url: &str, body: &'static str) -> CacheEntry {
        let response = Response::new(Url::parse(url).unwrap(), StatusCode::OK, body);
        CacheEntry::from_response("GET", &response)
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("novira-v1", 1024);

        cache
            .put("GET https://app.test/style.css", entry("https://app.test/style.css", "body{}"))
            .unwrap();

        assert!(cache.match_request("GET https://app.test/style.css").is_some());
        assert!(cache.match_request("GET https://app.test/other.css").is_none());
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("novira-v1", 1024);

        cache
            .put("GET https://app.test/a.js", entry("https://app.test/a.js", "1"))
            .unwrap();
        assert!(cache.delete("GET https://app.test/a.js"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_rejects_oversized_body() {
        let mut cache = Cache::new("novira-v1", 4);
        let err = cache
            .put("GET https://app.test/big", entry("https://app.test/big", "too large"))
            .unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { size: 9, limit: 4, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_all_is_all_or_nothing() {
        let mut cache = Cache::new("novira-v1", 4);
        let batch = vec![
            ("GET https://app.test/".to_string(), entry("https://app.test/", "ok")),
            ("GET https://app.test/big".to_string(), entry("https://app.test/big", "too large")),
        ];
        assert!(cache.put_all(batch).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_whole_entry() {
        let mut cache = Cache::new("novira-v1", 1024);
        let key = "GET https://x.supabase.co/rest/v1/t";
        cache.put(key, entry("https://x.supabase.co/rest/v1/t", "old")).unwrap();
        cache.put(key, entry("https://x.supabase.co/rest/v1/t", "new")).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_request(key).unwrap().body, Bytes::from_static(b"new"));
    }

    #[test]
    fn test_entry_round_trips_headers() {
        let mut response = Response::new(
            Url::parse("https://app.test/manifest.json").unwrap(),
            StatusCode::OK,
            "{}",
        );
        response.headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/manifest+json"),
        );

        let restored = CacheEntry::from_response("GET", &response).to_response();
        assert_eq!(restored.header("content-type"), Some("application/manifest+json"));
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.body, response.body);
    }

    #[test]
    fn test_entry_keeps_opaque_header_bytes() {
        let mut response = Response::new(
            Url::parse("https://x.supabase.co/rest/v1/places").unwrap(),
            StatusCode::OK,
            "[]",
        );
        response.headers.insert(
            HeaderName::from_static("x-place-name"),
            HeaderValue::from_bytes(b"caf\xe9").unwrap(),
        );
        response.headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1"),
        );
        response.headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("b=2"),
        );

        let restored = CacheEntry::from_response("GET", &response).to_response();
        let value = restored.headers.get("x-place-name").unwrap();
        assert_eq!(value.as_bytes(), b"caf\xe9");
        assert!(value.to_str().is_err());

        let cookies: Vec<_> = restored.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new(1024);

        assert!(!storage.has("novira-v1"));

        storage.open("novira-v1");
        assert!(storage.has("novira-v1"));

        assert!(storage.delete("novira-v1"));
        assert!(!storage.has("novira-v1"));
        assert!(storage.keys().is_empty());
        assert!(storage.get_mut("novira-v1").is_none());
    }

    #[test]
    fn test_match_across_stores_prefers_oldest() {
        let mut storage = CacheStorage::new(1024);
        let key = "GET https://app.test/";
        storage.open("novira-v1").put(key, entry("https://app.test/", "v1")).unwrap();
        storage.open("novira-v2").put(key, entry("https://app.test/", "v2")).unwrap();

        assert_eq!(storage.match_request(key).unwrap().body, Bytes::from_static(b"v1"));
        assert_eq!(
            storage.match_in("novira-v2", key).unwrap().body,
            Bytes::from_static(b"v2")
        );
    }

    #[test]
    fn test_retain_only() {
        let mut storage = CacheStorage::new(1024);
        storage.open("novira-v2.5.0");
        storage.open("other-app");
        storage.open("novira-v2.6.0");

        let mut deleted = storage.retain_only("novira-v2.6.0");
        deleted.sort();
        assert_eq!(deleted, vec!["novira-v2.5.0", "other-app"]);
        assert_eq!(storage.keys(), vec!["novira-v2.6.0"]);
    }
}
