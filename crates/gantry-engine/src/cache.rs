//! Shared download cache
//!
//! Fetches URLs over HTTP with optional on-disk caching keyed by the
//! caller's cache key. Cached payloads are evicted least-recently-used once
//! the directory exceeds its size ceiling. Fetches are cancelable between
//! chunks.

use crate::cancel::CancelToken;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("fetch cancelled")]
    Cancelled,

    #[error("request failed: {0}")]
    Http(String),

    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    /// Monotone use counter; smallest value is the eviction candidate
    last_used: u64,
}

/// HTTP fetcher with an LRU disk cache
pub struct DownloadCache {
    directory: PathBuf,
    max_size_bytes: u64,
    client: reqwest::Client,
    entries: Mutex<HashMap<String, CacheEntry>>,
    use_counter: AtomicU64,
}

impl DownloadCache {
    pub fn new(directory: PathBuf, max_size_bytes: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            max_size_bytes,
            client: reqwest::Client::new(),
            entries: Mutex::new(HashMap::new()),
            use_counter: AtomicU64::new(0),
        })
    }

    /// Fetch `url`, consulting the cache when `cache_key` is given.
    /// Returns the payload and the number of bytes that actually came over
    /// the network (zero on a cache hit).
    pub async fn fetch(
        &self,
        url: &str,
        cache_key: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<(Vec<u8>, u64)> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        if let Some(key) = cache_key {
            if let Some(path) = self.lookup(key) {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        tracing::debug!(url, key, "Download cache hit");
                        return Ok((bytes, 0));
                    }
                    Err(e) => {
                        // Entry vanished underneath us; drop it and refetch
                        tracing::debug!(key, error = %e, "Evicting unreadable cache entry");
                        self.entries.lock().unwrap().remove(key);
                    }
                }
            }
        }

        let bytes = self.fetch_uncached(url, cancel).await?;
        let downloaded = bytes.len() as u64;

        if let Some(key) = cache_key {
            if let Err(e) = self.store(key, &bytes).await {
                tracing::warn!(key, error = %e, "Failed to cache download");
            }
        }

        Ok((bytes, downloaded))
    }

    async fn fetch_uncached(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        let send = self.client.get(url).send();
        let response = tokio::select! {
            response = send => response.map_err(|e| CacheError::Http(e.to_string()))?,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };
        let mut response = response
            .error_for_status()
            .map_err(|e| CacheError::Http(e.to_string()))?;

        let mut bytes = Vec::new();
        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk.map_err(|e| CacheError::Http(e.to_string()))?,
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            };
            match chunk {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(bytes)
    }

    fn lookup(&self, key: &str) -> Option<PathBuf> {
        let stamp = self.use_counter.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        entry.last_used = stamp;
        Some(entry.path.clone())
    }

    async fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.directory.join(file_name_for(key));
        tokio::fs::write(&path, bytes).await?;

        let stamp = self.use_counter.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                path,
                size: bytes.len() as u64,
                last_used: stamp,
            },
        );

        // Evict least-recently-used entries until we fit again
        let mut in_use: u64 = entries.values().map(|e| e.size).sum();
        while in_use > self.max_size_bytes {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(evicted) = entries.remove(&oldest) {
                in_use -= evicted.size;
                let _ = std::fs::remove_file(&evicted.path);
                tracing::debug!(key = %oldest, "Evicted cached download");
            }
        }
        Ok(())
    }
}

/// Stable on-disk name for a cache key
fn file_name_for(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> (tempfile::TempDir, DownloadCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path().to_path_buf(), max).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let (_dir, cache) = cache(1024);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = cache
            .fetch("http://127.0.0.1:1/never", Some("key"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[tokio::test]
    async fn unreachable_host_reports_http_error() {
        let (_dir, cache) = cache(1024);
        let err = cache
            .fetch("http://127.0.0.1:1/nope", None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Http(_)));
    }

    #[tokio::test]
    async fn store_and_lookup_round_trip() {
        let (_dir, cache) = cache(1024);
        cache.store("droplet", b"payload").await.unwrap();

        let path = cache.lookup("droplet").expect("entry exists");
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let (_dir, cache) = cache(10);
        cache.store("a", &[0u8; 6]).await.unwrap();
        cache.store("b", &[0u8; 6]).await.unwrap();

        // 12 bytes exceeds the 10-byte cap: "a" (older) goes
        assert!(cache.lookup("a").is_none());
        assert!(cache.lookup("b").is_some());
    }
}
