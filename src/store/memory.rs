//! In-memory [`RemoteStore`] implementation for tests and local dry runs.
//!
//! Keeps identifiers in a `BTreeMap` behind `std::sync::RwLock` and counts
//! every call so tests can assert on how many network operations a pipeline
//! run would have made. Listing pages use the numeric offset as the cursor.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ListPage, RemoteError, RemoteStore, UploadOutcome};
use crate::models::{LogicalIdentifier, RemoteAsset};

/// In-memory remote store.
pub struct InMemoryStore {
    assets: RwLock<BTreeMap<String, u64>>,
    upload_calls: AtomicU64,
    list_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(BTreeMap::new()),
            upload_calls: AtomicU64::new(0),
            list_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    /// Seed an identifier directly, bypassing the call counters.
    pub fn insert(&self, id: &str) {
        self.write().insert(id.to_string(), 0);
    }

    /// Snapshot of all stored identifiers in ascending order.
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn upload_calls(&self) -> u64 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, u64>> {
        self.assets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, u64>> {
        self.assets.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        local: &Path,
        id: &LogicalIdentifier,
        overwrite: bool,
    ) -> Result<UploadOutcome, RemoteError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let size = tokio::fs::metadata(local)
            .await
            .map_err(|source| RemoteError::Io {
                path: local.display().to_string(),
                source,
            })?
            .len();

        let mut assets = self.write();
        if !overwrite && assets.contains_key(id.as_str()) {
            return Ok(UploadOutcome::AlreadyPresent);
        }
        assets.insert(id.as_str().to_string(), size);
        Ok(UploadOutcome::Uploaded {
            remote_id: id.clone(),
        })
    }

    async fn list_page(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| RemoteError::InvalidResponse(format!("bad cursor '{}'", c)))?,
            None => 0,
        };
        let page_size = page_size.max(1) as usize;

        let assets = self.read();
        let matching: Vec<(&String, &u64)> = assets
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();

        let page: Vec<RemoteAsset> = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|(k, v)| RemoteAsset {
                id: LogicalIdentifier::from_remote(k.as_str()),
                bytes: Some(**v),
            })
            .collect();

        let next = offset + page.len();
        let next_cursor = if next < matching.len() {
            Some(next.to_string())
        } else {
            None
        };

        Ok(ListPage {
            assets: page,
            next_cursor,
        })
    }

    async fn delete_by_ids(&self, ids: &[LogicalIdentifier]) -> Result<u64, RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut assets = self.write();
        let deleted = ids
            .iter()
            .filter(|id| assets.remove(id.as_str()).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut assets = self.write();
        let before = assets.len();
        assets.retain(|k, _| !k.starts_with(prefix));
        Ok((before - assets.len()) as u64)
    }
}
