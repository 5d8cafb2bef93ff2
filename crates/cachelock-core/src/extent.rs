//! Extent storage interface.
//!
//! The lock server never touches extents. Applications that use cachelock to
//! serialise access to shared blobs pair it with an [`ExtentStore`]: take the
//! lock for an extent id, read-modify-write the extent, release the lock.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque extent identifier.
pub type ExtentId = u64;

/// Size and timestamps of one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentAttr {
    pub size: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

/// Byte-blob store keyed by [`ExtentId`].
pub trait ExtentStore: Send + Sync {
    /// Read an extent, updating its access time.
    fn get(&self, id: ExtentId) -> Result<Vec<u8>>;

    /// Create or overwrite an extent.
    fn put(&self, id: ExtentId, data: Vec<u8>) -> Result<()>;

    fn getattr(&self, id: ExtentId) -> Result<ExtentAttr>;

    fn remove(&self, id: ExtentId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Extent {
    data: Vec<u8>,
    attr: ExtentAttr,
}

/// Process-local [`ExtentStore`].
#[derive(Debug, Default)]
pub struct MemoryExtentStore {
    extents: Mutex<HashMap<ExtentId, Extent>>,
}

impl MemoryExtentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn extents(&self) -> MutexGuard<'_, HashMap<ExtentId, Extent>> {
        self.extents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: ExtentId) -> Error {
    Error::NotFound(format!("extent {id}"))
}

impl ExtentStore for MemoryExtentStore {
    fn get(&self, id: ExtentId) -> Result<Vec<u8>> {
        let mut extents = self.extents();
        let extent = extents.get_mut(&id).ok_or_else(|| not_found(id))?;
        extent.attr.atime = Utc::now();
        Ok(extent.data.clone())
    }

    fn put(&self, id: ExtentId, data: Vec<u8>) -> Result<()> {
        let now = Utc::now();
        let size = data.len() as u64;
        self.extents()
            .entry(id)
            .and_modify(|extent| {
                extent.attr.size = size;
                extent.attr.mtime = now;
                extent.attr.ctime = now;
            })
            .or_insert_with(|| Extent {
                data: Vec::new(),
                attr: ExtentAttr {
                    size,
                    atime: now,
                    mtime: now,
                    ctime: now,
                },
            })
            .data = data;
        Ok(())
    }

    fn getattr(&self, id: ExtentId) -> Result<ExtentAttr> {
        self.extents()
            .get(&id)
            .map(|extent| extent.attr)
            .ok_or_else(|| not_found(id))
    }

    fn remove(&self, id: ExtentId) -> Result<()> {
        self.extents()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }
}
