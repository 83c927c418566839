// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Blob storage seam for voice samples and audio artifacts.
//!
//! The object-store backend (S3 or similar) is an external collaborator;
//! only the contract lives here, with an in-memory implementation for the
//! demo binary and tests.

use crate::error::Error;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Keyed blob storage with deadline-bounded calls.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error>;

    /// Fetches the blob under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Removes the blob under `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// A directly fetchable URL for `key`, when the backend can mint one.
    /// Backends without URL support return `None` and callers stream the
    /// bytes instead.
    fn url_for(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Process-local blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
        let _ = self.blobs.lock().insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound { entity: "blob", id: key.to_owned() })
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let _ = self.blobs.lock().remove(key);
        Ok(())
    }
}
