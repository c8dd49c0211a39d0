//! Content-addressed artifact storage.
//!
//! An artifact is an immutable blob named by the SHA-256 of its bytes.
//! Writing the same bytes twice is a no-op, and reads are verified against
//! the name so a corrupted blob is never handed downstream.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Durable, content-addressed blob store.
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes`, returning their content hash.
    fn put(&self, bytes: &[u8]) -> Result<String>;

    /// Fetch and verify the artifact named `hash`.
    fn get(&self, hash: &str) -> Result<Vec<u8>>;

    fn contains(&self, hash: &str) -> Result<bool>;
}

/// Serialize `value` as canonical JSON and store it.
pub fn put_json<T: Serialize>(store: &dyn ArtifactStore, value: &T) -> Result<String> {
    store.put(&serde_json::to_vec(value)?)
}

pub fn get_json<T: DeserializeOwned>(store: &dyn ArtifactStore, hash: &str) -> Result<T> {
    Ok(serde_json::from_slice(&store.get(hash)?)?)
}

fn verify(hash: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
    if content_hash(&bytes) != hash {
        return Err(Error::ArtifactCorrupted {
            hash: hash.to_string(),
        });
    }
    Ok(bytes)
}

/// Artifacts stored as `<dir>/<hash>` files.
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, hash: &str) -> Result<PathBuf> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("invalid artifact hash '{}'", hash)));
        }
        Ok(self.dir.join(hash))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl ArtifactStore for FileArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = content_hash(bytes);
        let path = self.path_for(&hash)?;
        match fs::read(&path) {
            Ok(existing) if existing == bytes => return Ok(hash),
            Ok(_) => warn!(hash = %hash, "replacing corrupted artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // The blob must be durable before any checkpoint names it.
        let tmp = self.dir.join(format!(".{}.tmp", hash));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        debug!(hash = %hash, bytes = bytes.len(), "artifact stored");
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.path_for(hash)?;
        match fs::read(&path) {
            Ok(bytes) => verify(hash, bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ArtifactNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.path_for(hash)?.exists())
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("artifact store lock poisoned".into())
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = content_hash(bytes);
        self.blobs
            .write()
            .map_err(poisoned)?
            .entry(hash.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let bytes = self
            .blobs
            .read()
            .map_err(poisoned)?
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::ArtifactNotFound(hash.to_string()))?;
        verify(hash, bytes)
    }

    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.read().map_err(poisoned)?.contains_key(hash))
    }
}
