//! External object storage for blocks at or above the inline threshold.
//!
//! One object per block, key = CID string. Operations are idempotent by key,
//! so a duplicate upload race resolves to a harmless overwrite.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use rusty_s3::actions::S3Action;
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::config::ServerConfig;
use crate::storage::{StorageError, StorageResult};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Capability interface over external object storage so the storage engine
/// is testable against an in-memory fake.
pub trait ObjectStore: Send + Sync {
    /// `Ok(false)` strictly means "the key does not exist". Transient
    /// failures must surface as errors, or the dedup probe could lie and a
    /// manifest end up referencing a block nobody stored.
    fn exists(&self, key: &str) -> StorageResult<bool>;
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()>;
    fn get(&self, key: &str) -> StorageResult<Vec<u8>>;
    fn delete(&self, key: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
}

impl S3Store {
    pub fn from_config(cfg: &ServerConfig) -> StorageResult<Self> {
        let base_url = cfg.s3_endpoint.parse().map_err(|e| {
            StorageError::ObjectStore(format!("invalid S3 endpoint '{}': {e}", cfg.s3_endpoint))
        })?;

        // Path-style addressing for MinIO and other S3-compatible services.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            cfg.s3_bucket.clone(),
            cfg.s3_region.clone(),
        )
        .map_err(|e| StorageError::ObjectStore(format!("failed to create bucket handle: {e}")))?;

        let credentials = Credentials::new(&cfg.s3_access_key, &cfg.s3_secret_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
        })
    }

    /// Retry a closure on transient errors with exponential backoff + jitter.
    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> Result<T, ureq::Error>,
    ) -> Result<T, ureq::Error> {
        let mut delay_ms = RETRY_DELAY_MS;
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(RETRY_MAX_DELAY_MS);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "S3 {op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        MAX_RETRIES,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

impl ObjectStore for S3Store {
    fn exists(&self, key: &str) -> StorageResult<bool> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(StorageError::ObjectStore(format!("HEAD {key}: {e}"))),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("PUT {key}"), || {
            self.agent.put(url.as_str()).send_bytes(data)
        })
        .map_err(|e| StorageError::ObjectStore(format!("PUT {key}: {e}")))?;
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("GET {key}"), || {
            self.agent.get(url.as_str()).call()
        }) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(|e| StorageError::ObjectStore(format!("GET {key}: read: {e}")))?;
                Ok(buf)
            }
            Err(ureq::Error::Status(404, _)) => Err(StorageError::NotFound(format!("object {key}"))),
            Err(e) => Err(StorageError::ObjectStore(format!("GET {key}: {e}"))),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        })
        .map_err(|e| StorageError::ObjectStore(format!("DELETE {key}: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .objects
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false))
    }

    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        if let Ok(mut m) = self.objects.lock() {
            m.insert(key.to_string(), data.to_vec());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|m| m.get(key).cloned())
            .ok_or_else(|| StorageError::NotFound(format!("object {key}")))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        if let Ok(mut m) = self.objects.lock() {
            m.remove(key);
        }
        Ok(())
    }
}
