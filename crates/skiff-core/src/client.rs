//! HTTP client for the skiff server.
//!
//! Implements the [`BlockUploader`] and [`BlockFetcher`] capabilities over
//! the REST API, with exponential-backoff retry on transient failures.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use crate::backup::BlockUploader;
use crate::error::{Result, SkiffError};
use crate::manifest::{Manifest, ManifestInfo};
use crate::restore::BlockFetcher;

/// Retry tuning for transient HTTP failures (transport errors, 429, 5xx).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(|t| t.to_string()),
            agent,
            retry: RetryConfig::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.token {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    /// Retry a closure on transient errors with exponential backoff + jitter.
    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        let mut delay_ms = self.retry.retry_delay_ms;
        let mut last_err = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(self.retry.retry_max_delay_ms);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < self.retry.max_retries => {
                    tracing::warn!(
                        "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        self.retry.max_retries,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn map_err(op_name: &str, err: ureq::Error) -> SkiffError {
        match err {
            ureq::Error::Status(401, _) => SkiffError::Unauthorized,
            ureq::Error::Status(429, _) => SkiffError::RateLimited,
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                SkiffError::Other(format!("{op_name}: HTTP {code}: {body}"))
            }
            ureq::Error::Transport(t) => SkiffError::Transient(format!("{op_name}: {t}")),
        }
    }

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    pub fn get_manifest(&self, id: &str) -> Result<Manifest> {
        let url = self.url(&format!("/api/manifests/{id}"));
        match self.retry_call("get manifest", || self.agent.get(&url).call()) {
            Ok(resp) => resp
                .into_json::<Manifest>()
                .map_err(|e| SkiffError::Other(format!("get manifest: parse: {e}"))),
            Err(ureq::Error::Status(404, _)) => {
                Err(SkiffError::NotFound(format!("manifest {id}")))
            }
            Err(e) => Err(Self::map_err("get manifest", e)),
        }
    }

    /// Latest manifest matching all filter tags, or `None` when the server
    /// has no match.
    pub fn get_latest_manifest(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<Manifest>> {
        let url = self.url("/api/manifests/latest");
        match self.retry_call("get latest manifest", || {
            let mut req = self.agent.get(&url);
            for (k, v) in tags {
                req = req.query(&format!("tag.{k}"), v);
            }
            req.call()
        }) {
            Ok(resp) => resp
                .into_json::<Manifest>()
                .map(Some)
                .map_err(|e| SkiffError::Other(format!("get latest manifest: parse: {e}"))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(Self::map_err("get latest manifest", e)),
        }
    }

    pub fn list_manifests(&self, tags: &BTreeMap<String, String>) -> Result<Vec<ManifestInfo>> {
        let url = self.url("/api/manifests");
        let resp = self
            .retry_call("list manifests", || {
                let mut req = self.agent.get(&url);
                for (k, v) in tags {
                    req = req.query(&format!("tag.{k}"), v);
                }
                req.call()
            })
            .map_err(|e| Self::map_err("list manifests", e))?;
        resp.into_json::<Vec<ManifestInfo>>()
            .map_err(|e| SkiffError::Other(format!("list manifests: parse: {e}")))
    }

    pub fn upload_manifest(&self, manifest: &Manifest) -> Result<()> {
        let url = self.url("/api/manifests");
        let payload = serde_json::to_value(manifest)?;
        self.retry_call("upload manifest", || {
            let req = self.apply_auth(self.agent.post(&url));
            req.send_json(payload.clone())
        })
        .map_err(|e| Self::map_err("upload manifest", e))?;
        Ok(())
    }

    pub fn delete_manifest(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/api/manifests/{id}"));
        match self.retry_call("delete manifest", || {
            self.apply_auth(self.agent.delete(&url)).call()
        }) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => {
                Err(SkiffError::NotFound(format!("manifest {id}")))
            }
            Err(e) => Err(Self::map_err("delete manifest", e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Block capabilities
// ---------------------------------------------------------------------------

impl BlockUploader for ApiClient {
    /// Dedup probe. 200 means present, 404 absent; anything else is an error
    /// so a failing probe can never silently skip an upload.
    fn block_exists(&self, cid: &str) -> Result<bool> {
        let url = self.url(&format!("/api/blocks/{cid}/exists"));
        match self.retry_call("block exists", || {
            self.apply_auth(self.agent.post(&url)).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(Self::map_err("block exists", e)),
        }
    }

    fn upload_block(&self, cid: &str, data: &[u8], original_size: u64) -> Result<()> {
        let url = self.url("/api/blocks");
        self.retry_call("upload block", || {
            let req = self
                .apply_auth(self.agent.post(&url))
                .set("Content-Type", "application/octet-stream")
                .set("X-Block-CID", cid)
                .set("X-Original-Size", &original_size.to_string());
            req.send_bytes(data)
        })
        .map_err(|e| Self::map_err("upload block", e))?;
        Ok(())
    }
}

impl BlockFetcher for ApiClient {
    fn fetch_block(&self, cid: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("/api/blocks/{cid}"));
        match self.retry_call("fetch block", || self.agent.get(&url).call()) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(SkiffError::Io)?;
                Ok(buf)
            }
            Err(ureq::Error::Status(404, _)) => Err(SkiffError::NotFound(format!("block {cid}"))),
            Err(e) => Err(Self::map_err("fetch block", e)),
        }
    }
}

/// Whether an HTTP error is transient and worth retrying.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = ApiClient::new("http://localhost:8080/", None);
        assert_eq!(c.url("/api/health"), "http://localhost:8080/api/health");
    }

    #[test]
    fn status_code_retryability() {
        // Transport-free construction of status errors for classification.
        let transient = ureq::Error::Status(503, ureq::Response::new(503, "Service Unavailable", "").unwrap());
        assert!(is_retryable(&transient));
        let rate_limited = ureq::Error::Status(429, ureq::Response::new(429, "Too Many Requests", "").unwrap());
        assert!(is_retryable(&rate_limited));
        let not_found = ureq::Error::Status(404, ureq::Response::new(404, "Not Found", "").unwrap());
        assert!(!is_retryable(&not_found));
        let unauthorized = ureq::Error::Status(401, ureq::Response::new(401, "Unauthorized", "").unwrap());
        assert!(!is_retryable(&unauthorized));
    }
}
