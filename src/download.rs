//! Bottle downloader — parallel segmented HTTP downloads with verification.
//!
//! The downloader completes with the file at its destination and a matching
//! SHA-256, or fails without leaving partial output behind:
//!
//! - A HEAD probe decides the strategy: servers advertising
//!   `Accept-Ranges: bytes` get a **segmented download** (fixed-size ranged
//!   chunks fetched by a bounded worker pool, reassembled in index order);
//!   everything else gets a **single-stream download** into a temporary file
//!   moved atomically into place.
//! - OCI-style registries (`ghcr.io`-class hosts) answer the first HEAD with
//!   a bearer challenge; the token flow below turns that into an
//!   `Authorization` header before retrying.
//! - Checksums are streamed with a 1 MiB buffer; a mismatch deletes the
//!   destination before raising.
//!
//! Chunk completion order is unspecified, but reassembly is by chunk index,
//! so output bytes are identical regardless of schedule.

use crate::error::{Result, VeloError};
use crate::progress::DownloadProgressHandle;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Hosts that speak the OCI distribution protocol and require bearer tokens.
const OCI_REGISTRY_HOSTS: &[&str] = &["ghcr.io"];

/// Fixed per-instance downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Segment size for ranged downloads.
    pub chunk_size: u64,
    /// Concurrent range workers within one download.
    pub max_concurrent_streams: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Ceiling for one whole resource.
    pub resource_timeout: Duration,
    /// Hosts treated as OCI registries (bearer-token flow).
    pub oci_registry_hosts: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            chunk_size: 1024 * 1024,
            max_concurrent_streams: 8,
            request_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(300),
            oci_registry_hosts: OCI_REGISTRY_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Concurrency-bounded bottle downloader.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Self::with_config(DownloadConfig::default())
    }

    pub fn with_config(config: DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(format!("velo/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Downloader { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download `url` into `destination`, verifying `expected_sha256` when
    /// given. On any failure no file is left at `destination`.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_sha256: Option<&str>,
        progress: Option<&DownloadProgressHandle>,
    ) -> Result<()> {
        if let Some(progress) = progress {
            progress.started(url);
        }

        let result = tokio::time::timeout(
            self.config.resource_timeout,
            self.download_inner(url, destination, progress),
        )
        .await
        .unwrap_or_else(|_| {
            Err(VeloError::DownloadFailed {
                url: url.to_string(),
                reason: format!(
                    "timed out after {}s",
                    self.config.resource_timeout.as_secs()
                ),
            })
        });

        if let Err(e) = result {
            if let Some(progress) = progress {
                progress.failed(&e.to_string());
            }
            return Err(e);
        }

        if let Some(expected) = expected_sha256 {
            if let Err(e) = verify_checksum(destination, expected).await {
                if let Some(progress) = progress {
                    progress.failed(&e.to_string());
                }
                return Err(e);
            }
        }

        if let Some(progress) = progress {
            progress.completed();
        }
        Ok(())
    }

    async fn download_inner(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<&DownloadProgressHandle>,
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.is_oci_registry(url) {
            if let Some(token) = self.fetch_bearer_token(url).await? {
                return self
                    .single_stream(url, destination, Some(&token), progress)
                    .await;
            }
            // No challenge: fall through to the normal path.
        }

        match self.probe_ranges(url).await {
            Some(file_size) => {
                self.segmented(url, destination, file_size, progress).await
            }
            None => self.single_stream(url, destination, None, progress).await,
        }
    }

    /// HEAD probe: `Some(size)` when the server advertises byte ranges and a
    /// content length, `None` for everything else (including HEAD failures).
    async fn probe_ranges(&self, url: &str) -> Option<u64> {
        let response = self.client.head(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)?
            .to_str()
            .ok()?;
        if !ranges.eq_ignore_ascii_case("bytes") {
            return None;
        }
        response.content_length().filter(|size| *size > 0)
    }

    /// Ranged chunks fetched in batches of `max_concurrent_streams`, written
    /// to per-chunk scratch files, then concatenated in index order.
    async fn segmented(
        &self,
        url: &str,
        destination: &Path,
        file_size: u64,
        progress: Option<&DownloadProgressHandle>,
    ) -> Result<()> {
        let scratch = tempfile::TempDir::new_in(
            destination.parent().unwrap_or_else(|| Path::new(".")),
        )?;

        let mut chunks: Vec<(usize, u64, u64)> = Vec::new();
        let mut offset = 0u64;
        let mut index = 0usize;
        while offset < file_size {
            let end = (offset + self.config.chunk_size - 1).min(file_size - 1);
            chunks.push((index, offset, end));
            index += 1;
            offset = end + 1;
        }

        let downloaded = Arc::new(AtomicU64::new(0));
        let mut first_error: Option<VeloError> = None;

        for batch in chunks.chunks(self.config.max_concurrent_streams) {
            let tasks = batch.iter().map(|&(index, lo, hi)| {
                let client = self.client.clone();
                let url = url.to_string();
                let chunk_path = scratch.path().join(format!("chunk-{index:06}"));
                let downloaded = Arc::clone(&downloaded);
                async move {
                    let result =
                        fetch_chunk(&client, &url, lo, hi, &chunk_path).await;
                    if let Ok(len) = &result {
                        downloaded.fetch_add(*len, Ordering::Relaxed);
                    }
                    result
                }
            });

            // Survivors in the batch are allowed to finish; only the first
            // error is retained.
            for result in join_all(tasks).await {
                match result {
                    Ok(_) => {
                        if let Some(progress) = progress {
                            progress
                                .update(downloaded.load(Ordering::Relaxed), Some(file_size));
                        }
                    }
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(_) => {}
                }
            }
            if let Some(e) = first_error.take() {
                return Err(e);
            }
        }

        // Reassemble in chunk index order; the scratch dir cleans itself up
        // on every exit path.
        let assembled = scratch.path().join("assembled");
        let mut output = tokio::fs::File::create(&assembled).await?;
        for (index, _, _) in &chunks {
            let bytes =
                tokio::fs::read(scratch.path().join(format!("chunk-{index:06}"))).await?;
            output.write_all(&bytes).await?;
        }
        output.flush().await?;
        drop(output);

        tokio::fs::rename(&assembled, destination).await?;
        Ok(())
    }

    /// Plain GET streamed into a scratch file, then moved atomically.
    async fn single_stream(
        &self,
        url: &str,
        destination: &Path,
        bearer_token: Option<&str>,
        progress: Option<&DownloadProgressHandle>,
    ) -> Result<()> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let mut response = request.send().await?;
        if !response.status().is_success() {
            return Err(VeloError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let total = response.content_length();
        let scratch = scratch_path(destination);
        let mut file = tokio::fs::File::create(&scratch).await?;
        let mut received = 0u64;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    file.write_all(&bytes).await?;
                    received += bytes.len() as u64;
                    if let Some(progress) = progress {
                        progress.update(received, total);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&scratch).await;
                    return Err(VeloError::DownloadFailed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&scratch, destination).await?;
        Ok(())
    }

    /// OCI bearer flow. `Ok(None)` means the registry did not challenge and
    /// the caller should proceed unauthenticated.
    async fn fetch_bearer_token(&self, url: &str) -> Result<Option<String>> {
        let head = self.client.head(url).send().await?;
        if head.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let challenge = head
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(parse_bearer_challenge)
            .unwrap_or_default();

        let Some(realm) = challenge.realm else {
            return Err(VeloError::BottleNotAccessible {
                url: url.to_string(),
                reason: "401 without a bearer challenge".to_string(),
            });
        };

        let mut token_request = self.client.get(&realm);
        if let Some(service) = &challenge.service {
            token_request = token_request.query(&[("service", service)]);
        }
        if let Some(scope) = &challenge.scope {
            token_request = token_request.query(&[("scope", scope)]);
        }

        let body: serde_json::Value = token_request.send().await?.json().await?;

        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(VeloError::BottleNotAccessible {
                    url: url.to_string(),
                    reason: serde_json::to_string(errors).unwrap_or_default(),
                });
            }
        }

        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str())
            .map(String::from);

        if token.is_none() {
            // No errors but also no token: retry unauthenticated.
            tracing::warn!("token endpoint for {url} returned neither token nor errors");
        }
        Ok(token)
    }
}

async fn fetch_chunk(
    client: &reqwest::Client,
    url: &str,
    lo: u64,
    hi: u64,
    chunk_path: &Path,
) -> Result<u64> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={lo}-{hi}"))
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(VeloError::DownloadFailed {
            url: url.to_string(),
            reason: format!("range {lo}-{hi} answered HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await?;
    tokio::fs::write(chunk_path, &bytes).await?;
    Ok(bytes.len() as u64)
}

fn scratch_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(&format!(".{}.part", std::process::id()));
    destination.with_file_name(name)
}

impl Downloader {
    fn is_oci_registry(&self, url: &str) -> bool {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .is_some_and(|host| {
                self.config
                    .oci_registry_hosts
                    .iter()
                    .any(|known| known == &host)
            })
    }
}

#[derive(Debug, Default)]
struct BearerChallenge {
    realm: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
fn parse_bearer_challenge(header: &str) -> BearerChallenge {
    let mut challenge = BearerChallenge::default();
    let Some(params) = header.strip_prefix("Bearer ") else {
        return challenge;
    };
    for part in params.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => challenge.realm = Some(value),
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }
    challenge
}

/// Streaming SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a completed download; a mismatch deletes the file before raising.
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let path = path.to_path_buf();
    let actual = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || hash_file(&path))
            .await
            .map_err(|e| VeloError::Other(anyhow::anyhow!("hashing task failed: {e}")))??
    };

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        let _ = tokio::fs::remove_file(&path).await;
        Err(VeloError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
