//! Upload storage, run-history log file and HTTP fetch utilities for the pet ETL.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petetl-storage";

const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

/// A CSV received through the upload endpoint, as persisted on disk.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    /// Client file name reduced to a safe final component.
    pub original_name: String,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// Identical bytes were already stored; nothing was written.
    pub deduplicated: bool,
}

/// Final path component of a client-supplied name, with anything outside
/// `[A-Za-z0-9._-]` replaced by `_`. Empty input becomes `upload.csv`.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned.to_string()
    }
}

fn upload_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "csv".to_string())
}

/// Content-addressed store for uploaded CSV files: `<root>/<YYYYmmdd>/<sha256>.<ext>`.
/// Re-uploading the same bytes on the same day reuses the existing file.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn upload_relative_path(
        received_at: DateTime<Utc>,
        content_hash: &str,
        file_name: &str,
    ) -> PathBuf {
        PathBuf::from(received_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.{}", upload_extension(file_name)))
    }

    pub async fn store_upload(
        &self,
        received_at: DateTime<Utc>,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredUpload> {
        let original_name = sanitize_file_name(file_name);
        if bytes.is_empty() {
            bail!("upload {original_name} is empty");
        }

        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::upload_relative_path(received_at, &content_hash, &original_name);
        let absolute_path = self.root.join(&relative_path);
        let deduplicated = !write_once(&absolute_path, bytes).await?;

        info!(
            file = %original_name,
            path = %relative_path.display(),
            bytes = bytes.len(),
            deduplicated,
            "stored csv upload"
        );
        Ok(StoredUpload {
            original_name,
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Write `bytes` to `path` via temp file + rename unless the path already exists.
/// Returns whether this call created the file.
async fn write_once(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating upload directory {}", parent.display()))?;
    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking upload path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".upload-{}.tmp", Uuid::new_v4()));
    let written: std::io::Result<()> = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    match written {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(false)
            } else {
                Err(err).with_context(|| format!("writing upload {}", path.display()))
            }
        }
    }
}

/// Append-only text file holding one summary line per pipeline run.
#[derive(Debug, Clone)]
pub struct RunHistoryLog {
    path: PathBuf,
}

impl RunHistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append_line(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening run-history log {}", self.path.display()))?;

        let mut buf = line.trim_end_matches(['\r', '\n']).to_string();
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("appending to run-history log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing run-history log {}", self.path.display()))?;
        Ok(())
    }

    /// Last `max_lines` non-empty lines, oldest first. A missing file reads as empty.
    /// Reads backward from the end in growing windows, so cost follows the tail, not the file.
    pub async fn tail(&self, max_lines: usize) -> anyhow::Result<Vec<String>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("opening run-history log {}", self.path.display()))
            }
        };
        let len = file
            .metadata()
            .await
            .with_context(|| format!("reading metadata of {}", self.path.display()))?
            .len();

        let mut window = TAIL_WINDOW_BYTES.min(len);
        loop {
            let start = len - window;
            file.seek(SeekFrom::Start(start))
                .await
                .with_context(|| format!("seeking in run-history log {}", self.path.display()))?;
            let mut buf = Vec::with_capacity(window as usize);
            (&mut file)
                .take(window)
                .read_to_end(&mut buf)
                .await
                .with_context(|| format!("reading run-history log {}", self.path.display()))?;

            let text = String::from_utf8_lossy(&buf);
            let mut lines = text.lines();
            if start > 0 {
                // first line of a mid-file window may be cut
                lines.next();
            }
            let lines = lines
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>();

            if lines.len() >= max_lines || start == 0 {
                let skip = lines.len().saturating_sub(max_lines);
                return Ok(lines[skip..].iter().map(|l| l.to_string()).collect());
            }
            window = window.saturating_mul(2).min(len);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_backoff(url).instrument(span).await
    }

    async fn fetch_with_backoff(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(attempt, error = %err, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
