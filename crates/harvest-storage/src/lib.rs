//! Event storage and HTTP fetch utilities for the harvester.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::NormalizedEvent;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyExists,
}

/// Filter for [`EventStore::query`]. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub category: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl EventQuery {
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if let Some(category) = &self.category {
            if !event.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if self.from.is_some_and(|from| event.start_date < from) {
            return false;
        }
        if self.to.is_some_and(|to| event.start_date > to) {
            return false;
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt event record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing event {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Durable key-value store of normalized events keyed by dedup key.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Writes only when `key` is absent.
    async fn conditional_put(
        &self,
        key: &str,
        event: &NormalizedEvent,
    ) -> Result<PutOutcome, StoreError>;

    /// Insert or overwrite.
    async fn put(&self, key: &str, event: &NormalizedEvent) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<NormalizedEvent>, StoreError>;

    /// Deletes `key`; `false` when nothing was stored under it.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn query(&self, query: &EventQuery) -> Result<Vec<NormalizedEvent>, StoreError>;
}

fn sort_events(events: &mut [NormalizedEvent]) {
    events.sort_by(|a, b| {
        a.start_date
            .cmp(&b.start_date)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.dedup_key.cmp(&b.dedup_key))
    });
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<BTreeMap<String, NormalizedEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn conditional_put(
        &self,
        key: &str,
        event: &NormalizedEvent,
    ) -> Result<PutOutcome, StoreError> {
        let mut events = self.events.write().await;
        if events.contains_key(key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        events.insert(key.to_string(), event.clone());
        Ok(PutOutcome::Stored)
    }

    async fn put(&self, key: &str, event: &NormalizedEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .await
            .insert(key.to_string(), event.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<NormalizedEvent>, StoreError> {
        Ok(self.events.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.events.write().await.remove(key).is_some())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<NormalizedEvent>, StoreError> {
        let mut matched: Vec<_> = self
            .events
            .read()
            .await
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_events(&mut matched);
        Ok(matched)
    }
}

/// One JSON file per event under a hash-addressed path.
///
/// Conditional puts hard-link a fully written temp file into place, so a
/// concurrent writer either wins the link or observes `AlreadyExists`.
#[derive(Debug, Clone)]
pub struct FileEventStore {
    root: PathBuf,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn event_relative_path(key: &str) -> PathBuf {
        let hash = sha256_hex(key.as_bytes());
        PathBuf::from(&hash[..2]).join(format!("{hash}.json"))
    }

    fn shard_dir(&self, key: &str) -> (PathBuf, PathBuf) {
        let relative = Self::event_relative_path(key);
        let path = self.root.join(&relative);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        (dir, path)
    }

    fn encode(key: &str, event: &NormalizedEvent) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(event).map_err(|source| StoreError::Serialize {
            key: key.to_string(),
            source,
        })
    }

    async fn write_temp(&self, dir: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(dir).await.map_err(io_at(dir))?;
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_at(&temp_path))?;
        file.write_all(bytes).await.map_err(io_at(&temp_path))?;
        file.flush().await.map_err(io_at(&temp_path))?;
        Ok(temp_path)
    }

    async fn read_event(path: &Path) -> Result<Option<NormalizedEvent>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_at(path)(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn conditional_put(
        &self,
        key: &str,
        event: &NormalizedEvent,
    ) -> Result<PutOutcome, StoreError> {
        let bytes = Self::encode(key, event)?;
        let (dir, path) = self.shard_dir(key);
        let temp_path = self.write_temp(&dir, &bytes).await?;

        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(dedup_key = key, "conditional put found existing record");
                Ok(PutOutcome::AlreadyExists)
            }
            Err(err) => Err(io_at(&path)(err)),
        }
    }

    async fn put(&self, key: &str, event: &NormalizedEvent) -> Result<(), StoreError> {
        let bytes = Self::encode(key, event)?;
        let (dir, path) = self.shard_dir(key);
        let temp_path = self.write_temp(&dir, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_at(&path)(err));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<NormalizedEvent>, StoreError> {
        let (_, path) = self.shard_dir(key);
        Self::read_event(&path).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let (_, path) = self.shard_dir(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_at(&path)(err)),
        }
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<NormalizedEvent>, StoreError> {
        let mut matched = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(matched),
            Err(err) => return Err(io_at(&self.root)(err)),
        };

        while let Some(shard) = shards.next_entry().await.map_err(io_at(&self.root))? {
            let shard_path = shard.path();
            let file_type = shard.file_type().await.map_err(io_at(&shard_path))?;
            if !file_type.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(&shard_path)
                .await
                .map_err(io_at(&shard_path))?;
            while let Some(file) = files.next_entry().await.map_err(io_at(&shard_path))? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(event) = Self::read_event(&path).await? {
                    if query.matches(&event) {
                        matched.push(event);
                    }
                }
            }
        }

        sort_events(&mut matched);
        Ok(matched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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
        Self::fixed(2, Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

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
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 3,
            per_source_concurrency: 1,
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

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

/// Shared HTTP client with global and per-source concurrency limits and a
/// bounded retry loop.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, method = "GET", url);
        self.send_with_retry(source, || self.client.get(url))
            .instrument(span)
            .await
    }

    /// POSTs a JSON body. `timeout` overrides the client default for this call.
    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, method = "POST", url);
        self.send_with_retry(source, || {
            let mut request = self.client.request(Method::POST, url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            request
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, source: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0;
        loop {
            let (disposition, error) = match build().send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(bytes = body.len(), %status, "fetched");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let error = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (classify_status(status), error)
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }
}
