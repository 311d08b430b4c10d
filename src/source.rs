#![cfg(feature = "web")]

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::config::{DashboardConfig, FetchConfig, SourceConfig};
use crate::error::{DashboardError, Result};
use crate::table::{RawTable, Schema, Snapshot};

lazy_static! {
    static ref SPREADSHEET_URL_REGEX: Regex =
        Regex::new(r"/spreadsheets/d/([A-Za-z0-9_-]+)").unwrap();
    static ref SPREADSHEET_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]{20,}$").unwrap();
    static ref GID_REGEX: Regex = Regex::new(r"[#?&]gid=(\d+)").unwrap();
}

const GOOGLE_SHEETS_BASE: &str = "https://docs.google.com/spreadsheets/d";

/// Anything that can produce the rows of the dashboard's sheet
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Fetch the current rows
    async fn fetch(&self) -> Result<RawTable>;

    /// Human-readable origin, for logs and the health endpoint
    fn describe(&self) -> String;
}

/// Extract the spreadsheet id from a document URL or accept a bare id
///
/// # Examples
/// ```
/// use sheetboard::source::extract_spreadsheet_id;
///
/// let id = extract_spreadsheet_id(
///     "https://docs.google.com/spreadsheets/d/1AbCdEfGhIjKlMnOpQrStUvWxYz012345/edit#gid=0",
/// )
/// .unwrap();
/// assert_eq!(id, "1AbCdEfGhIjKlMnOpQrStUvWxYz012345");
/// ```
pub fn extract_spreadsheet_id(reference: &str) -> Result<String> {
    let reference = reference.trim();
    if let Some(captures) = SPREADSHEET_URL_REGEX.captures(reference) {
        return Ok(captures[1].to_string());
    }
    if SPREADSHEET_ID_REGEX.is_match(reference) {
        return Ok(reference.to_string());
    }
    Err(DashboardError::InvalidSpreadsheet(reference.to_string()))
}

/// Worksheet id embedded in a document URL (`#gid=123`)
pub fn extract_gid(reference: &str) -> Option<u64> {
    GID_REGEX
        .captures(reference)
        .and_then(|c| c[1].parse().ok())
}

/// CSV export URL for one worksheet
///
/// A worksheet name goes through the visualization endpoint, which selects tabs by
/// name; otherwise the plain export endpoint is used with the worksheet id.
pub fn google_export_url(spreadsheet_id: &str, worksheet: Option<&str>, gid: Option<u64>) -> String {
    match worksheet {
        Some(name) => format!(
            "{}/{}/gviz/tq?tqx=out:csv&sheet={}",
            GOOGLE_SHEETS_BASE,
            spreadsheet_id,
            urlencoding::encode(name)
        ),
        None => format!(
            "{}/{}/export?format=csv&gid={}",
            GOOGLE_SHEETS_BASE,
            spreadsheet_id,
            gid.unwrap_or(0)
        ),
    }
}

/// Fetches CSV over HTTP with bounded retries
pub struct HttpCsvSource {
    client: Client,
    url: String,
    access_token: Option<String>,
    retry_attempts: u8,
    retry_delay: Duration,
}

impl HttpCsvSource {
    /// Build a source for any CSV URL
    ///
    /// # Errors
    /// Returns `Fetch` if the HTTP client cannot be constructed.
    pub fn new(url: &str, fetch: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(fetch.timeout_secs.max(1)))
            .build()
            .map_err(|e| DashboardError::Fetch(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            access_token: fetch.access_token.clone(),
            retry_attempts: fetch.retry_attempts,
            retry_delay: Duration::from_millis(fetch.retry_delay_ms),
        })
    }

    /// Build a source for a Google Sheets worksheet
    ///
    /// # Arguments
    /// * `spreadsheet` - Document URL or bare spreadsheet id
    /// * `worksheet` - Tab name, preferred over `gid` when both are given
    /// * `gid` - Tab id; taken from the URL when absent, defaults to the first tab
    /// * `fetch` - Timeout, retry and credential settings
    pub fn google_sheet(
        spreadsheet: &str,
        worksheet: Option<&str>,
        gid: Option<u64>,
        fetch: &FetchConfig,
    ) -> Result<Self> {
        let id = extract_spreadsheet_id(spreadsheet)?;
        let gid = gid.or_else(|| extract_gid(spreadsheet));
        let url = google_export_url(&id, worksheet, gid);
        Self::new(&url, fetch)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<RawTable> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DashboardError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DashboardError::UpstreamStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| DashboardError::Fetch(e.to_string()))?;

        // Private sheets answer 200 with a sign-in page instead of CSV
        let head = body.trim_start().get(..64).unwrap_or(body.trim_start()).to_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") {
            return Err(DashboardError::UnexpectedContent(
                "received an HTML page instead of CSV; check that the sheet is shared".into(),
            ));
        }

        RawTable::from_csv_str(&body)
    }
}

#[async_trait]
impl SheetSource for HttpCsvSource {
    async fn fetch(&self) -> Result<RawTable> {
        let mut attempt: u8 = 0;
        loop {
            match self.fetch_once().await {
                Ok(table) => {
                    debug!("Fetched {} rows from {}", table.rows.len(), self.url);
                    return Ok(table);
                }
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    let delay = self.retry_delay * u32::from(attempt);
                    warn!(
                        "Fetch attempt {} of {} failed: {}; retrying in {}ms",
                        attempt,
                        u32::from(self.retry_attempts) + 1,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads CSV from a local file
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SheetSource for CsvFileSource {
    async fn fetch(&self) -> Result<RawTable> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        RawTable::from_csv_str(&content)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Select the source implementation for a configuration
pub fn build_source(config: &DashboardConfig) -> Result<Box<dyn SheetSource>> {
    let source: Box<dyn SheetSource> = match &config.source {
        SourceConfig::GoogleSheet {
            spreadsheet,
            worksheet,
            gid,
        } => Box::new(HttpCsvSource::google_sheet(
            spreadsheet,
            worksheet.as_deref(),
            *gid,
            &config.fetch,
        )?),
        SourceConfig::CsvUrl { url } => Box::new(HttpCsvSource::new(url, &config.fetch)?),
        SourceConfig::CsvFile { path } => Box::new(CsvFileSource::new(path.clone())),
    };
    info!("Reading sheet from {}", source.describe());
    Ok(source)
}

struct CacheEntry {
    snapshot: Arc<Snapshot>,
    loaded_at: Instant,
    refresh_error: Option<String>,
}

/// Keeps the latest snapshot and decides when to refetch
///
/// Snapshots younger than the TTL are reused. Refetches are single-flight:
/// concurrent callers wait for the fetch in progress and share its outcome,
/// whether it succeeded or failed. When a refetch fails and an older snapshot
/// exists, the older snapshot keeps being served.
pub struct SnapshotCache {
    source: Box<dyn SheetSource>,
    schema: Schema,
    ttl: Duration,
    entry: RwLock<Option<CacheEntry>>,

    /// Number of completed loads
    generation: AtomicU64,

    /// Held while loading; remembers why the last load failed
    refresh_lock: Mutex<Option<String>>,
}

/// What a load produced
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub snapshot: Arc<Snapshot>,

    /// Set when the fetch failed and an older snapshot is served instead
    pub stale_reason: Option<String>,
}

impl SnapshotCache {
    pub fn new(source: Box<dyn SheetSource>, schema: Schema, ttl: Duration) -> Self {
        Self {
            source,
            schema,
            ttl,
            entry: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(None),
        }
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// Current snapshot, refetched when missing or older than the TTL
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let seen = self.generation.load(Ordering::Acquire);
        if let Some(snapshot) = self.fresh().await {
            debug!("Serving cached snapshot");
            return Ok(snapshot);
        }

        let mut last_error = self.refresh_lock.lock().await;
        if let Some(snapshot) = self.fresh().await {
            return Ok(snapshot);
        }
        // A load finished while we waited: take its outcome instead of fetching again
        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(snapshot) = self.cached().await {
                return Ok(snapshot);
            }
            if let Some(message) = last_error.as_ref() {
                return Err(DashboardError::Fetch(format!(
                    "concurrent refresh failed: {}",
                    message
                )));
            }
        }
        self.load(&mut last_error).await.map(|outcome| outcome.snapshot)
    }

    /// Refetch regardless of age
    ///
    /// # Returns
    /// * `Result<LoadOutcome>` - The new snapshot, or the previous one together
    ///   with the reason the refetch failed
    pub async fn refresh(&self) -> Result<LoadOutcome> {
        let mut last_error = self.refresh_lock.lock().await;
        self.load(&mut last_error).await
    }

    /// Drop the cached snapshot; the next request refetches
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }

    /// Cached snapshot without triggering a fetch
    pub async fn cached(&self) -> Option<Arc<Snapshot>> {
        self.entry
            .read()
            .await
            .as_ref()
            .map(|entry| Arc::clone(&entry.snapshot))
    }

    /// Age of the cached snapshot
    pub async fn age(&self) -> Option<Duration> {
        self.entry
            .read()
            .await
            .as_ref()
            .map(|entry| entry.loaded_at.elapsed())
    }

    /// Why the latest refetch failed, while the cached snapshot is older than it
    pub async fn refresh_error(&self) -> Option<String> {
        self.entry
            .read()
            .await
            .as_ref()
            .and_then(|entry| entry.refresh_error.clone())
    }

    async fn fresh(&self) -> Option<Arc<Snapshot>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|entry| !self.ttl.is_zero() && entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.snapshot))
    }

    /// Fetch and coerce; callers hold the refresh lock
    async fn load(&self, last_error: &mut Option<String>) -> Result<LoadOutcome> {
        let started = Instant::now();
        let fetched = self.source.fetch().await.and_then(|raw| {
            Snapshot::from_raw(self.schema.clone(), &raw, Utc::now())
        });

        let outcome = match fetched {
            Ok(snapshot) => {
                info!(
                    "Loaded {} rows from {} in {}ms",
                    snapshot.len(),
                    self.source.describe(),
                    started.elapsed().as_millis()
                );
                let snapshot = Arc::new(snapshot);
                *self.entry.write().await = Some(CacheEntry {
                    snapshot: Arc::clone(&snapshot),
                    loaded_at: Instant::now(),
                    refresh_error: None,
                });
                *last_error = None;
                Ok(LoadOutcome {
                    snapshot,
                    stale_reason: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                *last_error = Some(message.clone());
                let mut entry = self.entry.write().await;
                match entry.as_mut() {
                    Some(entry) => {
                        warn!("Refreshing {} failed, serving stale snapshot: {}", self.source.describe(), e);
                        entry.refresh_error = Some(message.clone());
                        Ok(LoadOutcome {
                            snapshot: Arc::clone(&entry.snapshot),
                            stale_reason: Some(message),
                        })
                    }
                    None => Err(e),
                }
            }
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CSV: &str = "date,category,amount\n2024-01-01,A,1\n2024-01-02,B,2\n";

    /// Serves a fixed CSV and counts fetches; fails once `fail_after` fetches happened
    struct CountingSource {
        fetches: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl SheetSource for CountingSource {
        async fn fetch(&self) -> Result<RawTable> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(DashboardError::Fetch("offline".into()));
                }
            }
            RawTable::from_csv_str(CSV)
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn cache(ttl: Duration, fail_after: Option<usize>) -> (SnapshotCache, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            fetches: Arc::clone(&fetches),
            fail_after,
        };
        (
            SnapshotCache::new(Box::new(source), Schema::default(), ttl),
            fetches,
        )
    }

    #[test]
    fn test_extract_spreadsheet_id() {
        let url = "https://docs.google.com/spreadsheets/d/1AbCdEfGhIjKlMnOpQrStUvWxYz012345/edit#gid=42";
        assert_eq!(
            extract_spreadsheet_id(url).unwrap(),
            "1AbCdEfGhIjKlMnOpQrStUvWxYz012345"
        );
        assert_eq!(extract_gid(url), Some(42));
        assert_eq!(
            extract_spreadsheet_id("1AbCdEfGhIjKlMnOpQrStUvWxYz012345").unwrap(),
            "1AbCdEfGhIjKlMnOpQrStUvWxYz012345"
        );
        assert!(matches!(
            extract_spreadsheet_id("https://example.com/sheet"),
            Err(DashboardError::InvalidSpreadsheet(_))
        ));
        assert!(extract_spreadsheet_id("short").is_err());
    }

    #[test]
    fn test_google_export_url() {
        assert_eq!(
            google_export_url("abc", None, Some(7)),
            "https://docs.google.com/spreadsheets/d/abc/export?format=csv&gid=7"
        );
        assert_eq!(
            google_export_url("abc", None, None),
            "https://docs.google.com/spreadsheets/d/abc/export?format=csv&gid=0"
        );
        assert_eq!(
            google_export_url("abc", Some("Vendas 2024"), Some(7)),
            "https://docs.google.com/spreadsheets/d/abc/gviz/tq?tqx=out:csv&sheet=Vendas%202024"
        );
    }

    #[test]
    fn test_google_sheet_source_takes_gid_from_url() {
        let source = HttpCsvSource::google_sheet(
            "https://docs.google.com/spreadsheets/d/1AbCdEfGhIjKlMnOpQrStUvWxYz012345/edit#gid=99",
            None,
            None,
            &FetchConfig::default(),
        )
        .unwrap();
        assert!(source.url().ends_with("export?format=csv&gid=99"));
    }

    #[tokio::test]
    async fn test_cache_reuses_fresh_snapshot() {
        let (cache, fetches) = cache(Duration::from_secs(60), None);
        let first = cache.snapshot().await.unwrap();
        let second = cache.snapshot().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches() {
        let (cache, fetches) = cache(Duration::ZERO, None);
        cache.snapshot().await.unwrap();
        cache.snapshot().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_and_invalidate() {
        let (cache, fetches) = cache(Duration::from_secs(60), None);
        assert!(cache.cached().await.is_none());
        cache.snapshot().await.unwrap();
        cache.refresh().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        cache.invalidate().await;
        assert!(cache.cached().await.is_none());
        assert!(cache.age().await.is_none());
        cache.snapshot().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_snapshot() {
        let (cache, _) = cache(Duration::from_secs(60), Some(1));
        let first = cache.snapshot().await.unwrap();
        assert!(cache.refresh_error().await.is_none());

        let outcome = cache.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&first, &outcome.snapshot));
        assert!(outcome.stale_reason.unwrap().contains("offline"));
        assert!(cache.refresh_error().await.unwrap().contains("offline"));
    }

    /// Succeeds on the first fetch, then fails after a delay
    struct SlowFailingSource {
        fetches: Arc<AtomicUsize>,
        succeed_first: bool,
    }

    #[async_trait]
    impl SheetSource for SlowFailingSource {
        async fn fetch(&self) -> Result<RawTable> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n == 0 && self.succeed_first {
                return RawTable::from_csv_str(CSV);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(DashboardError::Fetch("offline".into()))
        }

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    fn slow_cache(succeed_first: bool) -> (Arc<SnapshotCache>, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = SlowFailingSource {
            fetches: Arc::clone(&fetches),
            succeed_first,
        };
        let cache = SnapshotCache::new(Box::new(source), Schema::default(), Duration::from_millis(1));
        (Arc::new(cache), fetches)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_a_failed_refetch() {
        let (cache, fetches) = slow_cache(true);
        let first = cache.snapshot().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.snapshot().await })
            })
            .collect();
        for handle in handles {
            let snapshot = handle.await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&snapshot, &first));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert!(cache.refresh_error().await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_a_failed_first_fetch() {
        let (cache, fetches) = slow_cache(false);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.snapshot().await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(DashboardError::Fetch(_))));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_without_snapshot_propagates() {
        let (cache, _) = cache(Duration::from_secs(60), Some(0));
        assert!(matches!(
            cache.snapshot().await,
            Err(DashboardError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_csv_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, CSV).unwrap();

        let source = CsvFileSource::new(&path);
        let table = source.fetch().await.unwrap();
        assert_eq!(table.headers, vec!["date", "category", "amount"]);
        assert_eq!(table.rows.len(), 2);
        assert!(source.describe().starts_with("file://"));

        let missing = CsvFileSource::new(dir.path().join("missing.csv"));
        assert!(matches!(missing.fetch().await, Err(DashboardError::Io(_))));
    }
}
