//! Incremental harvest orchestration: paginated crawl, fingerprint gating,
//! batch merge, and the post-run insight enrichment pass.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcd_core::{ContractorRecord, ListingSummary};
use rcd_extract::{
    contractor_id_from_url, extract_detail_fields, parse_listing_cards, DriverError, ExtractError,
    PageDriver, NEXT_PAGE_SELECTOR,
};
use rcd_storage::{FingerprintCache, RecordStore, RetryPolicy, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rcd-harvest";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub listing_url: String,
    pub data_dir: PathBuf,
    pub nav_retry: RetryPolicy,
    pub job_timeout: Duration,
    pub queue_max_depth: usize,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub insight_api_base: String,
    pub insight_api_key: Option<String>,
    pub insight_model: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let nav_retry = RetryPolicy {
            max_retries: env_parse("RCD_NAV_MAX_RETRIES", 3),
            base_delay: Duration::from_millis(env_parse("RCD_NAV_BASE_DELAY_MS", 500)),
            max_delay: Duration::from_millis(env_parse("RCD_NAV_MAX_DELAY_MS", 5_000)),
        };
        Self {
            listing_url: std::env::var("RCD_LISTING_URL").unwrap_or_else(|_| {
                "https://www.gaf.com/en-us/roofing-contractors/residential".to_string()
            }),
            data_dir: std::env::var("RCD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            nav_retry,
            job_timeout: Duration::from_secs(env_parse("RCD_JOB_TIMEOUT_SECS", 1_800)),
            queue_max_depth: env_parse("RCD_QUEUE_MAX_DEPTH", 32),
            user_agent: std::env::var("RCD_USER_AGENT").unwrap_or_else(|_| "rcd-bot/0.1".to_string()),
            http_timeout: Duration::from_secs(env_parse("RCD_HTTP_TIMEOUT_SECS", 20)),
            insight_api_base: std::env::var("RCD_INSIGHT_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            insight_api_key: std::env::var("RCD_INSIGHT_API_KEY").ok(),
            insight_model: std::env::var("RCD_INSIGHT_MODEL")
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("contractors.json")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("listing page {page} failed to render cards after retries")]
    Pagination { page: usize },
    #[error("run stopped at the {budget_secs}s job budget")]
    Deadline { budget_secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_visited: usize,
    pub items_seen: usize,
    pub items_fetched: usize,
    pub items_skipped: usize,
    pub items_failed: usize,
    pub records_total: usize,
}

#[derive(Debug, Default)]
struct CrawlStats {
    pages_visited: usize,
    items_seen: usize,
    items_fetched: usize,
    items_skipped: usize,
    items_failed: usize,
}

/// Paginated crawl-and-merge pipeline over two driver pages: one holding the
/// listing, one navigating contractor profiles.
pub struct HarvestOrchestrator {
    config: HarvestConfig,
    listing: Box<dyn PageDriver>,
    detail: Box<dyn PageDriver>,
}

impl HarvestOrchestrator {
    pub fn new(config: HarvestConfig, listing: Box<dyn PageDriver>, detail: Box<dyn PageDriver>) -> Self {
        Self {
            config,
            listing,
            detail,
        }
    }

    /// Run one complete harvest. Whatever batch has accumulated is merged
    /// into the record store even when the crawl fails partway; partial
    /// progress is never discarded. The crawl watches its own deadline
    /// (`job_timeout`) between items and stops early so that merge still
    /// happens rather than being cut off from outside.
    pub async fn run(&self) -> Result<HarvestRunSummary, HarvestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.job_timeout;
        info!(%run_id, listing_url = %self.config.listing_url, "harvest run started");

        let mut cache = FingerprintCache::load_or_default(self.config.cache_path());
        let mut stats = CrawlStats::default();
        let mut batch = Vec::new();

        let crawl_result = self.crawl(&cache, &mut batch, &mut stats, deadline).await;

        let store = RecordStore::new(self.config.records_path());
        if !batch.is_empty() {
            // Fingerprints reach the cache only once their records are on
            // disk; a run that dies before the merge never marks an
            // unsaved item as current.
            let fingerprints: Vec<(String, String)> = batch
                .iter()
                .filter_map(|r| {
                    r.last_modified
                        .clone()
                        .map(|fp| (r.contractor_id.clone(), fp))
                })
                .collect();
            let total = store.merge(batch)?;
            info!(total, "merged harvest batch");
            for (id, fp) in &fingerprints {
                cache.update(id, fp)?;
            }
        }
        crawl_result?;

        Ok(HarvestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_visited: stats.pages_visited,
            items_seen: stats.items_seen,
            items_fetched: stats.items_fetched,
            items_skipped: stats.items_skipped,
            items_failed: stats.items_failed,
            records_total: store.read_all()?.len(),
        })
    }

    async fn crawl(
        &self,
        cache: &FingerprintCache,
        batch: &mut Vec<ContractorRecord>,
        stats: &mut CrawlStats,
        deadline: Instant,
    ) -> Result<(), HarvestError> {
        self.listing.goto(&self.config.listing_url).await?;
        let mut page_no = 1usize;
        let mut summaries = self.list_current_page().await?;

        loop {
            if summaries.is_empty() {
                info!(page_no, "no cards on this page, crawl done");
                break;
            }
            stats.pages_visited += 1;
            info!(page_no, cards = summaries.len(), "processing listing page");

            for summary in summaries {
                if Instant::now() >= deadline {
                    warn!(page_no, "job budget exhausted, stopping early");
                    return Err(HarvestError::Deadline {
                        budget_secs: self.config.job_timeout.as_secs(),
                    });
                }
                stats.items_seen += 1;
                match self.process_item(cache, &summary).await {
                    Ok(Some(record)) => {
                        batch.push(record);
                        stats.items_fetched += 1;
                    }
                    Ok(None) => stats.items_skipped += 1,
                    Err(err) => {
                        warn!(profile_url = %summary.profile_url, error = %err, "item failed, excluded from batch");
                        stats.items_failed += 1;
                    }
                }
            }

            match self.advance_to_page(page_no + 1).await? {
                Some(cards) => {
                    page_no += 1;
                    summaries = cards;
                }
                None => {
                    info!(page_no, "no next page control, crawl done");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn list_current_page(&self) -> Result<Vec<ListingSummary>, HarvestError> {
        let html = self.listing.content().await?;
        Ok(parse_listing_cards(&html)?)
    }

    /// Move to the next listing page, or `None` when no enabled next-page
    /// control remains. Every transition failure is treated as transient:
    /// a failed control probe, a failed click, and a page that renders
    /// zero cards all go through the same bounded reload-and-retry loop
    /// before giving up with a terminal pagination error. Once a click has
    /// landed, retries only reload and re-extract so the crawl never skips
    /// a page by clicking twice.
    async fn advance_to_page(&self, page: usize) -> Result<Option<Vec<ListingSummary>>, HarvestError> {
        let mut attempt = 0usize;
        let mut clicked = false;
        loop {
            if !clicked {
                match self.listing.exists(NEXT_PAGE_SELECTOR).await {
                    Ok(false) => return Ok(None),
                    Ok(true) => match self.listing.click(NEXT_PAGE_SELECTOR).await {
                        Ok(()) => clicked = true,
                        Err(err) => warn!(page, attempt, error = %err, "next page click failed"),
                    },
                    Err(err) => warn!(page, attempt, error = %err, "next page probe failed"),
                }
            }

            if clicked {
                match self.list_current_page().await {
                    Ok(cards) if !cards.is_empty() => return Ok(Some(cards)),
                    Ok(_) => warn!(page, attempt, "new listing page rendered zero cards"),
                    Err(err) => warn!(page, attempt, error = %err, "listing extraction failed"),
                }
            }

            if attempt >= self.config.nav_retry.max_retries {
                return Err(HarvestError::Pagination { page });
            }
            tokio::time::sleep(self.config.nav_retry.delay_for_attempt(attempt)).await;
            attempt += 1;
            if let Err(err) = self.listing.reload().await {
                warn!(page, error = %err, "reload failed");
            }
        }
    }

    /// Visit one contractor profile. Returns `None` when the cached
    /// fingerprint says the item is unchanged; its stored record is left
    /// untouched. The fingerprint rides on the record and is written to
    /// the cache only after the batch merge, so a failed or interrupted
    /// item is retried on the next run.
    async fn process_item(
        &self,
        cache: &FingerprintCache,
        summary: &ListingSummary,
    ) -> Result<Option<ContractorRecord>, HarvestError> {
        let contractor_id = contractor_id_from_url(&summary.profile_url);
        let profile_url = resolve_url(&self.config.listing_url, &summary.profile_url);

        self.detail.goto(&profile_url).await?;
        let fingerprint = match self.detail.last_modified().await {
            Ok(fp) => fp,
            Err(err) => {
                warn!(%contractor_id, error = %err, "fingerprint probe failed");
                None
            }
        };

        if !cache.needs_update(&contractor_id, fingerprint.as_deref()) {
            info!(%contractor_id, "up to date, skipping");
            return Ok(None);
        }

        let html = self.detail.content().await?;
        let detail = extract_detail_fields(&html);
        let record = ContractorRecord::from_summary(
            contractor_id,
            summary.clone(),
            detail,
            fingerprint,
            Utc::now(),
        );
        Ok(Some(record))
    }
}

/// Resolve a possibly-relative href against the listing URL.
fn resolve_url(base: &str, href: &str) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Fetches pages over plain HTTP and serves the response body as the
/// rendered DOM. No scripting: "clicking" a control follows its `href`.
/// Enough for static listing mirrors and for running without a browser.
pub struct StaticPageDriver {
    client: reqwest::Client,
    state: Mutex<StaticPageState>,
}

#[derive(Debug, Default)]
struct StaticPageState {
    url: Option<String>,
    body: String,
    header_last_modified: Option<String>,
}

impl StaticPageDriver {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            state: Mutex::new(StaticPageState::default()),
        })
    }

    async fn fetch(&self, url: &str) -> Result<(), DriverError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DriverError::Navigation(format!(
                "http status {} for {url}",
                response.status()
            )));
        }
        let header_last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;

        let mut state = self.state.lock().expect("driver state poisoned");
        state.url = Some(url.to_string());
        state.body = body;
        state.header_last_modified = header_last_modified;
        Ok(())
    }

    fn snapshot(&self) -> StaticPageState {
        let state = self.state.lock().expect("driver state poisoned");
        StaticPageState {
            url: state.url.clone(),
            body: state.body.clone(),
            header_last_modified: state.header_last_modified.clone(),
        }
    }
}

#[async_trait]
impl PageDriver for StaticPageDriver {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.fetch(url).await
    }

    async fn reload(&self) -> Result<(), DriverError> {
        let url = self
            .snapshot()
            .url
            .ok_or_else(|| DriverError::Navigation("no page loaded".into()))?;
        self.fetch(&url).await
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok(self.snapshot().body)
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let state = self.snapshot();
        let href = rcd_extract::select_first_attr_in(&state.body, selector, "href")
            .map_err(|e| DriverError::Other(e.to_string()))?
            .ok_or_else(|| DriverError::ElementNotFound(selector.to_string()))?;
        let current = state
            .url
            .ok_or_else(|| DriverError::Navigation("no page loaded".into()))?;
        self.fetch(&resolve_url(&current, &href)).await
    }

    async fn exists(&self, selector: &str) -> Result<bool, DriverError> {
        let body = self.snapshot().body;
        rcd_extract::element_exists_in(&body, selector)
            .map_err(|e| DriverError::Other(e.to_string()))
    }

    async fn last_modified(&self) -> Result<Option<String>, DriverError> {
        let state = self.snapshot();
        let meta = rcd_extract::select_first_attr_in(
            &state.body,
            "meta[property=\"article:modified_time\"]",
            "content",
        )
        .map_err(|e| DriverError::Other(e.to_string()))?;
        Ok(meta.or(state.header_last_modified))
    }
}

/// Opaque summarization collaborator, invoked once per record.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn summarize(&self, record: &ContractorRecord) -> Result<String>;
}

/// The prompt mirrors the record fields plus every customer review.
pub fn insight_prompt(record: &ContractorRecord) -> String {
    let or_unspecified = |v: &Option<String>| v.clone().unwrap_or_else(|| "Not specified".into());
    format!(
        "Please provide a 2-3 sentence summary about this roofing contractor based on their \
         information and customer reviews:\n\n\
         Company Name: {}\n\
         Location: {}\n\
         Founded: {}\n\
         Number of Employees: {}\n\
         Rating: {}\n\
         State License: {}\n\n\
         Customer Reviews:\n{}\n\n\
         Please focus on summarizing the company's experience, reliability, and what customers \
         appreciate about their service.",
        or_unspecified(&record.name),
        or_unspecified(&record.location),
        or_unspecified(&record.detail.founding_year),
        or_unspecified(&record.detail.number_of_employees),
        or_unspecified(&record.rating),
        or_unspecified(&record.detail.state_license),
        record.detail.reviews.join("\n"),
    )
}

/// Chat-completions client for an OpenAI-compatible endpoint.
pub struct OpenAiInsightGenerator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiInsightGenerator {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        let api_key = config
            .insight_api_key
            .clone()
            .context("RCD_INSIGHT_API_KEY is not set")?;
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building insight http client")?;
        Ok(Self {
            client,
            api_base: config.insight_api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.insight_model.clone(),
        })
    }
}

#[async_trait]
impl InsightGenerator for OpenAiInsightGenerator {
    async fn summarize(&self, record: &ContractorRecord) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a helpful assistant that summarizes business information and customer feedback."
                },
                { "role": "user", "content": insight_prompt(record) }
            ],
            "max_tokens": 150,
            "temperature": 0
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("insight request failed")?
            .error_for_status()
            .context("insight endpoint returned an error status")?;

        let value: serde_json::Value = response.json().await.context("decoding insight response")?;
        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .context("insight response missing content")?
            .trim()
            .to_string();
        Ok(text)
    }
}

/// Enrich every stored record with a generated insight. A failed generation
/// leaves that record without one; the pass itself only fails on storage
/// errors.
pub async fn generate_insights(
    store: &RecordStore,
    generator: &dyn InsightGenerator,
) -> Result<usize> {
    let mut records = store.read_all().context("loading records for insights")?;
    for record in &mut records {
        match generator.summarize(record).await {
            Ok(text) => {
                info!(contractor_id = %record.contractor_id, "generated insight");
                record.ai_insight = Some(text);
            }
            Err(err) => {
                warn!(contractor_id = %record.contractor_id, error = %err, "insight generation failed");
                record.ai_insight = None;
            }
        }
    }
    store.write_all(&records).context("saving enriched records")?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_joins_relative_hrefs() {
        assert_eq!(
            resolve_url(
                "https://example.com/en-us/roofing-contractors/residential",
                "/roofing-contractors/acme-10432"
            ),
            "https://example.com/roofing-contractors/acme-10432"
        );
        assert_eq!(
            resolve_url("https://example.com/a", "https://other.test/b"),
            "https://other.test/b"
        );
    }

    #[test]
    fn prompt_carries_fields_and_reviews() {
        let record = ContractorRecord {
            contractor_id: "1".into(),
            profile_url: "/roofing-contractors/acme-1".into(),
            name: Some("Acme Roofing".into()),
            rating: Some("4.8".into()),
            location: Some("New York, NY".into()),
            phone: None,
            detail: rcd_core::DetailFields {
                about: None,
                reviews: vec!["Great crew (Jan 2024)".into()],
                founding_year: Some("1987".into()),
                state_license: None,
                number_of_employees: None,
            },
            last_modified: None,
            last_updated: Utc::now(),
            ai_insight: None,
        };
        let prompt = insight_prompt(&record);
        assert!(prompt.contains("Company Name: Acme Roofing"));
        assert!(prompt.contains("Founded: 1987"));
        assert!(prompt.contains("State License: Not specified"));
        assert!(prompt.contains("Great crew (Jan 2024)"));
    }
}
