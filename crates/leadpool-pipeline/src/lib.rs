//! Pagination-bounded, deduplicated, concurrency-limited scrape pipeline.
//!
//! One control flow drives pages sequentially: list stubs, drop already-seen
//! ids, deep-fetch the rest under a bounded pool, normalize, append to the
//! CSV sink and flush. Page N+1 is never touched before page N is durable,
//! so a crash loses at most one page of work.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use leadpool_core::{
    normalize, LeadRecord, LeadStub, NormalizeContext, RunTarget, StatusSource, PAGE_SIZE,
};
use leadpool_export::{output_path, read_existing_ids, CsvSink};
use leadpool_portal::{HttpPortalSession, PortalConfig, PortalError, PortalSession};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadpool-pipeline";

/// Set-based dedup gate. Seeded from a pre-existing output file when
/// resuming; grows monotonically during the run; discarded at run end (the
/// output file is the persisted registry).
#[derive(Debug, Default)]
pub struct IdRegistry {
    seen: HashSet<String>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            seen: ids.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Stubs whose id has not been seen, in input order, registering each
    /// returned id. A duplicate id is never returned twice within one run,
    /// even twice on the same page.
    pub fn filter_new(&mut self, stubs: Vec<LeadStub>) -> Vec<LeadStub> {
        stubs
            .into_iter()
            .filter(|stub| self.seen.insert(stub.id.clone()))
            .collect()
    }
}

/// Knobs for one pipeline instance; credentials live on [`PortalConfig`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_dir: PathBuf,
    /// In-flight detail fetches per page batch. Source deployments ran
    /// 10-20; 15 is the canonical default.
    pub fetch_concurrency: usize,
    pub default_status: String,
    pub status_source: StatusSource,
    /// Total reported when the filter summary cannot be read.
    pub total_on_filter_error: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./leads"),
            fetch_concurrency: 15,
            default_status: "Expired".to_string(),
            status_source: StatusSource::default(),
            total_on_filter_error: 0,
        }
    }
}

/// Everything the CLI needs, read from the environment (`.env` honored).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub http_timeout_secs: u64,
    pub options: PipelineOptions,
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let email = std::env::var("PORTAL_EMAIL").context("PORTAL_EMAIL is not set")?;
        let password = std::env::var("PORTAL_PASSWORD").context("PORTAL_PASSWORD is not set")?;

        let options = PipelineOptions {
            output_dir: std::env::var("LEADPOOL_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./leads")),
            fetch_concurrency: std::env::var("LEADPOOL_FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            default_status: std::env::var("LEADPOOL_DEFAULT_STATUS")
                .unwrap_or_else(|_| "Expired".to_string()),
            status_source: match std::env::var("LEADPOOL_STATUS_SOURCE").as_deref() {
                Ok("context") => StatusSource::Context,
                _ => StatusSource::ScrapedWithFallback,
            },
            total_on_filter_error: std::env::var("LEADPOOL_TOTAL_ON_FILTER_ERROR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        };

        Ok(Self {
            base_url: std::env::var("PORTAL_BASE_URL")
                .unwrap_or_else(|_| "https://data.cofoundersgroup.com".to_string()),
            email,
            password,
            http_timeout_secs: std::env::var("LEADPOOL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            options,
        })
    }

    /// Output directory alone, for operations that need no credentials.
    pub fn output_dir_from_env() -> PathBuf {
        dotenvy::dotenv().ok();
        std::env::var("LEADPOOL_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./leads"))
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.base_url.clone(),
            email: self.email.clone(),
            password: self.password.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_path: PathBuf,
    /// Portal-reported total after filters (or the configured substitute).
    pub total_available: u64,
    /// `min(total_available, max_limit)` — the row count this run aimed for.
    pub target_rows: u64,
    pub pages_visited: u64,
    pub rows_written: u64,
    pub duplicates_skipped: u64,
    pub failed_fetches: u64,
}

pub struct ScrapePipeline {
    portal: Arc<dyn PortalSession>,
    options: PipelineOptions,
}

impl ScrapePipeline {
    pub fn new(portal: Arc<dyn PortalSession>, options: PipelineOptions) -> Self {
        Self { portal, options }
    }

    /// Runs the full discover/dedup/fetch/write loop for one target.
    ///
    /// Auth and output-write failures abort; a failed filter summary, a
    /// failed per-lead fetch, and a dead pagination control all degrade
    /// per the recovery policy and leave the run completing softly.
    pub async fn run(&self, target: &RunTarget) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        self.portal
            .login()
            .await
            .context("logging in to the portal")?;

        let total_available = match self.portal.apply_filters(&target.filter()).await {
            Ok(total) => total,
            Err(err @ PortalError::FilterApply(_)) => {
                warn!(error = %err, substitute = self.options.total_on_filter_error,
                    "filter summary unavailable; using configured substitute total");
                self.options.total_on_filter_error
            }
            Err(err) => return Err(err).context("applying portal filters"),
        };

        let to_process = match target.effective_limit() {
            Some(limit) => total_available.min(limit),
            None => total_available,
        };
        let pages_needed = to_process.div_ceil(PAGE_SIZE);

        let status_label = target
            .status
            .clone()
            .unwrap_or_else(|| self.options.default_status.clone());
        let path = output_path(
            &self.options.output_dir,
            &status_label,
            target.zip_code.as_deref(),
            started_at.date_naive(),
        );

        let mut registry = IdRegistry::seed(read_existing_ids(&path));
        if !registry.is_empty() {
            info!(seeded = registry.len(), path = %path.display(), "resuming against existing output");
        }
        let mut sink = CsvSink::open(&path).context("opening output file")?;

        info!(
            %run_id,
            total_available,
            to_process,
            pages_needed,
            "starting scrape"
        );

        let ctx = NormalizeContext {
            status: &status_label,
            status_source: self.options.status_source,
        };

        let mut pages_visited = 0u64;
        let mut rows_written = 0u64;
        let mut duplicates_skipped = 0u64;
        let mut failed_fetches = 0u64;

        for page_index in 0..pages_needed {
            if rows_written >= to_process {
                break;
            }

            let stubs = match self.portal.list_page_stubs().await {
                Ok(stubs) => stubs,
                Err(err) => {
                    warn!(page = page_index, error = %err, "listing read failed; treating as exhausted");
                    break;
                }
            };
            pages_visited += 1;

            let listed = stubs.len() as u64;
            let mut fresh = registry.filter_new(stubs);
            duplicates_skipped += listed - fresh.len() as u64;

            // Never fetch more than the target still needs; the portal may
            // report a stale or higher total.
            let remaining = (to_process - rows_written) as usize;
            fresh.truncate(remaining);

            if !fresh.is_empty() {
                let (records, failures) = self.fetch_many(&fresh, ctx).await;
                failed_fetches += failures;
                rows_written += records.len() as u64;
                sink.append(&records).context("appending page batch")?;
                sink.flush().context("flushing page batch")?;
                info!(
                    page = page_index,
                    batch = records.len(),
                    rows_written,
                    "page synced"
                );
            }

            if page_index + 1 < pages_needed && rows_written < to_process {
                match self.portal.advance_page().await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(page = page_index, "no further listing page; finishing early");
                        break;
                    }
                    Err(err) => {
                        warn!(page = page_index, error = %err, "pagination failed; finishing early");
                        break;
                    }
                }
            }
        }

        let finished_at = Utc::now();
        info!(rows_written, failed_fetches, path = %path.display(), "scrape finished");

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            output_path: path,
            total_available,
            target_rows: to_process,
            pages_visited,
            rows_written,
            duplicates_skipped,
            failed_fetches,
        })
    }

    /// Deep-fetches one page's worth of stubs under the concurrency cap.
    ///
    /// Returns exactly one record per stub, in submission order; a failed
    /// fetch degrades that one row to the placeholder fallback instead of
    /// aborting the batch.
    async fn fetch_many(
        &self,
        stubs: &[LeadStub],
        ctx: NormalizeContext<'_>,
    ) -> (Vec<LeadRecord>, u64) {
        let semaphore = Arc::new(Semaphore::new(self.options.fetch_concurrency.max(1)));

        let fetches = stubs.iter().map(|stub| {
            let semaphore = Arc::clone(&semaphore);
            let portal = Arc::clone(&self.portal);
            async move {
                // The pool is local to this batch and never closed; if a
                // permit is somehow refused, degrade the row rather than
                // panic mid-run.
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(lead = %stub.id, "fetch pool unavailable; degrading to fallback row");
                        return (LeadRecord::fallback(stub, ctx.status), true);
                    }
                };
                match portal.fetch_detail(&stub.id).await {
                    Ok(attrs) => (normalize(stub, &attrs, ctx), false),
                    Err(err) => {
                        warn!(lead = %stub.id, error = %err, "detail fetch degraded to fallback row");
                        (LeadRecord::fallback(stub, ctx.status), true)
                    }
                }
            }
        });

        let mut records = Vec::with_capacity(stubs.len());
        let mut failures = 0u64;
        for (record, failed) in join_all(fetches).await {
            if failed {
                failures += 1;
            }
            records.push(record);
        }
        (records, failures)
    }
}

/// Convenience entry used by the CLI: env config, live portal, one run.
pub async fn run_from_env(target: &RunTarget) -> Result<RunSummary> {
    let config = RunConfig::from_env()?;
    let portal = HttpPortalSession::new(config.portal_config())
        .context("building portal session")?;
    let pipeline = ScrapePipeline::new(Arc::new(portal), config.options.clone());
    pipeline.run(target).await
}

const REPORT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"];

fn parse_report_date(raw: &str) -> Option<NaiveDate> {
    REPORT_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

/// Markdown summary of the newest output file's most recently added rows.
pub fn report_recent(output_dir: &Path, limit: usize) -> Result<String> {
    let mut outputs = std::fs::read_dir(output_dir)
        .with_context(|| format!("reading {}", output_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "csv")
        })
        .collect::<Vec<_>>();
    outputs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());

    let Some(newest) = outputs.pop() else {
        return Ok(format!(
            "No output files under {} yet.",
            output_dir.display()
        ));
    };
    let path = newest.path();

    let mut reader = csv::Reader::from_path(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("parsing {}", path.display()))?;
        let date = row.get(7).and_then(parse_report_date);
        rows.push((date, row));
    }
    // Newest first; rows without a parseable date sink to the end in file
    // order.
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec![
        format!("# Recent leads — {}", path.display()),
        String::new(),
    ];
    for (date, row) in rows.iter().take(limit.max(1)) {
        let shown_date = date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| row.get(7).unwrap_or("?").to_string());
        lines.push(format!(
            "- {} | {} | added {} | {}",
            row.get(0).unwrap_or("?"),
            row.get(1).unwrap_or("?"),
            shown_date,
            row.get(4).unwrap_or("?"),
        ));
    }
    lines.push(String::new());
    lines.push(format!("{} rows total.", rows.len()));
    Ok(lines.join("\n"))
}
