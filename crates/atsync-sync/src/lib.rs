//! Candidate sync orchestration: fetch → normalize → upsert.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use atsync_adapters::{
    normalize_candidates, AdapterError, CandidateSource, MergeAtsAdapter,
    DEFAULT_MERGE_API_BASE_URL,
};
use atsync_core::{
    redact_token, CandidatePreview, NormalizedCandidateRow, RawCandidate, SyncResult,
    CONFLICT_KEY, DEFAULT_TABLE_NAME,
};
use atsync_storage::{
    validate_identifier, CandidateSink, HttpClientConfig, HttpFetcher, PgCandidateSink,
    PostgrestSink, SinkError,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atsync-sync";

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub merge_api_key: String,
    pub merge_api_base_url: String,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub http_timeout_secs: u64,
    pub max_pages: u32,
    pub port: u16,
    pub rust_log: String,
}

/// Which persistence backend the environment selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Postgres { database_url: String },
    Postgrest { url: String, key: String },
    Unconfigured,
}

impl BridgeConfig {
    /// Load `.env` when present, then read the process environment. A
    /// missing `MERGE_API_KEY` is a startup error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(merge_api_key) = non_empty("MERGE_API_KEY") else {
            bail!("Required environment variable 'MERGE_API_KEY' is not set");
        };

        Ok(Self {
            merge_api_key,
            merge_api_base_url: non_empty("MERGE_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MERGE_API_BASE_URL.to_string()),
            database_url: non_empty("DATABASE_URL"),
            supabase_url: non_empty("SUPABASE_URL"),
            supabase_key: non_empty("SUPABASE_KEY"),
            http_timeout_secs: parse_positive("ATSYNC_HTTP_TIMEOUT_SECS", non_empty("ATSYNC_HTTP_TIMEOUT_SECS"), 30)?,
            max_pages: parse_positive("ATSYNC_MAX_PAGES", non_empty("ATSYNC_MAX_PAGES"), 50)?,
            port: parse_positive("PORT", non_empty("PORT"), 8000)?,
            rust_log: non_empty("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn sink_target(&self) -> SinkTarget {
        if let Some(database_url) = &self.database_url {
            return SinkTarget::Postgres {
                database_url: database_url.clone(),
            };
        }
        match (&self.supabase_url, &self.supabase_key) {
            (Some(url), Some(key)) => SinkTarget::Postgrest {
                url: url.clone(),
                key: key.clone(),
            },
            _ => SinkTarget::Unconfigured,
        }
    }
}

/// Numeric setting that must parse and be non-zero when present.
fn parse_positive<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Ok(value),
        Ok(_) => bail!("{key} must be greater than zero"),
        Err(err) => bail!("{key} must be a positive integer, got {raw:?}: {err}"),
    }
}

/// Offset of `page_no`, or `None` once it leaves the `u32` range.
fn page_offset(page_no: u32, page_size: u32) -> Option<u32> {
    page_no.checked_mul(page_size)
}

/// Closed set of sync failure kinds. Every variant is reported to callers
/// as a `SyncResult` with `success = false`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Error fetching candidates: {0}")]
    Remote(#[from] AdapterError),
    #[error("No candidates found or error fetching candidates")]
    NoCandidates,
    #[error("Candidate sink not initialized")]
    SinkUnavailable,
    #[error("Error: {0}")]
    Sink(#[from] SinkError),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Remote(_) => "REMOTE_ERROR",
            Self::NoCandidates => "NO_CANDIDATES",
            Self::SinkUnavailable => "SINK_UNAVAILABLE",
            Self::Sink(_) => "SINK_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub fn into_result(self) -> SyncResult {
        SyncResult::failed(self.code(), self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// One page of `page_size` records at offset 0.
    FirstPage,
    /// Pages until a short page, capped at `max_pages`.
    AllPages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: u32,
    pub max_pages: u32,
    pub preview_rows: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: 50,
            preview_rows: PREVIEW_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub table: String,
    pub fetched: usize,
    pub upserted: usize,
    pub rejected: usize,
}

pub struct SyncPipeline {
    source: Arc<dyn CandidateSource>,
    sink: Option<Arc<dyn CandidateSink>>,
    options: SyncOptions,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn CandidateSource>, sink: Option<Arc<dyn CandidateSink>>) -> Self {
        Self {
            source,
            sink,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Fetch one page, keeping empty and failed fetches apart.
    pub async fn fetch(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawCandidate>, SyncError> {
        self.source
            .fetch_page(account_token, limit, offset)
            .await
            .map_err(|err| {
                error!(source_id = self.source.source_id(), error = %err, "candidate fetch failed");
                SyncError::Remote(err)
            })
    }

    async fn fetch_all(&self, account_token: &str) -> Result<Vec<RawCandidate>, SyncError> {
        let page_size = self.options.page_size.max(1);
        let mut out = Vec::new();
        for page_no in 0..self.options.max_pages.max(1) {
            let Some(offset) = page_offset(page_no, page_size) else {
                warn!(page_no, page_size, "page offset out of range; stopping pagination");
                return Ok(out);
            };
            let page = self.fetch(account_token, page_size, offset).await?;
            let short = page.len() < page_size as usize;
            out.extend(page);
            if short {
                return Ok(out);
            }
        }
        warn!(
            max_pages = self.options.max_pages,
            fetched = out.len(),
            "page cap reached; remaining candidates not synced"
        );
        Ok(out)
    }

    pub async fn sync(&self, account_token: &str, table: &str) -> SyncResult {
        self.sync_scoped(account_token, table, SyncScope::FirstPage).await
    }

    pub async fn sync_all_pages(&self, account_token: &str, table: &str) -> SyncResult {
        self.sync_scoped(account_token, table, SyncScope::AllPages).await
    }

    pub async fn sync_scoped(&self, account_token: &str, table: &str, scope: SyncScope) -> SyncResult {
        match self.try_sync(account_token, table, scope).await {
            Ok(outcome) => SyncResult::succeeded(
                outcome.upserted,
                format!(
                    "Successfully synced {} candidates to {}",
                    outcome.upserted, outcome.table
                ),
            )
            .with_rejected(outcome.rejected),
            Err(err) => {
                error!(code = err.code(), error = ?err, "candidate sync failed");
                err.into_result()
            }
        }
    }

    pub async fn try_sync(
        &self,
        account_token: &str,
        table: &str,
        scope: SyncScope,
    ) -> Result<SyncOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "candidate_sync",
            %run_id,
            table,
            account = %redact_token(account_token),
            ?scope
        );
        self.run(run_id, account_token, table, scope)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        account_token: &str,
        table: &str,
        scope: SyncScope,
    ) -> Result<SyncOutcome, SyncError> {
        let sink = self.sink.as_ref().ok_or(SyncError::SinkUnavailable)?;
        validate_identifier(table).map_err(|err| SyncError::Validation(err.to_string()))?;

        let raws = match scope {
            SyncScope::FirstPage => self.fetch(account_token, self.options.page_size, 0).await?,
            SyncScope::AllPages => self.fetch_all(account_token).await?,
        };
        if raws.is_empty() {
            return Err(SyncError::NoCandidates);
        }

        let (accepted, rejected): (Vec<NormalizedCandidateRow>, Vec<NormalizedCandidateRow>) =
            normalize_candidates(&raws)
                .into_iter()
                .partition(NormalizedCandidateRow::has_merge_id);
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "skipping candidates without an id");
        }
        if accepted.is_empty() {
            return Err(SyncError::Validation(format!(
                "none of the {} fetched candidates carry an id",
                rejected.len()
            )));
        }

        info!(rows = accepted.len(), sink = sink.name(), "upserting candidates");
        sink.upsert(table, &accepted, CONFLICT_KEY).await?;
        info!(rows = accepted.len(), "candidate sync complete");

        Ok(SyncOutcome {
            run_id,
            table: table.to_string(),
            fetched: raws.len(),
            upserted: accepted.len(),
            rejected: rejected.len(),
        })
    }

    /// Fetch and normalize one page without persisting it.
    pub async fn preview(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<CandidatePreview, SyncError> {
        let raws = self.fetch(account_token, limit, offset).await?;
        if raws.is_empty() {
            return Err(SyncError::NoCandidates);
        }
        let rows = normalize_candidates(&raws);
        Ok(CandidatePreview {
            count: rows.len(),
            table_structure: NormalizedCandidateRow::COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            data: rows.into_iter().take(self.options.preview_rows).collect(),
        })
    }
}

/// Everything a serving or one-shot process needs, built from config.
pub struct BridgeRuntime {
    pub config: BridgeConfig,
    pub merge: Arc<MergeAtsAdapter>,
    pub pipeline: Arc<SyncPipeline>,
}

impl BridgeRuntime {
    pub async fn from_config(config: BridgeConfig) -> Result<Self> {
        info!(base_url = %config.merge_api_base_url, api_key = %redact_token(&config.merge_api_key), "initializing merge client");
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(format!("atsync/{}", env!("CARGO_PKG_VERSION"))),
        })?;
        let merge = Arc::new(MergeAtsAdapter::new(
            http,
            config.merge_api_base_url.clone(),
            config.merge_api_key.clone(),
        ));
        let sink = connect_sink(&config).await;
        let pipeline = SyncPipeline::new(merge.clone(), sink).with_options(SyncOptions {
            max_pages: config.max_pages,
            ..SyncOptions::default()
        });
        Ok(Self {
            config,
            merge,
            pipeline: Arc::new(pipeline),
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(BridgeConfig::from_env()?).await
    }
}

/// Build the configured sink. Failures degrade to "unavailable" so the
/// process keeps serving fetch and preview.
pub async fn connect_sink(config: &BridgeConfig) -> Option<Arc<dyn CandidateSink>> {
    match config.sink_target() {
        SinkTarget::Postgres { database_url } => match PgCandidateSink::connect(&database_url).await {
            Ok(sink) => {
                if let Err(err) = sink.ensure_table(DEFAULT_TABLE_NAME).await {
                    warn!(error = %err, "could not ensure default candidate table");
                }
                Some(Arc::new(sink))
            }
            Err(err) => {
                error!(error = %err, "failed to initialize postgres sink");
                None
            }
        },
        SinkTarget::Postgrest { url, key } => {
            match PostgrestSink::new(&url, &key) {
                Ok(sink) => {
                    info!(%url, "postgrest sink initialized");
                    Some(Arc::new(sink))
                }
                Err(err) => {
                    error!(error = %err, "failed to initialize postgrest sink");
                    None
                }
            }
        }
        SinkTarget::Unconfigured => {
            warn!("no DATABASE_URL or SUPABASE_URL/SUPABASE_KEY; sync is unavailable");
            None
        }
    }
}
