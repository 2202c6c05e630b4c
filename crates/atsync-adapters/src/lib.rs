//! Candidate source contracts, the Merge ATS adapter, and the field normalizer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use atsync_core::{redact_token, CandidatePage, NormalizedCandidateRow, RawCandidate};
use atsync_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "atsync-adapters";

pub const DEFAULT_MERGE_API_BASE_URL: &str = "https://api.merge.dev/api";

const ACCOUNT_TOKEN_HEADER: &str = "x-account-token";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Remote HTTP status behind this error, when there was one.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            _ => None,
        }
    }
}

/// One page of raw candidates for a connected account.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawCandidate>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTokenRequest {
    pub end_user_origin_id: String,
    pub end_user_organization_name: String,
    pub end_user_email_address: String,
    pub categories: Vec<String>,
}

/// Result of trading a Link public token for a long-lived account token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLink {
    pub account_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountTokenResponse {
    #[serde(default)]
    account_token: Option<String>,
}

/// Merge unified ATS API client. The API key is fixed at construction.
#[derive(Debug, Clone)]
pub struct MergeAtsAdapter {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl MergeAtsAdapter {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, account_token: Option<&str>) -> Result<HeaderMap, AdapterError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| AdapterError::Message("api key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = account_token {
            let value = HeaderValue::from_str(token).map_err(|_| {
                AdapterError::Message("account token is not a valid header value".into())
            })?;
            headers.insert(ACCOUNT_TOKEN_HEADER, value);
        }
        Ok(headers)
    }

    /// Fetch exactly one page of candidates, surfacing every failure.
    pub async fn try_fetch_candidates(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawCandidate>, AdapterError> {
        info!(
            account = %redact_token(account_token),
            limit,
            offset,
            "fetching candidates"
        );
        let url = format!("{}/ats/v1/candidates", self.base_url);
        let page: CandidatePage = self
            .http
            .get_json(
                &url,
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
                self.headers(Some(account_token))?,
            )
            .await?;
        if page.skipped > 0 {
            warn!(skipped = page.skipped, "dropped malformed candidate entries");
        }
        info!(count = page.results.len(), "fetched candidates");
        Ok(page.results)
    }

    /// Fail-soft variant: any failure is logged and yields an empty page.
    pub async fn fetch_candidates(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Vec<RawCandidate> {
        match self.try_fetch_candidates(account_token, limit, offset).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "error fetching candidates");
                Vec::new()
            }
        }
    }

    pub async fn create_link_token(
        &self,
        request: &LinkTokenRequest,
    ) -> Result<JsonValue, AdapterError> {
        info!(email = %request.end_user_email_address, "creating link token");
        let url = format!("{}/integrations/create-link-token", self.base_url);
        let body = self.http.post_json(&url, request, self.headers(None)?).await?;
        info!("link token created");
        Ok(body)
    }

    /// Exchange a Link public token, then probe the ATS jobs endpoint with the
    /// new account token. A failed probe still returns the token.
    pub async fn exchange_account_token(
        &self,
        public_token: &str,
    ) -> Result<AccountLink, AdapterError> {
        let mut url = Url::parse(&format!("{}/integrations/account-token", self.base_url))
            .map_err(|e| AdapterError::Message(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message("base url cannot carry a path".into()))?
            .push(public_token);

        let exchanged: AccountTokenResponse = self
            .http
            .get_json(url.as_str(), &[], self.headers(None)?)
            .await?;
        let account_token = exchanged
            .account_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::Message("exchange response lacks account_token".into()))?;
        info!(account = %redact_token(&account_token), "exchanged public token");

        let jobs_url = format!("{}/ats/v1/jobs", self.base_url);
        let sample = self
            .http
            .get_json::<JsonValue>(&jobs_url, &[], self.headers(Some(&account_token))?)
            .await;
        Ok(match sample {
            Ok(data) => AccountLink {
                account_token,
                data: Some(data),
                message: None,
            },
            Err(err) => {
                warn!(error = %err, "could not fetch sample data for new account");
                AccountLink {
                    account_token,
                    data: None,
                    message: Some("Successfully connected, but no data available".into()),
                }
            }
        })
    }
}

#[async_trait]
impl CandidateSource for MergeAtsAdapter {
    fn source_id(&self) -> &'static str {
        "merge-ats"
    }

    async fn fetch_page(
        &self,
        account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawCandidate>, AdapterError> {
        self.try_fetch_candidates(account_token, limit, offset).await
    }
}

/// Serves candidates from a captured listing page on disk.
#[derive(Debug, Clone, Default)]
pub struct FixtureCandidateSource {
    candidates: Vec<RawCandidate>,
}

impl FixtureCandidateSource {
    pub fn new(candidates: Vec<RawCandidate>) -> Self {
        Self { candidates }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let page = load_fixture_page(path)?;
        Ok(Self::new(page.results))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl CandidateSource for FixtureCandidateSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(
        &self,
        _account_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawCandidate>, AdapterError> {
        Ok(self
            .candidates
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<CandidatePage> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn scalar(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn first_entry_value(entries: &Option<Vec<JsonValue>>) -> String {
    entries
        .as_deref()
        .and_then(<[JsonValue]>::first)
        .and_then(|entry| entry.get("value"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn first_string(entries: &Option<Vec<JsonValue>>) -> String {
    entries
        .as_deref()
        .and_then(<[JsonValue]>::first)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn json_text<T: Serialize>(value: &Option<T>, empty: &str) -> String {
    match value {
        Some(inner) => serde_json::to_string(inner).unwrap_or_else(|_| empty.to_string()),
        None => empty.to_string(),
    }
}

/// Flatten one raw candidate into a storage row. Never fails: absent scalars
/// become `""`, absent sequences `"[]"`, an absent mapping `"{}"`.
pub fn normalize_candidate(raw: &RawCandidate) -> NormalizedCandidateRow {
    NormalizedCandidateRow {
        merge_id: scalar(&raw.id),
        remote_id: scalar(&raw.remote_id),
        first_name: scalar(&raw.first_name),
        last_name: scalar(&raw.last_name),
        company: scalar(&raw.company),
        title: scalar(&raw.title),
        email: first_entry_value(&raw.email_addresses),
        phone: first_entry_value(&raw.phone_numbers),
        location: first_string(&raw.locations),
        created_at: scalar(&raw.created_at),
        modified_at: scalar(&raw.modified_at),
        remote_created_at: scalar(&raw.remote_created_at),
        remote_updated_at: scalar(&raw.remote_updated_at),
        applications_json: json_text(&raw.applications, "[]"),
        attachments_json: json_text(&raw.attachments, "[]"),
        locations_json: json_text(&raw.locations, "[]"),
        phone_numbers_json: json_text(&raw.phone_numbers, "[]"),
        email_addresses_json: json_text(&raw.email_addresses, "[]"),
        urls_json: json_text(&raw.urls, "[]"),
        tags_json: json_text(&raw.tags, "[]"),
        field_mappings_json: json_text(&raw.field_mappings, "{}"),
        remote_was_deleted: raw.remote_was_deleted.unwrap_or(false),
    }
}

pub fn normalize_candidates(raws: &[RawCandidate]) -> Vec<NormalizedCandidateRow> {
    raws.iter().map(normalize_candidate).collect()
}
