//! HTTP fetch utilities + upsert sinks for ATSync.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use atsync_core::{NormalizedCandidateRow, CONFLICT_KEY};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "atsync-storage";

/// Rows bound per INSERT statement; 22 binds per row keeps us far from the
/// Postgres 65535 parameter ceiling.
const PG_ROWS_PER_STATEMENT: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Thin wrapper over a pooled `reqwest::Client` that treats anything but
/// `200 OK` as a failure and decodes JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: HeaderMap,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_get", url);
        async move {
            let resp = self
                .client
                .get(url)
                .query(query)
                .headers(headers)
                .send()
                .await?;
            decode_ok_response(url, resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_post", url);
        async move {
            let resp = self
                .client
                .post(url)
                .headers(headers)
                .json(body)
                .send()
                .await?;
            decode_ok_response(url, resp).await
        }
        .instrument(span)
        .await
    }
}

async fn decode_ok_response<T: DeserializeOwned>(
    url: &str,
    resp: reqwest::Response,
) -> Result<T, FetchError> {
    let status = resp.status();
    debug!(status = status.as_u16(), "remote responded");
    if status != StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sink responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("unsupported conflict key {0:?}")]
    UnsupportedConflictKey(String),
    #[error("{0}")]
    Backend(String),
}

/// Conflict-aware insert-or-update capability for normalized rows.
///
/// Rows whose conflict key matches an existing row replace it entirely; the
/// whole batch is applied before returning or the call fails as a unit.
#[async_trait]
pub trait CandidateSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedCandidateRow],
        conflict_key: &str,
    ) -> Result<(), SinkError>;
}

/// Accepts plain unquoted SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`, at
/// most 63 bytes (the Postgres limit).
pub fn validate_identifier(name: &str) -> Result<(), SinkError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(SinkError::InvalidIdentifier(name.to_string()))
    }
}

fn validate_conflict_key(conflict_key: &str) -> Result<(), SinkError> {
    validate_identifier(conflict_key)?;
    if conflict_key != CONFLICT_KEY {
        return Err(SinkError::UnsupportedConflictKey(conflict_key.to_string()));
    }
    Ok(())
}

/// Collapse rows sharing a `merge_id`: the first occurrence keeps its slot,
/// the last occurrence supplies the values.
pub fn collapse_duplicate_keys(rows: &[NormalizedCandidateRow]) -> Vec<&NormalizedCandidateRow> {
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<&NormalizedCandidateRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match slots.get(row.merge_id.as_str()) {
            Some(&idx) => out[idx] = row,
            None => {
                slots.insert(row.merge_id.as_str(), out.len());
                out.push(row);
            }
        }
    }
    out
}

fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

pub fn create_table_sql(table: &str) -> Result<String, SinkError> {
    validate_identifier(table)?;
    let columns = NormalizedCandidateRow::COLUMNS
        .iter()
        .map(|col| match *col {
            "merge_id" => format!("{} TEXT PRIMARY KEY", quote_ident(col)),
            "remote_was_deleted" => format!("{} BOOLEAN NOT NULL DEFAULT FALSE", quote_ident(col)),
            _ => format!("{} TEXT NOT NULL DEFAULT ''", quote_ident(col)),
        })
        .collect::<Vec<_>>()
        .join(",\n    ");
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {columns}\n)",
        quote_ident(table)
    ))
}

fn insert_prefix_sql(table: &str) -> String {
    let columns = NormalizedCandidateRow::COLUMNS
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({columns}) ", quote_ident(table))
}

/// `ON CONFLICT` tail that overwrites every non-key column.
pub fn upsert_conflict_sql(conflict_key: &str) -> String {
    let assignments = NormalizedCandidateRow::COLUMNS
        .iter()
        .filter(|c| **c != conflict_key)
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {assignments}",
        quote_ident(conflict_key)
    )
}

/// Postgres sink writing each batch inside one transaction.
#[derive(Debug, Clone)]
pub struct PgCandidateSink {
    pool: PgPool,
}

impl PgCandidateSink {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        info!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("postgres connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_table(&self, table: &str) -> Result<(), SinkError> {
        let sql = create_table_sql(table)?;
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table, "candidate table ensured");
        Ok(())
    }
}

#[async_trait]
impl CandidateSink for PgCandidateSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedCandidateRow],
        conflict_key: &str,
    ) -> Result<(), SinkError> {
        validate_identifier(table)?;
        validate_conflict_key(conflict_key)?;
        let rows = collapse_duplicate_keys(rows);
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(PG_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Postgres>::new(insert_prefix_sql(table));
            qb.push_values(chunk.iter(), |mut b, row| {
                for value in row.text_values() {
                    b.push_bind(value.to_string());
                }
                b.push_bind(row.remote_was_deleted);
            });
            qb.push(upsert_conflict_sql(conflict_key));
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(table, rows = rows.len(), "postgres upsert committed");
        Ok(())
    }
}

/// Sink speaking the PostgREST dialect exposed by Supabase projects.
///
/// The client carries no request timeout: a batch the server is still
/// committing must not be reported as failed.
#[derive(Debug, Clone)]
pub struct PostgrestSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PostgrestSink {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }
}

#[async_trait]
impl CandidateSink for PostgrestSink {
    fn name(&self) -> &'static str {
        "postgrest"
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedCandidateRow],
        conflict_key: &str,
    ) -> Result<(), SinkError> {
        validate_identifier(table)?;
        validate_conflict_key(conflict_key)?;
        let rows = collapse_duplicate_keys(rows);
        if rows.is_empty() {
            return Ok(());
        }

        let resp = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", conflict_key)])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        info!(table, rows = rows.len(), status = status.as_u16(), "postgrest upsert accepted");
        Ok(())
    }
}

/// In-process sink keyed on `merge_id`; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, BTreeMap<String, NormalizedCandidateRow>>>,
    batch_sizes: Mutex<Vec<usize>>,
    failure: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every upsert fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<NormalizedCandidateRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Row counts of every upsert call received, in call order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().await.clone()
    }
}

#[async_trait]
impl CandidateSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[NormalizedCandidateRow],
        conflict_key: &str,
    ) -> Result<(), SinkError> {
        validate_identifier(table)?;
        validate_conflict_key(conflict_key)?;
        self.batch_sizes.lock().await.push(rows.len());
        if let Some(message) = &self.failure {
            return Err(SinkError::Backend(message.clone()));
        }

        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            stored.insert(row.merge_id.clone(), row.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use reqwest::header::HeaderValue;
    use serde_json::{json, Value as JsonValue};

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn row(merge_id: &str, first_name: &str) -> NormalizedCandidateRow {
        NormalizedCandidateRow {
            merge_id: merge_id.to_string(),
            first_name: first_name.to_string(),
            applications_json: "[]".into(),
            field_mappings_json: "{}".into(),
            ..Default::default()
        }
    }

    #[test]
    fn identifiers_reject_quotes_and_leading_digits() {
        assert!(validate_identifier("candidates").is_ok());
        assert!(validate_identifier("_ats_candidates_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2candidates").is_err());
        assert!(validate_identifier("candidates; drop table x").is_err());
        assert!(validate_identifier("cand\"idates").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn duplicate_keys_collapse_to_last_values_in_first_slot() {
        let rows = vec![row("a", "first"), row("b", "bee"), row("a", "second")];
        let collapsed = collapse_duplicate_keys(&rows);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].merge_id, "a");
        assert_eq!(collapsed[0].first_name, "second");
        assert_eq!(collapsed[1].merge_id, "b");
    }

    #[test]
    fn conflict_clause_overwrites_every_non_key_column() {
        let sql = upsert_conflict_sql("merge_id");
        assert!(sql.starts_with(" ON CONFLICT (\"merge_id\") DO UPDATE SET "));
        assert!(sql.contains("\"remote_id\" = EXCLUDED.\"remote_id\""));
        assert!(sql.contains("\"remote_was_deleted\" = EXCLUDED.\"remote_was_deleted\""));
        assert!(!sql.contains("\"merge_id\" = EXCLUDED"));
        assert_eq!(sql.matches("EXCLUDED.").count(), NormalizedCandidateRow::COLUMNS.len() - 1);
    }

    #[test]
    fn create_table_sql_keys_on_merge_id() {
        let sql = create_table_sql("candidates").expect("sql");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"candidates\""));
        assert!(sql.contains("\"merge_id\" TEXT PRIMARY KEY"));
        assert!(sql.contains("\"remote_was_deleted\" BOOLEAN NOT NULL DEFAULT FALSE"));
        assert!(create_table_sql("bad-name").is_err());
    }

    #[tokio::test]
    async fn memory_sink_overwrites_on_conflict() {
        let sink = MemorySink::new();
        sink.upsert("candidates", &[row("a", "Ana"), row("b", "Ben")], CONFLICT_KEY)
            .await
            .expect("first upsert");
        sink.upsert("candidates", &[row("a", "Anabel")], CONFLICT_KEY)
            .await
            .expect("second upsert");

        let rows = sink.rows("candidates").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].first_name, "Anabel");
        assert_eq!(sink.batch_sizes().await, vec![2, 1]);
    }

    #[tokio::test]
    async fn memory_sink_rejects_foreign_conflict_key() {
        let sink = MemorySink::new();
        let err = sink
            .upsert("candidates", &[row("a", "Ana")], "email")
            .await
            .expect_err("conflict key");
        assert!(matches!(err, SinkError::UnsupportedConflictKey(_)));
    }

    #[tokio::test]
    async fn get_json_decodes_ok_and_forwards_headers() {
        async fn echo(headers: AxumHeaders, Query(q): Query<HashMap<String, String>>) -> Json<JsonValue> {
            Json(json!({
                "token": headers.get("x-account-token").and_then(|v| v.to_str().ok()),
                "limit": q.get("limit"),
            }))
        }
        let base = spawn_server(Router::new().route("/echo", get(echo))).await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let mut headers = HeaderMap::new();
        headers.insert("X-Account-Token", HeaderValue::from_static("acct-1"));
        let body: JsonValue = http
            .get_json(&format!("{base}/echo"), &[("limit", "7".to_string())], headers)
            .await
            .expect("ok response");

        assert_eq!(body["token"], json!("acct-1"));
        assert_eq!(body["limit"], json!("7"));
    }

    #[tokio::test]
    async fn get_json_maps_non_200_and_malformed_bodies() {
        let router = Router::new()
            .route("/boom", get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "kaput") }))
            .route("/created", get(|| async { (AxumStatus::CREATED, "{}") }))
            .route("/garbage", get(|| async { "not json" }));
        let base = spawn_server(router).await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let err = http
            .get_json::<JsonValue>(&format!("{base}/boom"), &[], HeaderMap::new())
            .await
            .expect_err("500");
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("kaput"));

        let err = http
            .get_json::<JsonValue>(&format!("{base}/created"), &[], HeaderMap::new())
            .await
            .expect_err("201 is not 200");
        assert_eq!(err.status(), Some(201));

        let err = http
            .get_json::<JsonValue>(&format!("{base}/garbage"), &[], HeaderMap::new())
            .await
            .expect_err("decode");
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[derive(Default)]
    struct Captured {
        requests: Mutex<Vec<(HashMap<String, String>, AxumHeaders, JsonValue)>>,
    }

    #[tokio::test]
    async fn postgrest_sink_posts_collapsed_batch_with_upsert_headers() {
        async fn capture(
            State(captured): State<Arc<Captured>>,
            Query(q): Query<HashMap<String, String>>,
            headers: AxumHeaders,
            Json(body): Json<JsonValue>,
        ) -> AxumStatus {
            captured.requests.lock().await.push((q, headers, body));
            AxumStatus::CREATED
        }
        let captured = Arc::new(Captured::default());
        let router = Router::new()
            .route("/rest/v1/candidates", post(capture))
            .with_state(captured.clone());
        let base = spawn_server(router).await;

        let sink = PostgrestSink::new(&format!("{base}/"), "service-key").expect("sink");
        sink.upsert(
            "candidates",
            &[row("a", "Ana"), row("a", "Anabel"), row("b", "Ben")],
            CONFLICT_KEY,
        )
        .await
        .expect("upsert");

        let requests = captured.requests.lock().await;
        assert_eq!(requests.len(), 1);
        let (query, headers, body) = &requests[0];
        assert_eq!(query.get("on_conflict").map(String::as_str), Some("merge_id"));
        assert_eq!(headers["apikey"], "service-key");
        assert_eq!(headers["authorization"], "Bearer service-key");
        assert_eq!(headers["prefer"], "resolution=merge-duplicates,return=minimal");
        let rows = body.as_array().expect("array body");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["first_name"], json!("Anabel"));
        assert_eq!(rows[0]["field_mappings_json"], json!("{}"));
    }

    #[tokio::test]
    async fn postgrest_sink_surfaces_error_status() {
        let router = Router::new().route(
            "/rest/v1/candidates",
            post(|| async { (AxumStatus::CONFLICT, "duplicate key") }),
        );
        let base = spawn_server(router).await;
        let sink = PostgrestSink::new(&base, "k").expect("sink");

        let err = sink
            .upsert("candidates", &[row("a", "Ana")], CONFLICT_KEY)
            .await
            .expect_err("409");
        match err {
            SinkError::HttpStatus { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "duplicate key");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn fetch_timeout_defaults_to_thirty_seconds() {
        assert_eq!(HttpClientConfig::default().timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn fetcher_gives_up_on_slow_remote() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"results": []}))
            }),
        );
        let base = spawn_server(router).await;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            user_agent: None,
        })
        .expect("client");

        let err = http
            .get_json::<JsonValue>(&format!("{base}/slow"), &[], HeaderMap::new())
            .await
            .expect_err("timeout");
        match err {
            FetchError::Request(inner) => assert!(inner.is_timeout(), "{inner:?}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn postgrest_sink_waits_out_slow_commits() {
        let router = Router::new().route(
            "/rest/v1/candidates",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                AxumStatus::CREATED
            }),
        );
        let base = spawn_server(router).await;

        // Same endpoint is too slow for a fetcher with a short timeout.
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(500),
            user_agent: None,
        })
        .expect("client");
        assert!(http
            .post_json::<_, JsonValue>(&format!("{base}/rest/v1/candidates"), &json!([]), HeaderMap::new())
            .await
            .is_err());

        let sink = PostgrestSink::new(&base, "k").expect("sink");
        sink.upsert("candidates", &[row("a", "Ana")], CONFLICT_KEY)
            .await
            .expect("slow upsert still succeeds");
    }
}
