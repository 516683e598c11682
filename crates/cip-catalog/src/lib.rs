//! Rate-limited client for the external catalog search/detail API.

mod formats;
mod pacing;

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub use formats::FormatFilter;
pub use pacing::{
    classify_reqwest_error, classify_status, BackoffPolicy, PacerPermit, RequestPacer,
    RetryDisposition,
};

pub const CRATE_NAME: &str = "cip-catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog returned http {status} for {url}")]
    Status {
        status: u16,
        url: String,
        retryable: bool,
    },
    #[error("catalog request failed: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
        retryable: bool,
    },
    #[error("malformed catalog response: {0}")]
    Malformed(String),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Status { retryable, .. } | CatalogError::Transport { retryable, .. } => {
                *retryable
            }
            CatalogError::Malformed(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CatalogError::Status { status, .. } => Some(*status),
            CatalogError::Transport { .. } | CatalogError::Malformed(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    fn from_transport(source: reqwest::Error) -> Self {
        let retryable = classify_reqwest_error(&source) == RetryDisposition::Retryable;
        CatalogError::Transport { source, retryable }
    }
}

/// Catalog identifiers arrive as JSON numbers or strings; both become strings.
fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    struct IdVisitor;

    impl<'de> de::Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a numeric or string identifier")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            if v.trim().is_empty() {
                return Err(E::custom("empty identifier"));
            }
            Ok(v.trim().to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

fn deserialize_opt_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "deserialize_id")] String);

    let value = Option::<Wrapped>::deserialize(deserializer)?;
    Ok(value.map(|w| w.0).filter(|id| id != "0"))
}

/// Years show up as `1999`, `"1999"`, `""` or `0` depending on the endpoint.
fn deserialize_year<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawYear {
        Number(i64),
        Text(String),
    }

    let year = match Option::<RawYear>::deserialize(deserializer)? {
        Some(RawYear::Number(n)) => i32::try_from(n).ok(),
        Some(RawYear::Text(s)) => s.trim().parse::<i32>().ok(),
        None => None,
    };
    Ok(year.filter(|y| *y > 0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    #[default]
    Release,
    /// Grouping record that must be resolved to a concrete release.
    Master,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ResultKind,
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_year")]
    pub year: Option<i32>,
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub master_id: Option<String>,
}

impl RawResult {
    pub fn is_aggregate(&self) -> bool {
        self.kind == ResultKind::Master
    }

    /// Splits the catalog's `"Artist - Title"` convention.
    pub fn artist_and_title(&self) -> (Option<&str>, &str) {
        match self.title.split_once(" - ") {
            Some((artist, title)) => (Some(artist.trim()), title.trim()),
            None => (None, self.title.trim()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCredit {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub name: String,
    #[serde(default)]
    pub descriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub position: String,
    pub title: String,
    #[serde(default)]
    pub duration: String,
}

/// Full metadata for one concrete catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDetail {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artists: Vec<ArtistCredit>,
    #[serde(default, deserialize_with = "deserialize_year")]
    pub year: Option<i32>,
    #[serde(default)]
    pub formats: Vec<FormatDescriptor>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub tracklist: Vec<Track>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RawDetail {
    pub fn artist_names(&self) -> Vec<String> {
        self.artists.iter().map(|a| a.name.clone()).collect()
    }

    pub fn format_tokens(&self) -> Vec<String> {
        self.formats
            .iter()
            .flat_map(|f| std::iter::once(f.name.clone()).chain(f.descriptions.iter().cloned()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct AggregateRecord {
    #[serde(
        default,
        rename = "primaryId",
        alias = "main_release",
        alias = "primary_id",
        deserialize_with = "deserialize_opt_id"
    )]
    primary_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
    pub query: String,
    pub kind: Option<String>,
    pub formats: Vec<String>,
    pub per_page: u32,
}

impl SearchQuery {
    pub fn for_name(name: impl Into<String>) -> Self {
        Self {
            query: name.into(),
            kind: None,
            formats: Vec::new(),
            per_page: 25,
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("q", self.query.clone())];
        if let Some(kind) = &self.kind {
            params.push(("type", kind.clone()));
        }
        for format in &self.formats {
            params.push(("format", format.clone()));
        }
        if self.per_page > 0 {
            params.push(("per_page", self.per_page.to_string()));
        }
        params
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawResult>, CatalogError>;

    async fn fetch_detail(&self, id: &str) -> Result<RawDetail, CatalogError>;

    /// Resolves an aggregate ("master") identifier to its concrete primary item id.
    async fn resolve_aggregate(&self, aggregate_id: &str) -> Result<String, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct CatalogClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for CatalogClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.discogs.com".to_string(),
            auth_token: None,
            user_agent: None,
            timeout: Duration::from_secs(20),
            request_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: Option<HeaderValue>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpCatalogClient {
    pub fn new(config: CatalogClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let auth_header = config
            .auth_token
            .as_deref()
            .map(|token| HeaderValue::from_str(&format!("Discogs token={token}")))
            .transpose()
            .context("building catalog authorization header")?;

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header,
            pacer: RequestPacer::new(config.request_interval),
            backoff: config.backoff,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&'static str, String)],
    ) -> Result<T, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0usize;

        loop {
            match self.send_once(&url, params).await {
                Ok(body) => {
                    return serde_json::from_slice(&body)
                        .map_err(|e| CatalogError::Malformed(format!("{url}: {e}")));
                }
                Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(url = %url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying catalog request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<Vec<u8>, CatalogError> {
        let _permit = self.pacer.acquire().await;
        let span = info_span!("catalog_request", url);

        async {
            let mut request = self.client.get(url).query(params);
            if let Some(auth) = &self.auth_header {
                request = request.header(AUTHORIZATION, auth.clone());
            }

            let response = request.send().await.map_err(CatalogError::from_transport)?;
            let status = response.status();
            debug!(status = status.as_u16(), "catalog response");

            if !status.is_success() {
                return Err(CatalogError::Status {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                    retryable: classify_status(status) == RetryDisposition::Retryable,
                });
            }

            let body = response.bytes().await.map_err(CatalogError::from_transport)?;
            Ok(body.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawResult>, CatalogError> {
        let response: SearchResponse = self.get_json("/database/search", &query.params()).await?;
        Ok(response.results)
    }

    async fn fetch_detail(&self, id: &str) -> Result<RawDetail, CatalogError> {
        let detail: RawDetail = self.get_json(&format!("/releases/{id}"), &[]).await?;
        if detail.title.trim().is_empty() {
            return Err(CatalogError::Malformed(format!("release {id} has no title")));
        }
        Ok(detail)
    }

    async fn resolve_aggregate(&self, aggregate_id: &str) -> Result<String, CatalogError> {
        let record: AggregateRecord = self
            .get_json(&format!("/masters/{aggregate_id}"), &[])
            .await?;
        record.primary_id.ok_or_else(|| {
            CatalogError::Malformed(format!("master {aggregate_id} has no primary release"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Hits {
        flaky: AtomicUsize,
        down: AtomicUsize,
    }

    async fn search(Query(params): Query<Vec<(String, String)>>) -> Json<serde_json::Value> {
        let q = params
            .iter()
            .find(|(k, _)| k == "q")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        Json(json!({
            "results": [
                {"id": 101, "type": "release", "title": format!("{q} - First"), "year": "1999", "format": ["Vinyl", "LP"]},
                {"id": "7", "type": "master", "title": format!("{q} - Grouped"), "year": 2001, "master_id": 7},
                {"id": 5, "type": "artist", "title": q}
            ]
        }))
    }

    async fn release(State(hits): State<Arc<Hits>>, Path(id): Path<String>) -> Response {
        match id.as_str() {
            "404" => StatusCode::NOT_FOUND.into_response(),
            "garbled" => "<html>not json</html>".into_response(),
            "untitled" => Json(json!({"id": 9, "title": ""})).into_response(),
            "flaky" => {
                if hits.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::TOO_MANY_REQUESTS.into_response()
                } else {
                    Json(json!({"id": "flaky", "title": "Recovered"})).into_response()
                }
            }
            "down" => {
                hits.down.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
            _ => Json(json!({
                "id": id.parse::<u64>().unwrap_or(1),
                "title": "Selected Ambient Works",
                "artists": [{"name": "Aphex Twin"}],
                "year": 1992,
                "formats": [{"name": "Vinyl", "descriptions": ["LP", "Album"]}],
                "genres": ["Electronic"],
                "tracklist": [{"position": "A1", "title": "Xtal", "duration": "4:51"}]
            }))
            .into_response(),
        }
    }

    async fn master(Path(id): Path<String>) -> Response {
        match id.as_str() {
            "orphan" => Json(json!({"id": 3})).into_response(),
            _ => Json(json!({"id": id, "main_release": 4242})).into_response(),
        }
    }

    async fn spawn_catalog(hits: Arc<Hits>) -> String {
        let router = Router::new()
            .route("/database/search", get(search))
            .route("/releases/{id}", get(release))
            .route("/masters/{id}", get(master))
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: String, interval: Duration) -> HttpCatalogClient {
        HttpCatalogClient::new(CatalogClientConfig {
            base_url,
            auth_token: Some("secret".into()),
            user_agent: Some("cip-test/0.1".into()),
            timeout: Duration::from_secs(5),
            request_interval: interval,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        })
        .expect("client")
    }

    #[tokio::test]
    async fn search_parses_mixed_id_and_year_shapes() {
        let base = spawn_catalog(Arc::default()).await;
        let client = client_for(base, Duration::from_millis(1));

        let results = client
            .search(&SearchQuery::for_name("Boards of Canada"))
            .await
            .expect("search");

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "101");
        assert_eq!(results[0].year, Some(1999));
        assert_eq!(
            results[0].artist_and_title(),
            (Some("Boards of Canada"), "First")
        );
        assert!(results[1].is_aggregate());
        assert_eq!(results[1].master_id.as_deref(), Some("7"));
        assert_eq!(results[2].kind, ResultKind::Other);
    }

    #[tokio::test]
    async fn detail_and_aggregate_resolution() {
        let base = spawn_catalog(Arc::default()).await;
        let client = client_for(base, Duration::from_millis(1));

        let detail = client.fetch_detail("55").await.expect("detail");
        assert_eq!(detail.id, "55");
        assert_eq!(detail.artist_names(), vec!["Aphex Twin".to_string()]);
        assert_eq!(detail.format_tokens(), vec!["Vinyl", "LP", "Album"]);

        assert_eq!(client.resolve_aggregate("7").await.expect("resolve"), "4242");
        let err = client.resolve_aggregate("orphan").await.unwrap_err();
        assert!(matches!(err, CatalogError::Malformed(_)));
    }

    #[tokio::test]
    async fn not_found_is_permanent_and_garbage_is_malformed() {
        let base = spawn_catalog(Arc::default()).await;
        let client = client_for(base, Duration::from_millis(1));

        let err = client.fetch_detail("404").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = client.fetch_detail("garbled").await.unwrap_err();
        assert!(matches!(err, CatalogError::Malformed(_)));
        assert!(!err.is_retryable());

        let err = client.fetch_detail("untitled").await.unwrap_err();
        assert!(matches!(err, CatalogError::Malformed(_)));
    }

    #[tokio::test]
    async fn rate_limited_requests_are_retried_with_backoff() {
        let hits = Arc::new(Hits::default());
        let base = spawn_catalog(hits.clone()).await;
        let client = client_for(base, Duration::from_millis(1));

        let detail = client.fetch_detail("flaky").await.expect("eventually ok");
        assert_eq!(detail.title, "Recovered");
        assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_a_retryable_status() {
        let hits = Arc::new(Hits::default());
        let base = spawn_catalog(hits.clone()).await;
        let client = client_for(base, Duration::from_millis(1));

        let err = client.fetch_detail("down").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
        assert_eq!(hits.down.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_paces_every_call() {
        let base = spawn_catalog(Arc::default()).await;
        let client = client_for(base, Duration::from_millis(80));
        let started = std::time::Instant::now();

        let query = SearchQuery::for_name("x");
        let (a, b, c) = tokio::join!(
            client.fetch_detail("1"),
            client.resolve_aggregate("2"),
            client.search(&query),
        );
        a.expect("detail");
        b.expect("aggregate");
        c.expect("search");

        assert!(started.elapsed() >= Duration::from_millis(160));
    }
}
