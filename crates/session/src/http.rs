//! Backend HTTP client: authentication, session negotiation, page upload
//! and finalization, with a bounded retry policy per request.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use kollect_core::{Config, ResourceKind};
use kollect_redact::{RedactError, RedactionEngine};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Marker header telling the backend the body already went through the
/// redaction gate.
pub const REDACTED_HEADER: &str = "x-kollect-redacted";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("the backend is not ready to accept a fetching cycle")]
    NotReady,
    #[error("the integration is suspended; contact support to restore it")]
    Suspended,
    #[error("another cluster already uses this configuration; contact support to repair the integration")]
    DuplicateClusterId,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {body:?}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ApiError>,
    },
    #[error("login did not return a usable bearer token")]
    InvalidToken,
    #[error("redacting page body: {0}")]
    Redaction(#[from] RedactError),
    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("compressing request body: {0}")]
    Compress(#[from] std::io::Error),
    #[error("failed to acquire an upload slot")]
    Admission(#[from] tokio::sync::AcquireError),
    #[error("upload task aborted: {0}")]
    TaskFailed(String),
}

/// Typed parse of the negotiation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub integration_id: String,
    pub send_trees: bool,
}

/// The backend carries `integrationId[,sendTreesBool]` as one comma-joined
/// string (sometimes JSON-quoted). The tree flag defaults to true when
/// absent or unparseable.
pub fn parse_negotiation(raw: &str) -> Negotiation {
    let trimmed = raw.trim().trim_matches('"');
    let mut parts = trimmed.splitn(2, ',');
    let integration_id = parts.next().unwrap_or_default().trim().to_string();
    let send_trees = parts
        .next()
        .map(|flag| flag.trim().parse::<bool>().unwrap_or(true))
        .unwrap_or(true);
    Negotiation { integration_id, send_trees }
}

/// Endpoint family for one page upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRoute {
    Objects,
    Helm,
    Tree,
}

impl UploadRoute {
    pub fn path(&self, cluster_id: &str) -> String {
        match self {
            UploadRoute::Objects => format!("/integrations/k8s/{cluster_id}/fetching/objects"),
            UploadRoute::Helm => format!("/integrations/k8s/{cluster_id}/fetching/helm"),
            UploadRoute::Tree => format!("/integrations/k8s/{cluster_id}/fetching/tree"),
        }
    }
}

/// One outbound page request, fully assembled by the uploader.
#[derive(Debug, Clone)]
pub struct PageUpload {
    pub kind: ResourceKind,
    pub route: UploadRoute,
    pub integration_id: String,
    pub body: serde_json::Value,
}

/// The session's view of the backend. `ApiClient` is the production
/// implementation; tests drive the session through an in-memory fake.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn negotiate(
        &self,
        unique_cluster_id: &str,
        fetching_id: &str,
        override_unique_cluster_id: bool,
    ) -> Result<Negotiation, ApiError>;

    async fn send_page(&self, page: &PageUpload) -> Result<(), ApiError>;

    async fn lock(&self, fetching_id: &str, integration_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
struct Credentials {
    access_token: String,
}

/// Authenticated client for the ingestion backend. Shared read-only across
/// all concurrent upload tasks.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    cluster_id: String,
    max_retries: u32,
    redactor: Arc<RedactionEngine>,
}

impl ApiClient {
    /// Exchange the long-lived access/secret keys for a bearer token and
    /// build the outbound client (timeout, gzip, auth header, user agent).
    pub async fn connect(
        conf: &Config,
        cluster_id: &str,
        redactor: Arc<RedactionEngine>,
    ) -> Result<ApiClient, ApiError> {
        let login = reqwest::Client::builder().timeout(conf.page_timeout).build()?;
        let response = login
            .post(format!("{}/account/access_keys/login", conf.login_endpoint))
            .json(&serde_json::json!({
                "accessKey": conf.access_key,
                "secretKey": conf.secret_key,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let credentials: Credentials = response.json().await?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.access_token))
            .map_err(|_| ApiError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .timeout(conf.page_timeout)
            .gzip(true)
            .default_headers(headers)
            .user_agent(concat!("kollect v", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(ApiClient {
            http,
            base: conf.api_endpoint.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.to_string(),
            max_retries: conf.max_retries,
            redactor,
        })
    }

    /// Send a request until it is accepted, a non-retryable error shows up,
    /// or the retry ceiling is hit. Returns the response body text.
    async fn send_with_retry<F>(
        &self,
        label: &str,
        mut make: F,
        accept: &[StatusCode],
        classify: fn(u16, String) -> ApiError,
    ) -> Result<String, ApiError>
    where
        F: FnMut(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match make(&self.http).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if accept.contains(&status) {
                        return Ok(body);
                    }
                    classify(status.as_u16(), body)
                }
                Err(err) => ApiError::Transport(err),
            };
            if !is_retryable(&err) {
                return Err(err);
            }
            if attempt > self.max_retries {
                return Err(ApiError::RetriesExhausted { attempts: attempt, last: Box::new(err) });
            }
            let delay = RETRY_BASE_DELAY * (1u32 << (attempt - 1).min(6));
            warn!(request = label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(err: &ApiError) -> bool {
    match err {
        ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        ApiError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

/// Upload/finalize requests: only 425 has a dedicated meaning.
fn default_classify(status: u16, body: String) -> ApiError {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::TOO_EARLY) => ApiError::NotReady,
        _ => ApiError::UnexpectedStatus { status, body },
    }
}

/// Negotiation distinguishes the three soft-skip states by status code.
fn negotiation_classify(status: u16, body: String) -> ApiError {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::TOO_EARLY) => ApiError::NotReady,
        Ok(StatusCode::PAYMENT_REQUIRED) => ApiError::Suspended,
        Ok(StatusCode::CONFLICT) => ApiError::DuplicateClusterId,
        _ => ApiError::UnexpectedStatus { status, body },
    }
}

fn gzip_body(bytes: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[async_trait::async_trait]
impl Backend for ApiClient {
    async fn negotiate(
        &self,
        unique_cluster_id: &str,
        fetching_id: &str,
        override_unique_cluster_id: bool,
    ) -> Result<Negotiation, ApiError> {
        let url = format!("{}/integrations/k8s/{}/fetching", self.base, self.cluster_id);
        let mut query: Vec<(&str, &str)> = vec![
            ("clusterUniqueId", unique_cluster_id),
            ("fetchingId", fetching_id),
            ("getIntegrationId", "true"),
        ];
        if override_unique_cluster_id {
            query.push(("overrideUniqueClusterId", "1"));
        }

        // Older backends answer 204 with no body; treated as success with
        // an empty integration id.
        let body = self
            .send_with_retry(
                "negotiation",
                |http| http.get(&url).query(&query),
                &[StatusCode::OK, StatusCode::NO_CONTENT],
                negotiation_classify,
            )
            .await?;
        let negotiation = parse_negotiation(&body);
        debug!(
            integration = %negotiation.integration_id,
            send_trees = negotiation.send_trees,
            "negotiation response parsed"
        );
        Ok(negotiation)
    }

    async fn send_page(&self, page: &PageUpload) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(&page.body)?;
        let redacted = self.redactor.redact(&raw)?;
        let compressed = gzip_body(&redacted)?;
        let url = format!("{}{}", self.base, page.route.path(&self.cluster_id));

        self.send_with_retry(
            "page upload",
            |http| {
                http.post(&url)
                    .query(&[("integrationId", page.integration_id.as_str())])
                    .header(REDACTED_HEADER, "true")
                    .header(CONTENT_TYPE, "application/json")
                    .header(CONTENT_ENCODING, "gzip")
                    .body(compressed.clone())
            },
            &[StatusCode::NO_CONTENT],
            default_classify,
        )
        .await?;
        Ok(())
    }

    async fn lock(&self, fetching_id: &str, integration_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/integrations/k8s/{}/fetching", self.base, self.cluster_id);
        let body = serde_json::json!({
            "fetchingId": fetching_id,
            "clusterId": self.cluster_id,
        });
        self.send_with_retry(
            "lock",
            |http| http.patch(&url).query(&[("integrationId", integration_id)]).json(&body),
            &[StatusCode::NO_CONTENT],
            default_classify,
        )
        .await?;
        info!(cluster = %self.cluster_id, fetching = %fetching_id, "lock accepted");
        Ok(())
    }
}
