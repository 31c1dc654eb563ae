//! JSON-over-HTTP plumbing and the destination table (Airtable) store.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use coprof_core::{DestinationLocation, DestinationRow, StoredRow};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "coprof-storage";

pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";

/// How a service expects its token to be presented.
#[derive(Clone, Default)]
pub enum ApiAuth {
    #[default]
    Anonymous,
    /// Token sent verbatim in a named header.
    Header { name: String, token: String },
    /// `Authorization: Bearer <token>`.
    Bearer(String),
}

impl fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAuth::Anonymous => f.write_str("Anonymous"),
            ApiAuth::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
            ApiAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth: ApiAuth,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            auth: ApiAuth::Anonymous,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid auth header: {0}")]
    InvalidAuth(String),
}

/// One service's HTTP client: a reqwest client plus the service's credentials.
/// Every call is a single attempt; there is no retry or rate limiting.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    auth: ApiAuth,
}

impl ApiClient {
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
            auth: config.auth,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let request = self.request(Method::GET, url)?.query(query);
        self.execute(Method::GET, url, request).await
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, url)?.json(body);
        self.execute(Method::POST, url, request).await
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, FetchError> {
        let builder = self.client.request(method, url);
        Ok(match &self.auth {
            ApiAuth::Anonymous => builder,
            ApiAuth::Header { name, token } => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| FetchError::InvalidAuth(e.to_string()))?;
                let mut value = HeaderValue::from_str(token)
                    .map_err(|e| FetchError::InvalidAuth(e.to_string()))?;
                value.set_sensitive(true);
                builder.header(name, value)
            }
            ApiAuth::Bearer(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| FetchError::InvalidAuth(e.to_string()))?;
                value.set_sensitive(true);
                builder.header(AUTHORIZATION, value)
            }
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_request", %method, url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading destination rows failed: {0}")]
    Read(#[source] FetchError),
    #[error("destination rejected the row (http {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("writing destination row failed: {0}")]
    Write(#[source] FetchError),
}

/// The destination table: read every row, create one row.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    fn location(&self) -> &DestinationLocation;

    async fn list_rows(&self) -> Result<Vec<StoredRow>, StoreError>;

    /// Column names are not validated locally; unknown columns come back as
    /// [`StoreError::Rejected`].
    async fn create_row(&self, row: &DestinationRow) -> Result<StoredRow, StoreError>;
}

#[derive(Debug, Deserialize)]
struct ListRecordsPage {
    #[serde(default)]
    records: Vec<StoredRow>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRecordBody<'a> {
    fields: &'a DestinationRow,
}

#[derive(Debug)]
pub struct AirtableStore {
    api: ApiClient,
    api_url: String,
    location: DestinationLocation,
}

impl AirtableStore {
    pub fn new(api: ApiClient, api_url: impl Into<String>, location: DestinationLocation) -> Self {
        Self {
            api,
            api_url: api_url.into(),
            location,
        }
    }

    pub fn table_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_url.trim_end_matches('/'),
            self.location.base_id,
            self.location.table_id
        )
    }
}

#[async_trait]
impl DestinationStore for AirtableStore {
    fn location(&self) -> &DestinationLocation {
        &self.location
    }

    async fn list_rows(&self) -> Result<Vec<StoredRow>, StoreError> {
        let url = self.table_url();
        let mut rows = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let page: ListRecordsPage = {
                let query: Vec<(&str, &str)> = offset
                    .as_deref()
                    .map(|cursor| vec![("offset", cursor)])
                    .unwrap_or_default();
                self.api
                    .get_json(&url, &query)
                    .await
                    .map_err(StoreError::Read)?
            };
            rows.extend(page.records);

            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }

        debug!(rows = rows.len(), table = %self.location.table_id, "destination rows loaded");
        Ok(rows)
    }

    async fn create_row(&self, row: &DestinationRow) -> Result<StoredRow, StoreError> {
        let url = self.table_url();
        self.api
            .post_json(&url, &CreateRecordBody { fields: row })
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, body, .. } => StoreError::Rejected {
                    status,
                    message: airtable_error_message(&body),
                },
                other => StoreError::Write(other),
            })
    }
}

/// Airtable reports errors as `{"error": {"type": .., "message": ..}}` or
/// `{"error": "TYPE"}`; anything else is returned as trimmed text.
pub fn airtable_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Structured {
            #[serde(rename = "type", default)]
            kind: Option<String>,
            #[serde(default)]
            message: Option<String>,
        },
        Code(String),
    }

    match serde_json::from_str::<ErrorBody>(body).map(|b| b.error) {
        Ok(ErrorDetail::Structured {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorDetail::Structured {
            kind: Some(kind), ..
        }) => kind,
        Ok(ErrorDetail::Code(code)) => code,
        _ => body.trim().to_string(),
    }
}
