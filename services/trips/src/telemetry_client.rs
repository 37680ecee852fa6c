use crate::config::{ElasticsearchConfig, TimestampFormat};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Field every telemetry document is sorted and range-filtered on
const TIMESTAMP_FIELD: &str = "data.timestamp";

/// Errors that can occur while reading telemetry from the search index
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("search request failed: {0}")]
    Transport(String),

    #[error("search index returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected search response: {0}")]
    Decode(String),

    #[error("full page ended with a hit that has no sort key")]
    MissingSortKey,

    #[error("failed to encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Executes one search request against an index
#[async_trait]
pub trait SearchTransport: Send + Sync {
    async fn search(&self, index: &str, body: &Value) -> Result<Value, TelemetryError>;
}

/// Source of the raw telemetry recorded during a segment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// JSON array of raw records for `device_id` within `[start, end]`,
    /// ascending by timestamp
    async fn fetch_range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<u8>, TelemetryError>;
}

/// Search transport over the index's HTTP `_search` endpoint
pub struct HttpSearchTransport {
    agent: ureq::Agent,
    base_url: String,
    authorization: Option<String>,
}

impl HttpSearchTransport {
    pub fn new(config: &ElasticsearchConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build();

        let authorization = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{user}:{password}"))
            )),
            _ => None,
        };

        Self {
            agent,
            base_url: config.url.trim_end_matches('/').to_string(),
            authorization,
        }
    }
}

#[async_trait]
impl SearchTransport for HttpSearchTransport {
    async fn search(&self, index: &str, body: &Value) -> Result<Value, TelemetryError> {
        let agent = self.agent.clone();
        let url = format!("{}/{}/_search", self.base_url, index);
        let authorization = self.authorization.clone();
        let body = body.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .post(&url)
                .set("Content-Type", "application/json")
                .set("Accept", "application/json");
            if let Some(ref auth) = authorization {
                request = request.set("Authorization", auth);
            }

            match request.send_json(body) {
                Ok(response) => response
                    .into_json::<Value>()
                    .map_err(|e| TelemetryError::Decode(e.to_string())),
                Err(ureq::Error::Status(status, response)) => Err(TelemetryError::Status {
                    status,
                    body: response.into_string().unwrap_or_default(),
                }),
                Err(ureq::Error::Transport(transport)) => {
                    Err(TelemetryError::Transport(transport.to_string()))
                }
            }
        })
        .await
        .map_err(|e| TelemetryError::Transport(format!("search task aborted: {e}")))?
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source", default)]
    source: Value,
    #[serde(default)]
    sort: Option<Vec<Value>>,
}

/// Paginated telemetry reader using search-after cursors
pub struct TelemetryClient {
    transport: Box<dyn SearchTransport>,
    index: String,
    page_size: usize,
    timestamp_format: TimestampFormat,
}

impl TelemetryClient {
    /// Create a client that talks HTTP to the configured cluster
    pub fn new(config: &ElasticsearchConfig) -> Self {
        info!(
            url = %config.url,
            index = %config.index,
            page_size = config.page_size,
            "Telemetry client initialized"
        );
        Self::with_transport(
            Box::new(HttpSearchTransport::new(config)),
            config.index.clone(),
            config.page_size,
            config.timestamp_format,
        )
    }

    pub fn with_transport(
        transport: Box<dyn SearchTransport>,
        index: impl Into<String>,
        page_size: usize,
        timestamp_format: TimestampFormat,
    ) -> Self {
        Self {
            transport,
            index: index.into(),
            page_size: page_size.max(1),
            timestamp_format,
        }
    }

    /// Build the query for one page
    pub fn query_body(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        search_after: Option<&[Value]>,
    ) -> Value {
        let (format, gte, lte) = match self.timestamp_format {
            TimestampFormat::Rfc3339 => (
                "strict_date_optional_time",
                json!(start.to_rfc3339_opts(SecondsFormat::Millis, true)),
                json!(end.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            TimestampFormat::EpochMillis => (
                "epoch_millis",
                json!(start.timestamp_millis()),
                json!(end.timestamp_millis()),
            ),
        };

        let mut body = json!({
            "sort": [{ TIMESTAMP_FIELD: "asc" }],
            "size": self.page_size,
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "subject": device_id } },
                        { "range": { TIMESTAMP_FIELD: { "format": format, "gte": gte, "lte": lte } } }
                    ]
                }
            }
        });

        if let Some(cursor) = search_after {
            body["search_after"] = Value::Array(cursor.to_vec());
        }

        body
    }

    /// All records in range, concatenated across pages in sort order
    #[instrument(skip(self), fields(index = %self.index))]
    pub async fn fetch_records(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>, TelemetryError> {
        let mut records = Vec::new();
        let mut cursor: Option<Vec<Value>> = None;
        let mut pages = 0usize;

        loop {
            let body = self.query_body(device_id, start, end, cursor.as_deref());
            let response = self.transport.search(&self.index, &body).await?;
            let page: SearchResponse = serde_json::from_value(response)
                .map_err(|e| TelemetryError::Decode(e.to_string()))?;
            pages += 1;

            let hits = page.hits.hits;
            let page_len = hits.len();
            let last_sort = hits.last().and_then(|h| h.sort.clone());
            records.extend(hits.into_iter().map(|h| h.source));

            debug!(page = pages, hits = page_len, "Fetched telemetry page");

            if page_len < self.page_size {
                break;
            }
            cursor = Some(last_sort.ok_or(TelemetryError::MissingSortKey)?);
        }

        debug!(records = records.len(), pages, "Telemetry range fetched");
        metrics::counter!("trips.telemetry.records").increment(records.len() as u64);

        Ok(records)
    }
}

#[async_trait]
impl TelemetrySource for TelemetryClient {
    async fn fetch_range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<u8>, TelemetryError> {
        let records = self.fetch_records(device_id, start, end).await?;
        Ok(serde_json::to_vec(&records)?)
    }
}
