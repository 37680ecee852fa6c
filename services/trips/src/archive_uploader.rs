use crate::config::ArchiveConfig;
use crate::data_item::{DataItem, DataItemError};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Read;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Largest item body accepted from the archive network on download.
const MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Errors raised while talking to the archive network
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive network request failed: {0}")]
    Transport(String),

    #[error("archive network rejected item with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to read archive network response: {0}")]
    Io(#[from] std::io::Error),

    #[error("downloaded item is malformed: {0}")]
    Malformed(#[from] DataItemError),

    #[error("downloaded item exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Upload acknowledgement returned by the archive network
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct UploadReceipt {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Destination for signed segment archives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Durably store `item`; no retry happens at this layer
    async fn upload(&self, item: &DataItem) -> Result<UploadReceipt, ArchiveError>;
}

/// HTTP client for the content-addressed archive network
pub struct ArchiveUploader {
    agent: ureq::Agent,
    base_url: String,
    currency: String,
}

impl ArchiveUploader {
    /// Create a new archive network client
    pub fn new(config: &ArchiveConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build();

        info!(
            url = %config.url,
            currency = %config.currency,
            "Archive uploader initialized"
        );

        Self {
            agent,
            base_url: config.url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
        }
    }

    /// Transaction endpoint items are posted to
    pub fn upload_url(&self) -> String {
        format!("{}/tx/{}", self.base_url, self.currency)
    }

    /// Download a previously uploaded item by id
    #[instrument(skip(self))]
    pub async fn fetch(&self, id: &str) -> Result<DataItem, ArchiveError> {
        let agent = self.agent.clone();
        let url = format!("{}/{}", self.base_url, id);

        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ArchiveError> {
            let response = agent.get(&url).call().map_err(map_ureq_error)?;
            read_capped(response.into_reader(), MAX_DOWNLOAD_BYTES)
        })
        .await
        .map_err(|e| ArchiveError::Transport(format!("download task aborted: {e}")))??;

        debug!(size_bytes = bytes.len(), "Archive item downloaded");
        Ok(DataItem::from_bytes(&bytes)?)
    }
}

#[async_trait]
impl ArchiveSink for ArchiveUploader {
    #[instrument(skip(self, item), fields(item_id = %item.id()))]
    async fn upload(&self, item: &DataItem) -> Result<UploadReceipt, ArchiveError> {
        let agent = self.agent.clone();
        let url = self.upload_url();
        let body = item.to_bytes();
        let size_bytes = body.len();
        let started = Instant::now();

        debug!(url = %url, size_bytes, "Uploading archive item");

        let response_body = tokio::task::spawn_blocking(move || -> Result<String, ArchiveError> {
            let response = agent
                .post(&url)
                .set("Content-Type", "application/octet-stream")
                .send_bytes(&body)
                .map_err(map_ureq_error)?;
            Ok(response.into_string()?)
        })
        .await
        .map_err(|e| ArchiveError::Transport(format!("upload task aborted: {e}")))??;

        metrics::histogram!("trips.archive.upload_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("trips.archive.bytes_uploaded").increment(size_bytes as u64);

        let receipt: UploadReceipt = serde_json::from_str(&response_body).unwrap_or_default();
        if !receipt.id.is_empty() && receipt.id != item.id() {
            warn!(
                receipt_id = %receipt.id,
                "Archive network acknowledged a different item id"
            );
        }

        info!(size_bytes, "Archive item uploaded");
        Ok(receipt)
    }
}

/// Read all of `reader`, failing once more than `limit` bytes arrive
fn read_capped(reader: impl Read, limit: u64) -> Result<Vec<u8>, ArchiveError> {
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Err(ArchiveError::TooLarge { limit });
    }
    Ok(body)
}

fn map_ureq_error(err: ureq::Error) -> ArchiveError {
    match err {
        ureq::Error::Status(status, response) => ArchiveError::Rejected {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => ArchiveError::Transport(transport.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(url: &str) -> ArchiveConfig {
        ArchiveConfig {
            url: url.to_string(),
            currency: "arweave".to_string(),
            signer_private_key: String::new(),
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_upload_url() {
        let uploader = ArchiveUploader::new(&config("https://node1.bundlr.network/"));
        assert_eq!(uploader.upload_url(), "https://node1.bundlr.network/tx/arweave");
    }

    #[test]
    fn test_receipt_parsing_is_lenient() {
        let receipt: UploadReceipt =
            serde_json::from_str(r#"{"id":"abc","timestamp":1692176400000}"#).unwrap();
        assert_eq!(receipt.id, "abc");
        assert_eq!(receipt.timestamp, Some(1692176400000));

        let partial: UploadReceipt = serde_json::from_str(r#"{"other":1}"#).unwrap();
        assert_eq!(partial, UploadReceipt::default());
    }

    #[test]
    fn test_download_size_cap() {
        let body = vec![9u8; 64];

        let read = read_capped(Cursor::new(body.clone()), 65).unwrap();
        assert_eq!(read, body);
        let read = read_capped(Cursor::new(body.clone()), 64).unwrap();
        assert_eq!(read.len(), 64);

        let err = read_capped(Cursor::new(body), 63).unwrap_err();
        assert!(matches!(err, ArchiveError::TooLarge { limit: 63 }));
    }
}
