//! Turns raw segment telemetry into an encrypted, signed archive item.
//!
//! compress (gzip, one named entry) → encrypt (AES-256-GCM, fresh nonce) →
//! tag + sign. Any failure aborts the whole package; nothing partial leaves
//! this module.

use crate::data_item::{DataItem, DataItemError, ItemSigner, Tag};
use crate::keys::SegmentKey;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::bufread::GzDecoder;
use flate2::{Compression, GzBuilder};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, instrument};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_TRIP_TYPE: &str = "Trip-Type";
pub const TAG_VEHICLE_TOKEN_ID: &str = "Vehicle-Token-ID";
pub const TAG_SEGMENT_ID: &str = "Segment-ID";
pub const TAG_START_TIME: &str = "Start-Time";
pub const TAG_END_TIME: &str = "End-Time";
pub const TAG_NONCE: &str = "Nonce";

/// Errors raised while packaging or unpacking a segment archive
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("archive item is missing a valid {TAG_NONCE} tag")]
    MissingNonce,

    #[error(transparent)]
    Item(#[from] DataItemError),
}

/// Identity and time range of the segment being archived
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentArchiveMeta {
    pub vehicle_token_id: i64,
    pub segment_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SegmentArchiveMeta {
    /// Name of the single entry inside the compressed container
    pub fn entry_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.json",
            self.vehicle_token_id,
            sanitize_name_component(&self.segment_id),
            self.start_time.timestamp(),
            self.end_time.timestamp()
        )
    }

    fn tags(&self, nonce: &[u8; NONCE_LEN]) -> Vec<Tag> {
        vec![
            Tag::new(TAG_CONTENT_TYPE, "application/gzip"),
            Tag::new(TAG_TRIP_TYPE, "segment"),
            Tag::new(TAG_VEHICLE_TOKEN_ID, self.vehicle_token_id.to_string()),
            Tag::new(TAG_SEGMENT_ID, self.segment_id.clone()),
            Tag::new(
                TAG_START_TIME,
                self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            Tag::new(
                TAG_END_TIME,
                self.end_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            Tag::new(TAG_NONCE, STANDARD.encode(nonce)),
        ]
    }
}

/// One named entry recovered from a compressed container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: Option<String>,
    pub data: Vec<u8>,
}

/// Packages segment telemetry with the service signing identity
#[derive(Debug)]
pub struct ArchivePackager {
    signer: ItemSigner,
}

impl ArchivePackager {
    pub fn new(signer: ItemSigner) -> Self {
        Self { signer }
    }

    /// Compress, encrypt and sign `raw` under `key`
    #[instrument(skip(self, raw, key), fields(segment_id = %meta.segment_id, raw_bytes = raw.len()))]
    pub fn package(
        &self,
        raw: &[u8],
        key: &SegmentKey,
        meta: &SegmentArchiveMeta,
    ) -> Result<DataItem, PackageError> {
        let compressed = compress(raw, &meta.entry_name())?;
        let nonce = generate_nonce();
        let ciphertext = encrypt(&compressed, key, &nonce)?;
        let item = DataItem::sign(&self.signer, meta.tags(&nonce), ciphertext)?;

        debug!(
            item_id = %item.id(),
            compressed_bytes = compressed.len(),
            "Segment archive packaged"
        );

        Ok(item)
    }
}

/// Verify, decrypt and decompress an archived item
pub fn unpack(item: &DataItem, key: &SegmentKey) -> Result<Vec<ArchiveEntry>, PackageError> {
    item.verify()?;
    let nonce = item_nonce(item)?;
    let compressed = decrypt(item.data(), key, &nonce)?;
    decompress(&compressed)
}

fn item_nonce(item: &DataItem) -> Result<[u8; NONCE_LEN], PackageError> {
    let encoded = item.tag(TAG_NONCE).ok_or(PackageError::MissingNonce)?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|_| PackageError::MissingNonce)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| PackageError::MissingNonce)
}

/// Fresh random nonce; never reused across segments
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Gzip `data` as a single entry named `entry_name`
pub fn compress(data: &[u8], entry_name: &str) -> Result<Vec<u8>, PackageError> {
    let mut encoder = GzBuilder::new()
        .filename(entry_name)
        .write(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(PackageError::Compression)?;
    encoder.finish().map_err(PackageError::Compression)
}

/// Expand every gzip member in `compressed`, in order
pub fn decompress(compressed: &[u8]) -> Result<Vec<ArchiveEntry>, PackageError> {
    let mut entries = Vec::new();
    let mut remaining = compressed;

    while !remaining.is_empty() {
        let mut decoder = GzDecoder::new(remaining);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(PackageError::Decompression)?;
        let name = decoder
            .header()
            .and_then(|h| h.filename())
            .map(|n| String::from_utf8_lossy(n).into_owned());
        entries.push(ArchiveEntry { name, data });

        let rest = decoder.into_inner();
        if rest.len() >= remaining.len() {
            return Err(PackageError::Decompression(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "gzip member consumed no input",
            )));
        }
        remaining = rest;
    }

    Ok(entries)
}

/// AES-256-GCM seal
pub fn encrypt(
    plaintext: &[u8],
    key: &SegmentKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>, PackageError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| PackageError::Encryption)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| PackageError::Encryption)
}

/// AES-256-GCM open
pub fn decrypt(
    ciphertext: &[u8],
    key: &SegmentKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>, PackageError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| PackageError::Decryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| PackageError::Decryption)
}

fn sanitize_name_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
