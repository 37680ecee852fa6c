//! Signed, tagged data items for the archive network.
//!
//! Items use the ANS-104 binary layout with an Ed25519 owner:
//!
//! ```text
//! ┌──────────┬───────────┬───────┬────────┬────────┬─────────┬───────────┬──────┬──────┐
//! │ sig type │ signature │ owner │ target │ anchor │ # tags  │ tag bytes │ tags │ data │
//! │ u16 LE   │ 64 B      │ 32 B  │ 1(+32) │ 1(+32) │ u64 LE  │ u64 LE    │ avro │      │
//! └──────────┴───────────┴───────┴────────┴────────┴─────────┴───────────┴──────┴──────┘
//! ```
//!
//! The signature covers the SHA-384 deep hash of the item fields and the item
//! id is the base64url SHA-256 of the signature.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha384};
use thiserror::Error;

/// ANS-104 signature type for Ed25519 owners.
pub const SIGNATURE_TYPE_ED25519: u16 = 2;

const SIGNATURE_LEN: usize = 64;
const OWNER_LEN: usize = 32;
const TARGET_LEN: usize = 32;
const ANCHOR_LEN: usize = 32;
const MAX_TAGS: usize = 128;
const MAX_TAG_NAME_BYTES: usize = 1024;
const MAX_TAG_VALUE_BYTES: usize = 3072;

/// Errors raised while building, signing or parsing a data item
#[derive(Error, Debug)]
pub enum DataItemError {
    #[error("data item truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported signature type {0}")]
    UnsupportedSignatureType(u16),

    #[error("malformed tags: {0}")]
    MalformedTags(String),

    #[error("tag limits exceeded: {0}")]
    TagLimit(String),

    #[error("invalid signer key: {0}")]
    InvalidSignerKey(String),

    #[error("signature verification failed")]
    InvalidSignature,
}

/// A name/value tag attached to a data item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Long-lived service identity used to sign every uploaded item
pub struct ItemSigner {
    key: SigningKey,
}

impl ItemSigner {
    /// Build a signer from a raw 32-byte Ed25519 seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Build a signer from a base64-encoded 32-byte seed
    pub fn from_base64(encoded: &str) -> Result<Self, DataItemError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| DataItemError::InvalidSignerKey(e.to_string()))?;
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            DataItemError::InvalidSignerKey(format!("expected 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::from_seed(&seed))
    }

    /// Public key carried as the item owner
    pub fn public_key(&self) -> [u8; OWNER_LEN] {
        self.key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for ItemSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemSigner")
            .field("owner", &URL_SAFE_NO_PAD.encode(self.public_key()))
            .finish()
    }
}

/// A signed data item ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    signature: [u8; SIGNATURE_LEN],
    owner: [u8; OWNER_LEN],
    target: Option<[u8; TARGET_LEN]>,
    anchor: Option<[u8; ANCHOR_LEN]>,
    tags: Vec<Tag>,
    raw_tags: Vec<u8>,
    data: Vec<u8>,
}

impl DataItem {
    /// Sign `data` and `tags` with the service identity
    pub fn sign(signer: &ItemSigner, tags: Vec<Tag>, data: Vec<u8>) -> Result<Self, DataItemError> {
        validate_tags(&tags)?;
        let raw_tags = encode_tags(&tags);
        let owner = signer.public_key();
        let message = signature_message(&owner, None, None, &raw_tags, &data);
        let signature = signer.key.sign(&message).to_bytes();

        Ok(Self {
            signature,
            owner,
            target: None,
            anchor: None,
            tags,
            raw_tags,
            data,
        })
    }

    /// Content identifier assigned by the archive network
    pub fn id(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.signature))
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// First tag value with the given name
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn owner(&self) -> &[u8; OWNER_LEN] {
        &self.owner
    }

    /// Check the signature against the owner key
    pub fn verify(&self) -> Result<(), DataItemError> {
        let key =
            VerifyingKey::from_bytes(&self.owner).map_err(|_| DataItemError::InvalidSignature)?;
        let signature = Signature::from_bytes(&self.signature);
        let message = signature_message(
            &self.owner,
            self.target.as_ref(),
            self.anchor.as_ref(),
            &self.raw_tags,
            &self.data,
        );
        key.verify(&message, &signature)
            .map_err(|_| DataItemError::InvalidSignature)
    }

    /// Serialize to the upload wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + SIGNATURE_LEN + OWNER_LEN + 2 + 16 + self.raw_tags.len() + self.data.len() + 64,
        );
        out.extend_from_slice(&SIGNATURE_TYPE_ED25519.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.owner);
        push_optional(&mut out, self.target.as_ref());
        push_optional(&mut out, self.anchor.as_ref());
        out.extend_from_slice(&(self.tags.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.raw_tags.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.raw_tags);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse an item previously produced by [`DataItem::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DataItemError> {
        let mut reader = ByteReader::new(bytes);

        let sig_type = u16::from_le_bytes(reader.array::<2>("signature type")?);
        if sig_type != SIGNATURE_TYPE_ED25519 {
            return Err(DataItemError::UnsupportedSignatureType(sig_type));
        }
        let signature = reader.array::<SIGNATURE_LEN>("signature")?;
        let owner = reader.array::<OWNER_LEN>("owner")?;
        let target = reader.optional::<TARGET_LEN>("target")?;
        let anchor = reader.optional::<ANCHOR_LEN>("anchor")?;
        let tag_count = u64::from_le_bytes(reader.array::<8>("tag count")?);
        let tag_bytes_len = u64::from_le_bytes(reader.array::<8>("tag length")?);
        let tag_bytes_len = usize::try_from(tag_bytes_len)
            .map_err(|_| DataItemError::MalformedTags("tag length overflows".to_string()))?;
        let raw_tags = reader.take(tag_bytes_len, "tags")?.to_vec();
        let tags = decode_tags(&raw_tags)?;
        if tags.len() as u64 != tag_count {
            return Err(DataItemError::MalformedTags(format!(
                "header declares {tag_count} tags, found {}",
                tags.len()
            )));
        }
        let data = reader.rest().to_vec();

        Ok(Self {
            signature,
            owner,
            target,
            anchor,
            tags,
            raw_tags,
            data,
        })
    }
}

fn push_optional<const N: usize>(out: &mut Vec<u8>, value: Option<&[u8; N]>) {
    match value {
        Some(bytes) => {
            out.push(1);
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }
}

fn validate_tags(tags: &[Tag]) -> Result<(), DataItemError> {
    if tags.len() > MAX_TAGS {
        return Err(DataItemError::TagLimit(format!(
            "{} tags, at most {MAX_TAGS} allowed",
            tags.len()
        )));
    }
    for tag in tags {
        if tag.name.is_empty() || tag.name.len() > MAX_TAG_NAME_BYTES {
            return Err(DataItemError::TagLimit(format!(
                "tag name must be 1..={MAX_TAG_NAME_BYTES} bytes: {:?}",
                tag.name
            )));
        }
        if tag.value.is_empty() || tag.value.len() > MAX_TAG_VALUE_BYTES {
            return Err(DataItemError::TagLimit(format!(
                "value of tag {:?} must be 1..={MAX_TAG_VALUE_BYTES} bytes",
                tag.name
            )));
        }
    }
    Ok(())
}

fn signature_message(
    owner: &[u8],
    target: Option<&[u8; TARGET_LEN]>,
    anchor: Option<&[u8; ANCHOR_LEN]>,
    raw_tags: &[u8],
    data: &[u8],
) -> [u8; 48] {
    let sig_type = SIGNATURE_TYPE_ED25519.to_string();
    deep_hash_list(&[
        b"dataitem",
        b"1",
        sig_type.as_bytes(),
        owner,
        target.map_or(&[][..], |t| &t[..]),
        anchor.map_or(&[][..], |a| &a[..]),
        raw_tags,
        data,
    ])
}

fn sha384(parts: &[&[u8]]) -> [u8; 48] {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 48];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn deep_hash_blob(data: &[u8]) -> [u8; 48] {
    let tag = sha384(&[b"blob", data.len().to_string().as_bytes()]);
    let body = sha384(&[data]);
    sha384(&[&tag, &body])
}

fn deep_hash_list(items: &[&[u8]]) -> [u8; 48] {
    let mut acc = sha384(&[b"list", items.len().to_string().as_bytes()]);
    for item in items {
        acc = sha384(&[&acc, &deep_hash_blob(item)]);
    }
    acc
}

// Tags are an Avro array of { name: bytes, value: bytes } records. An item
// without tags carries zero tag bytes rather than an empty Avro array.

fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    let mut out = Vec::new();
    if tags.is_empty() {
        return out;
    }
    write_long(&mut out, tags.len() as i64);
    for tag in tags {
        write_bytes(&mut out, tag.name.as_bytes());
        write_bytes(&mut out, tag.value.as_bytes());
    }
    write_long(&mut out, 0);
    out
}

fn decode_tags(raw: &[u8]) -> Result<Vec<Tag>, DataItemError> {
    let mut tags = Vec::new();
    if raw.is_empty() {
        return Ok(tags);
    }

    let mut pos = 0;
    loop {
        let mut count = read_long(raw, &mut pos)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // Negative block counts are followed by the block byte size.
            count = -count;
            read_long(raw, &mut pos)?;
        }
        for _ in 0..count {
            let name = read_string(raw, &mut pos)?;
            let value = read_string(raw, &mut pos)?;
            tags.push(Tag { name, value });
        }
    }

    if pos != raw.len() {
        return Err(DataItemError::MalformedTags(format!(
            "{} trailing bytes after tag array",
            raw.len() - pos
        )));
    }
    Ok(tags)
}

fn write_long(out: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n & !0x7f != 0 {
        out.push(((n & 0x7f) | 0x80) as u8);
        n >>= 7;
    }
    out.push(n as u8);
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_long(out, bytes.len() as i64);
    out.extend_from_slice(bytes);
}

fn read_long(buf: &[u8], pos: &mut usize) -> Result<i64, DataItemError> {
    let mut n: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| DataItemError::MalformedTags("truncated varint".to_string()))?;
        *pos += 1;
        if shift > 63 {
            return Err(DataItemError::MalformedTags("varint overflow".to_string()));
        }
        n |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(((n >> 1) as i64) ^ -((n & 1) as i64))
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, DataItemError> {
    let len = read_long(buf, pos)?;
    let len = usize::try_from(len)
        .map_err(|_| DataItemError::MalformedTags(format!("negative length {len}")))?;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| DataItemError::MalformedTags("tag field overruns buffer".to_string()))?;
    let value = String::from_utf8(buf[*pos..end].to_vec())
        .map_err(|e| DataItemError::MalformedTags(e.to_string()))?;
    *pos = end;
    Ok(value)
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DataItemError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DataItemError::Truncated(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DataItemError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn optional<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> Result<Option<[u8; N]>, DataItemError> {
        match self.take(1, what)?[0] {
            0 => Ok(None),
            _ => Ok(Some(self.array::<N>(what)?)),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}
