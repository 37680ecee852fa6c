//! Per-segment secret material.

use rand::rngs::OsRng;
use rand::RngCore;

/// Length of a segment encryption key (AES-256).
pub const SEGMENT_KEY_LEN: usize = 32;

/// A symmetric key that encrypts exactly one segment's telemetry bundle.
#[derive(Clone, PartialEq, Eq)]
pub struct SegmentKey([u8; SEGMENT_KEY_LEN]);

impl SegmentKey {
    pub fn from_bytes(bytes: [u8; SEGMENT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEGMENT_KEY_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<&[u8]> for SegmentKey {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(value.try_into()?))
    }
}

// Key bytes stay out of logs.
impl std::fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SegmentKey(..)")
    }
}

/// Source of fresh segment keys.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self) -> SegmentKey;
}

/// Draws keys from the operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyGenerator;

impl KeyGenerator for OsKeyGenerator {
    fn generate_key(&self) -> SegmentKey {
        let mut bytes = [0u8; SEGMENT_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SegmentKey(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_keys_are_fresh() {
        let generator = OsKeyGenerator;
        let a = generator.generate_key();
        let b = generator.generate_key();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), SEGMENT_KEY_LEN);
    }

    #[test]
    fn test_try_from_slice() {
        let bytes = vec![7u8; SEGMENT_KEY_LEN];
        let key = SegmentKey::try_from(bytes.as_slice()).unwrap();
        assert_eq!(key.to_vec(), bytes);
        assert!(SegmentKey::try_from(&bytes[..16]).is_err());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let key = SegmentKey::from_bytes([0xAB; SEGMENT_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "SegmentKey(..)");
    }
}
