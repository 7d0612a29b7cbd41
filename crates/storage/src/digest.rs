//! SHA-1 content digests, the integrity check used by chunked uploads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

/// SHA-1 digest of uploaded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 20]);

impl ContentDigest {
    /// Digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self::from(Sha1::new_with_prefix(data))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Base64 form, as sent in `Digest: sha=...` headers.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl From<Sha1> for ContentDigest {
    fn from(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}
