//! Content digests for bundles and page images.
//!
//! SHA-256 over the raw bytes, hex-encoded. The same function is used at
//! both granularities: the whole bundle file before it is accepted for
//! splitting, and each staged page PNG before routing. Dedup and resume
//! both key on these digests, so they must be stable across runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read buffer size for [`ContentDigest::of_file`].
pub const READ_CHUNK: usize = 64 * 1024;

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest a byte slice. Pure and deterministic.
    pub fn of(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        ContentDigest(format!("{:x}", hash))
    }

    /// Digest a file's full contents, read in [`READ_CHUNK`]-sized pieces.
    pub async fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(ContentDigest(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(ContentDigest::of(b"bundle"), ContentDigest::of(b"bundle"));
    }

    #[test]
    fn different_content_different_digest() {
        assert_ne!(ContentDigest::of(b"page 1"), ContentDigest::of(b"page 2"));
    }

    #[test]
    fn digest_is_256_bit_hex() {
        let d = ContentDigest::of(b"");
        assert_eq!(
            d.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.short(), "e3b0c44298fc");
    }

    #[tokio::test]
    async fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.7 fake").unwrap();
        let d = ContentDigest::of_file(&path).await.unwrap();
        assert_eq!(d, ContentDigest::of(b"%PDF-1.7 fake"));
    }

    #[tokio::test]
    async fn file_digest_streams_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pdf");
        let bytes: Vec<u8> = (0..READ_CHUNK * 3 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &bytes).unwrap();
        let d = ContentDigest::of_file(&path).await.unwrap();
        assert_eq!(d, ContentDigest::of(&bytes));
    }
}
