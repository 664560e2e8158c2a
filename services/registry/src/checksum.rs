//! Layer checksums, in the `algorithm:hex` form clients declare them in.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use sha2::digest::DynDigest;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncWrite;

use crate::error::{RegistryError, RegistryResult};

/// Digest algorithms accepted in declared checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl Algorithm {
    /// The prefix used for this algorithm in `algorithm:hex` strings.
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn hasher(self) -> Box<dyn DynDigest + Send + Sync> {
        match self {
            Algorithm::Sha256 => Box::new(Sha256::new()),
            Algorithm::Sha512 => Box::new(Sha512::new()),
        }
    }
}

impl FromStr for Algorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(RegistryError::InvalidChecksumFormat(format!(
                "unsupported algorithm: {s}"
            ))),
        }
    }
}

/// A parsed checksum. The hex part is kept lowercase so that comparisons
/// are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: Algorithm,
    hex: String,
}

impl Checksum {
    /// Compute the checksum of `data`.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        Self::from_digest(algorithm, &hasher.finalize())
    }

    /// Shorthand for a SHA-256 checksum of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(Algorithm::Sha256, data)
    }

    fn from_digest(algorithm: Algorithm, digest: &[u8]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(digest),
        }
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex digest, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether `data` hashes to this checksum.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(self.algorithm, data) == *self
    }
}

impl FromStr for Checksum {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::InvalidChecksumFormat(format!("missing prefix: {s}")))?;
        let algorithm: Algorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidChecksumFormat(format!(
                "expected {} hex digits for {}: {s}",
                algorithm.hex_len(),
                algorithm.name()
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Check `stored` bytes against a declared checksum string.
///
/// Fails only when `declared` is malformed; a well-formed checksum that does
/// not match yields `Ok(false)`.
pub fn validate(stored: &[u8], declared: &str) -> RegistryResult<bool> {
    let declared: Checksum = declared.parse()?;
    Ok(declared.matches(stored))
}

/// An `AsyncWrite` sink which hashes everything written to it.
///
/// Layers are streamed from storage into a `Hasher` so that verifying a
/// checksum never buffers the whole layer.
pub struct Hasher {
    algorithm: Algorithm,
    hash: Box<dyn DynDigest + Send + Sync>,
    written: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm)
            .field("written", &self.written)
            .finish()
    }
}

impl Hasher {
    /// Create a hasher for `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            hash: algorithm.hasher(),
            written: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consume the hasher, returning the checksum of everything written.
    pub fn finish(mut self) -> Checksum {
        let digest = self.hash.finalize_reset();
        Checksum::from_digest(self.algorithm, &digest)
    }
}

impl AsyncWrite for Hasher {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.hash.update(buf);
        this.written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse_checksum() {
        let checksum: Checksum = EMPTY_SHA256.parse().unwrap();
        assert_eq!(checksum.algorithm(), Algorithm::Sha256);
        assert_eq!(checksum.to_string(), EMPTY_SHA256);
        assert!(checksum.matches(b""));
    }

    #[test]
    fn parse_is_case_insensitive() {
        let checksum: Checksum = EMPTY_SHA256.to_ascii_uppercase().parse().unwrap();
        assert_eq!(checksum.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn malformed_checksums_are_rejected() {
        for bad in [
            "",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "sha256:abc",
            "sha256:zzb0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ] {
            let err = bad.parse::<Checksum>().unwrap_err();
            assert!(
                matches!(err, RegistryError::InvalidChecksumFormat(_)),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn validate_compares_content() {
        let declared = Checksum::sha256(b"layer").to_string();
        assert!(validate(b"layer", &declared).unwrap());
        assert!(!validate(b"other", &declared).unwrap());
        assert!(validate(b"layer", "sha256").is_err());
    }

    #[test]
    fn sha512_is_supported() {
        let checksum = Checksum::compute(Algorithm::Sha512, b"layer");
        let parsed: Checksum = checksum.to_string().parse().unwrap();
        assert_eq!(parsed, checksum);
        assert_eq!(parsed.hex().len(), 128);
    }

    #[tokio::test]
    async fn hasher_matches_compute() {
        let mut hasher = Hasher::new(Algorithm::Sha256);
        hasher.write_all(b"lay").await.unwrap();
        hasher.write_all(b"er").await.unwrap();
        assert_eq!(hasher.written(), 5);
        assert_eq!(hasher.finish(), Checksum::sha256(b"layer"));
    }
}
