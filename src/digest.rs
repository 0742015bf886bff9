use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::AsyncReadExt;

use crate::error::{OciError, Result};

/// Buffer size for streaming digest computation over files.
const READ_CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        // Algorithm names follow `[a-z0-9]+([+._-][a-z0-9]+)*`; anything
        // matching the grammar but unknown to us is unsupported rather than
        // malformed.
        if !is_valid_algorithm_name(s) {
            return Err(OciError::InvalidDigest(format!(
                "malformed algorithm component: {s:?}"
            )));
        }
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(OciError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Sha256
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_valid_algorithm_name(s: &str) -> bool {
    let mut chars = s.chars().peekable();
    if chars.peek().is_none() {
        return false;
    }
    let mut prev_sep = true;
    for c in chars {
        match c {
            'a'..='z' | '0'..='9' => prev_sep = false,
            '+' | '.' | '_' | '-' if !prev_sep => prev_sep = true,
            _ => return false,
        }
    }
    !prev_sep
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// A validated content digest in `algorithm:hex` form.
///
/// Hex is case-sensitive per the OCI image spec: upper- or mixed-case input
/// is rejected as invalid, never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate an `algorithm:hex` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| OciError::InvalidDigest(format!("missing ':' separator in {s:?}")))?;
        let algorithm = Algorithm::parse(algo)?;
        if hex.len() != algorithm.hex_len() {
            return Err(OciError::InvalidDigest(format!(
                "expected {} hex characters for {algorithm}, got {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(OciError::InvalidDigest(format!(
                "non-lowercase-hex characters in {s:?}"
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex portion, without the `algorithm:` prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

/// Compare two digests in full `algorithm:hex` form, case-sensitively.
pub fn verify(expected: &Digest, actual: &Digest) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Incremental digest computation, used to hash bodies as they stream.
pub struct Hasher {
    inner: HasherImpl,
}

enum HasherImpl {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::Sha256 => HasherImpl::Sha256(Sha256::new()),
            Algorithm::Sha512 => HasherImpl::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherImpl::Sha256(h) => h.update(data),
            HasherImpl::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.inner {
            HasherImpl::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            HasherImpl::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// Digest an in-memory byte slice.
pub fn digest_bytes(algorithm: Algorithm, data: &[u8]) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Digest a file by streaming it in buffered chunks.  Returns the digest and
/// the file size in bytes.
pub async fn digest_file(algorithm: Algorithm, path: &Path) -> Result<(Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_JSON_SHA256: &str =
        "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

    #[test]
    fn digest_of_empty_json() {
        let d = digest_bytes(Algorithm::Sha256, b"{}");
        assert_eq!(d.to_string(), EMPTY_JSON_SHA256);
    }

    #[test]
    fn parse_round_trip() {
        let d = Digest::parse(EMPTY_JSON_SHA256).unwrap();
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.to_string(), EMPTY_JSON_SHA256);
        assert_eq!(Digest::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn parse_sha512() {
        let d = digest_bytes(Algorithm::Sha512, b"foobar");
        assert_eq!(d.hex().len(), 128);
        assert_eq!(Digest::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(
            Digest::parse("deadbeef"),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let hex64 = "a".repeat(64);
        assert!(matches!(
            Digest::parse(&format!("blake3:{hex64}")),
            Err(OciError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn rejects_malformed_algorithm() {
        assert!(matches!(
            Digest::parse("SHA256:abcd"),
            Err(OciError::InvalidDigest(_))
        ));
        assert!(matches!(
            Digest::parse("sha--256:abcd"),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn rejects_uppercase_hex() {
        let upper = EMPTY_JSON_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(matches!(
            Digest::parse(&upper),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn rejects_wrong_hex_length() {
        assert!(matches!(
            Digest::parse("sha256:abcd"),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"some layer bytes".repeat(1000);
        let one_shot = digest_bytes(Algorithm::Sha256, &data);
        let mut hasher = Hasher::new(Algorithm::Sha256);
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), one_shot);
    }

    #[tokio::test]
    async fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data = b"artifact-oci-layout";
        tokio::fs::write(&path, data).await.unwrap();

        let (d, size) = digest_file(Algorithm::Sha256, &path).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(d, digest_bytes(Algorithm::Sha256, data));
    }

    #[test]
    fn verify_mismatch() {
        let a = digest_bytes(Algorithm::Sha256, b"a");
        let b = digest_bytes(Algorithm::Sha256, b"b");
        assert!(verify(&a, &a).is_ok());
        assert!(matches!(
            verify(&a, &b),
            Err(OciError::DigestMismatch { .. })
        ));
    }
}
