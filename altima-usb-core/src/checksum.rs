//! Content hashing for downloaded images.
//!
//! SHA-256 is the normal case; 32 character references are treated as MD5,
//! which older catalog entries still publish.
use crate::cancel::CancelToken;
use crate::error::VerifyError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Md5,
}

impl DigestAlgorithm {
    fn for_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(DigestAlgorithm::Sha256),
            32 => Some(DigestAlgorithm::Md5),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha256 => f.write_str("SHA-256"),
            DigestAlgorithm::Md5 => f.write_str("MD5"),
        }
    }
}

/// A digest a file is expected to hash to. The hex form is kept lowercase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl ExpectedDigest {
    pub fn parse(text: &str) -> Result<Self, VerifyError> {
        let hex = text.trim();
        let algorithm = DigestAlgorithm::for_hex_len(hex.len())
            .filter(|_| hex.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| VerifyError::InvalidDigest(text.to_string()))?;
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// Finds the first run of hex digits that is exactly 32 or 64 characters
/// long, as found in `.sha256`/`.md5` files (`<digest>  <file name>`).
pub fn extract_digest(text: &str) -> Option<ExpectedDigest> {
    text.split(|c: char| !c.is_ascii_hexdigit())
        .find(|run| DigestAlgorithm::for_hex_len(run.len()).is_some())
        .and_then(|run| ExpectedDigest::parse(run).ok())
}

enum Hasher {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Md5(h) => h.consume(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => format!("{:x}", h.compute()),
        }
    }
}

pub struct ChecksumVerifier {
    chunk_size: usize,
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl ChecksumVerifier {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Whether `path` hashes to `expected`.
    pub fn verify(&self, path: &Path, expected: &ExpectedDigest) -> Result<bool, VerifyError> {
        let actual = self.digest_file(path, expected.algorithm, &CancelToken::new(), |_| {})?;
        Ok(actual == expected.hex)
    }

    /// Streams `path` once through `algorithm` and returns the lowercase hex
    /// digest. `on_progress` receives the number of bytes hashed so far.
    pub fn digest_file<F>(
        &self,
        path: &Path,
        algorithm: DigestAlgorithm,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<String, VerifyError>
    where
        F: FnMut(u64),
    {
        let mut file = File::open(path)?;
        let mut hasher = Hasher::new(algorithm);
        let mut buf = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(VerifyError::Cancelled);
            }
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            total += n as u64;
            on_progress(total);
        }

        Ok(hasher.finalize_hex())
    }
}
