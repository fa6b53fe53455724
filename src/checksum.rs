//! Streaming checksum verification.
//!
//! Digests are computed incrementally as bytes land on disk, never by
//! re-reading the finished file. When a transfer resumes from a partial
//! file, the contexts are seeded with the existing on-disk bytes first so
//! the final digest always covers the whole assembled file.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};

/// Buffer size for seeding digests from an existing partial file (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// A declared checksum: algorithm plus expected lowercase hex digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex_digest: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex_digest: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex_digest: hex_digest.into(),
        }
    }

    /// Shorthand for the common SHA-256 case.
    pub fn sha256(hex_digest: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Sha256, hex_digest)
    }
}

enum DigestContext {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestContext {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Outcome of finalizing a [`DigestSet`]: the first mismatching checksum,
/// with the digest actually computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFailure {
    pub expected: Checksum,
    pub actual: String,
}

/// One streaming digest context per declared checksum.
///
/// Feed it every chunk written to the transfer file, in order; finalize at
/// transfer end to compare against the declared digests.
pub struct DigestSet {
    contexts: Vec<(Checksum, DigestContext)>,
}

impl DigestSet {
    /// Create fresh contexts for the given declarations.
    pub fn new(checksums: &[Checksum]) -> Self {
        Self {
            contexts: checksums
                .iter()
                .map(|c| (c.clone(), DigestContext::new(c.algorithm)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Feed one chunk into every context.
    pub fn update(&mut self, chunk: &[u8]) {
        for (_, ctx) in &mut self.contexts {
            ctx.update(chunk);
        }
    }

    /// Seed the contexts with the contents of an existing partial file.
    ///
    /// Returns the number of bytes fed, which is the byte offset the
    /// resumed transfer must start at.
    pub fn seed_from_file(&mut self, path: &Path) -> std::io::Result<u64> {
        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            self.update(&buffer[..bytes_read]);
            total += bytes_read as u64;
        }

        Ok(total)
    }

    /// Finalize every context and compare against the declared digests.
    ///
    /// Returns the first mismatch, if any. Comparison is ASCII
    /// case-insensitive so upper-case declarations verify too.
    pub fn verify(self) -> Result<(), ChecksumFailure> {
        for (expected, ctx) in self.contexts {
            let actual = ctx.finalize_hex();
            if !actual.eq_ignore_ascii_case(&expected.hex_digest) {
                return Err(ChecksumFailure { expected, actual });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DigestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestSet")
            .field("algorithms", &self.contexts.iter().map(|(c, _)| c.algorithm).collect::<Vec<_>>())
            .finish()
    }
}
