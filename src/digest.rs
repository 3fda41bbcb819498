//! Errors and functions for validating digests of cached content

use sha2::Digest as _;

/// Result type for digest operations
pub type Result<T> = std::result::Result<T, DigestError>;

/// Errors that can occur when validating digests
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Invalid digest algorithm found
    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Missing digest algorithm
    #[error("Missing digest algorithm")]
    MissingAlgorithm,
    /// Encoded part of the digest is not lowercase hex of the right length
    #[error("Invalid digest encoding: {0}")]
    InvalidEncoding(String),
    /// Digest verification failed
    #[error("Invalid digest. Expected {expected}, got {actual}")]
    VerificationError {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },
}

/// A parsed `algorithm:hex` digest string
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Digest<'a> {
    /// Algorithm name, e.g. `sha256`
    pub algorithm: &'a str,
    /// Hex encoded hash
    pub encoded: &'a str,
}

impl<'a> Digest<'a> {
    /// Parse and validate a digest. Only algorithms we can compute are accepted, and the encoded
    /// part must be lowercase hex of the algorithm's length, so it is always safe as a file name.
    pub fn new(digest: &'a str) -> Result<Self> {
        let (algorithm, encoded) = digest
            .split_once(':')
            .ok_or(DigestError::MissingAlgorithm)?;
        let expected_len = match algorithm {
            "sha256" => 64,
            "sha384" => 96,
            "sha512" => 128,
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        };
        let well_formed = encoded.len() == expected_len
            && encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(DigestError::InvalidEncoding(digest.to_string()));
        }
        Ok(Self { algorithm, encoded })
    }
}

/// Helper wrapper around various digest algorithms. This has to be an enum because the digest
/// algorithms aren't object safe so we can't box dynner them
pub(crate) enum Digester {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Digester {
    pub fn new(digest: &str) -> Result<Self> {
        let parsed_digest = Digest::new(digest)?;

        match parsed_digest.algorithm {
            "sha256" => Ok(Digester::Sha256(sha2::Sha256::new())),
            "sha384" => Ok(Digester::Sha384(sha2::Sha384::new())),
            "sha512" => Ok(Digester::Sha512(sha2::Sha512::new())),
            // Digest::new already rejects these
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    pub fn finalize(&mut self) -> String {
        match self {
            Self::Sha256(d) => format!("sha256:{:x}", d.finalize_reset()),
            Self::Sha384(d) => format!("sha384:{:x}", d.finalize_reset()),
            Self::Sha512(d) => format!("sha512:{:x}", d.finalize_reset()),
        }
    }
}

/// Check that `content` hashes to `expected`, using the algorithm named by `expected`
pub fn verify(content: &[u8], expected: &str) -> Result<()> {
    let mut digester = Digester::new(expected)?;
    digester.update(content);
    let actual = digester.finalize();
    tracing::trace!(%actual, %expected, "Computed digest of payload");
    if actual != expected {
        return Err(DigestError::VerificationError {
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}
