//! Errors related to pulling, pushing and caching images

use std::path::PathBuf;

use oci_client::errors::OciDistributionError;
use oci_client::ParseError;

use crate::digest::DigestError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TransferError>;

/// Why a reference string was rejected
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// The reference string was empty
    #[error("reference is empty")]
    Empty,
    /// The reference string does not follow the reference grammar
    #[error(transparent)]
    Malformed(#[from] ParseError),
    /// A tag was required but the reference points at a digest
    #[error("reference pins digest {0}, a tag is required")]
    NotATag(String),
}

/// Errors that can be raised while transferring images
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A source or target reference could not be parsed
    #[error("parsing tag {reference:?}: {reason}")]
    InvalidReference {
        /// The offending input, verbatim
        reference: String,
        /// Parse failure
        #[source]
        reason: ReferenceError,
    },
    /// An options file could not be read or decoded
    #[error("reading options from {}: {source}", path.display())]
    OptionsFile {
        /// Path of the options file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
    /// Error surfaced by the registry client
    #[error(transparent)]
    Registry(#[from] OciDistributionError),
    /// Credentials for a registry could not be resolved
    #[error("resolving credentials for {registry}: {reason}")]
    Credentials {
        /// Registry host
        registry: String,
        /// Failure reason
        reason: String,
    },
    /// A credential configuration file is unreadable
    #[error("reading credential config {}: {source}", path.display())]
    CredentialConfig {
        /// Path to the config file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
    /// The layer cache directory could not be created
    #[error("creating layer cache directory: {0}")]
    CacheInit(#[source] std::io::Error),
    /// I/O failure inside the layer cache
    #[error("layer cache I/O on {}: {source}", path.display())]
    Cache {
        /// File or directory involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
    /// Digest parsing or verification failed
    #[error(transparent)]
    Digest(#[from] DigestError),
    /// A layer was requested that the image manifest does not list
    #[error("layer {0} is not part of the image")]
    LayerNotFound(String),
}

impl TransferError {
    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<ReferenceError>) -> Self {
        TransferError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}
