//! Pull and push OCI images through a registry client, with credential selection and a local
//! read-through layer cache
#![deny(missing_docs)]

use sha2::Digest;

pub mod cache;
pub mod digest;
pub mod errors;
pub mod keychain;
pub mod options;
pub mod reference;
pub mod registry;
pub mod transfer;

#[doc(inline)]
pub use cache::{CacheStore, CachedImage, FilesystemCache};
#[doc(inline)]
pub use errors::{Result, TransferError};
#[doc(inline)]
pub use keychain::{CredentialSource, Keychain};
#[doc(inline)]
pub use options::{Options, TransferOptions};
#[doc(inline)]
pub use reference::{ImageRef, ParseOptions, TagRef};
#[doc(inline)]
pub use registry::{Image, OciRegistry, RegistryClient};
#[doc(inline)]
pub use transfer::ImageTransfer;

/// Computes the SHA256 digest of a byte vector
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}
