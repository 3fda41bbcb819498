//! Parsing of user supplied image references

use std::fmt;

use oci_client::Reference;
use tracing::debug;

use crate::errors::{ReferenceError, Result, TransferError};

/// Tag used when a reference names neither a tag nor a digest
pub const DEFAULT_TAG: &str = "latest";

/// Modifiers applied while parsing a reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Allow plain HTTP and self-signed certificates for the reference's registry
    pub insecure: bool,
}

impl ParseOptions {
    /// Options for a registry that may only be reached securely
    pub fn secure() -> Self {
        Self::default()
    }

    /// Options for a registry that may be reached without TLS verification
    pub fn insecure() -> Self {
        Self { insecure: true }
    }
}

/// A parsed image reference, pointing at a tag, a digest, or both
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    reference: Reference,
    insecure: bool,
}

impl ImageRef {
    /// Wrap an already parsed reference
    pub fn new(reference: Reference, options: ParseOptions) -> Self {
        Self {
            reference,
            insecure: options.insecure,
        }
    }

    /// The underlying registry reference
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Whether the registry may be reached insecurely
    pub fn insecure(&self) -> bool {
        self.insecure
    }

    /// Registry host, resolved the way the registry client will contact it
    pub fn registry(&self) -> &str {
        self.reference.resolve_registry()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference.whole())
    }
}

/// A parsed reference that names a tag and no digest, suitable as a push destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef(ImageRef);

impl TagRef {
    /// The tag this reference points at
    pub fn tag(&self) -> &str {
        // always set by construction
        self.0.reference.tag().unwrap_or(DEFAULT_TAG)
    }

    /// View as a generic image reference
    pub fn as_image_ref(&self) -> &ImageRef {
        &self.0
    }

    /// The underlying registry reference
    pub fn reference(&self) -> &Reference {
        self.0.reference()
    }

    /// Whether the registry may be reached insecurely
    pub fn insecure(&self) -> bool {
        self.0.insecure
    }

    /// Registry host, resolved the way the registry client will contact it
    pub fn registry(&self) -> &str {
        self.0.registry()
    }
}

impl fmt::Display for TagRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Turns reference strings into structured references
pub trait ReferenceParser: Send + Sync {
    /// Parse a tag or digest reference
    fn parse(&self, input: &str, options: ParseOptions) -> Result<ImageRef>;

    /// Parse a reference that must be expressible as a tag
    fn parse_tag(&self, input: &str, options: ParseOptions) -> Result<TagRef>;
}

/// Parser following the OCI distribution reference grammar, including Docker Hub normalisation
#[derive(Debug, Clone, Copy, Default)]
pub struct OciReferenceParser;

impl ReferenceParser for OciReferenceParser {
    fn parse(&self, input: &str, options: ParseOptions) -> Result<ImageRef> {
        if input.trim().is_empty() {
            return Err(TransferError::invalid_reference(
                input,
                ReferenceError::Empty,
            ));
        }
        let reference = Reference::try_from(input)
            .map_err(|e| TransferError::invalid_reference(input, e))?;
        debug!(%input, insecure = options.insecure, resolved = %reference.whole(), "Parsed reference");
        Ok(ImageRef::new(reference, options))
    }

    fn parse_tag(&self, input: &str, options: ParseOptions) -> Result<TagRef> {
        let image = self.parse(input, options)?;
        if let Some(digest) = image.reference.digest() {
            return Err(TransferError::invalid_reference(
                input,
                ReferenceError::NotATag(digest.to_string()),
            ));
        }
        if image.reference.tag().is_some() {
            return Ok(TagRef(image));
        }
        let reference = Reference::with_tag(
            image.reference.registry().to_string(),
            image.reference.repository().to_string(),
            DEFAULT_TAG.to_string(),
        );
        Ok(TagRef(ImageRef::new(reference, options)))
    }
}
