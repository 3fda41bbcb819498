//! The image transfer adapter: pull through a layer cache, push to a tag

use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheStore, CachedImage, FilesystemCache};
use crate::errors::Result;
use crate::options::Options;
use crate::reference::{OciReferenceParser, ReferenceParser};
use crate::registry::{Image, RegistryClient};

/// Pulls and pushes images through a [`RegistryClient`].
///
/// The adapter owns no protocol logic: it parses references, selects credentials and a
/// concurrency bound from [`Options`], and wraps pulled images with its layer cache. The cache is
/// shared by every pull made through the same adapter.
pub struct ImageTransfer<C, P = OciReferenceParser> {
    client: C,
    parser: P,
    cache: Arc<dyn CacheStore>,
}

impl<C: RegistryClient> ImageTransfer<C> {
    /// Create an adapter using the given client and cache store
    pub fn new(client: C, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            client,
            parser: OciReferenceParser,
            cache,
        }
    }

    /// Create an adapter whose layer cache lives in a fresh temporary directory
    pub fn with_temporary_cache(client: C) -> Result<Self> {
        let cache = FilesystemCache::temporary()?;
        debug!(root = %cache.root().display(), "Created temporary layer cache");
        Ok(Self::new(client, Arc::new(cache)))
    }
}

impl<C: RegistryClient, P: ReferenceParser> ImageTransfer<C, P> {
    /// Replace the reference parser
    pub fn with_parser<Q: ReferenceParser>(self, parser: Q) -> ImageTransfer<C, Q> {
        ImageTransfer {
            client: self.client,
            parser,
            cache: self.cache,
        }
    }

    /// The registry client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The layer cache shared by pulled images
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Resolve `options.base` and return a handle whose layers are read through the cache
    pub async fn pull(&self, options: &Options) -> Result<CachedImage> {
        let reference = self
            .parser
            .parse(&options.base, options.pull_parse_options())?;
        let transfer_options = options.transfer_options();
        debug!(%reference, insecure = reference.insecure(), ?transfer_options, "Pulling image");

        let image = self.client.read(&reference, &transfer_options).await?;
        Ok(CachedImage::new(image, Arc::clone(&self.cache)))
    }

    /// Upload `image` to the tag named by `options.target`
    pub async fn push(&self, image: &dyn Image, options: &Options) -> Result<()> {
        let tag = self
            .parser
            .parse_tag(&options.target, options.push_parse_options())?;
        let transfer_options = options.transfer_options();
        debug!(%tag, insecure = tag.insecure(), ?transfer_options, "Pushing image");

        self.client.write(&tag, image, &transfer_options).await
    }
}
