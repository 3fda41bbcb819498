//! Registry access: the image handle abstraction and the client that reads and writes images

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use oci_client::client::{
    ClientConfig, ClientConfigSource, ClientProtocol, Config, ImageLayer,
    DEFAULT_MAX_CONCURRENT_UPLOAD,
};
use oci_client::errors::OciDistributionError;
use oci_client::manifest::{OciDescriptor, OciImageManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use tracing::debug;

use crate::errors::{Result, TransferError};
use crate::keychain::Keychain;
use crate::options::TransferOptions;
use crate::reference::{ImageRef, TagRef};

/// A handle on an image: its identity and manifest are known, blobs are produced on demand
#[async_trait]
pub trait Image: Send + Sync {
    /// Reference the image was resolved from
    fn reference(&self) -> &Reference;

    /// Digest of the image manifest
    fn digest(&self) -> &str;

    /// The image manifest
    fn manifest(&self) -> &OciImageManifest;

    /// Layer descriptors, in manifest order
    fn layers(&self) -> &[OciDescriptor] {
        &self.manifest().layers
    }

    /// Look up a layer descriptor by digest
    fn find_layer(&self, digest: &str) -> Option<&OciDescriptor> {
        self.layers().iter().find(|layer| layer.digest == digest)
    }

    /// Fetch the config blob
    async fn config_blob(&self) -> Result<Bytes>;

    /// Fetch the content of the layer with the given digest
    async fn layer(&self, digest: &str) -> Result<Bytes>;
}

/// Reads and writes images on a registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve `reference` to an image handle
    async fn read(&self, reference: &ImageRef, options: &TransferOptions)
        -> Result<Arc<dyn Image>>;

    /// Upload `image` and tag it as `tag`
    async fn write(&self, tag: &TagRef, image: &dyn Image, options: &TransferOptions)
        -> Result<()>;
}

/// Client configuration derived from a reference and the transfer options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Registry whose certificates are not verified
    pub insecure_registry: Option<String>,
    /// Contact the insecure registry over plain HTTP instead of HTTPS
    pub plain_http: bool,
    /// Bound on parallel blob transfers
    pub max_concurrency: Option<usize>,
}

impl RegistrySettings {
    /// Settings for talking to the registry of `reference`
    pub fn new(reference: &ImageRef, options: &TransferOptions) -> Self {
        Self {
            insecure_registry: reference
                .insecure()
                .then(|| reference.registry().to_string()),
            plain_http: false,
            max_concurrency: options.max_concurrency,
        }
    }

    /// The same settings, switched to plain HTTP for the insecure registry
    pub fn with_plain_http(self) -> Self {
        Self {
            plain_http: true,
            ..self
        }
    }
}

impl ClientConfigSource for RegistrySettings {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(registry) = &self.insecure_registry {
            config.accept_invalid_certificates = true;
            if self.plain_http {
                config.protocol = ClientProtocol::HttpsExcept(vec![registry.clone()]);
            }
        }
        if let Some(jobs) = self.max_concurrency {
            config.max_concurrent_download = jobs;
            config.max_concurrent_upload = jobs;
        }
        config
    }
}

/// [`RegistryClient`] backed by [`oci_client::Client`]
///
/// A client is configured per call, since the protocol exceptions and concurrency limits depend
/// on the reference and the options of that call. Insecure registries are tried over HTTPS
/// without certificate verification first, and over plain HTTP when no TLS connection can be
/// made.
#[derive(Debug, Clone, Copy, Default)]
pub struct OciRegistry;

impl OciRegistry {
    async fn connect(
        reference: &ImageRef,
        options: &TransferOptions,
        operation: RegistryOperation,
    ) -> Result<(Client, RegistryAuth)> {
        let settings = RegistrySettings::new(reference, options);
        debug!(?settings, credentials = ?options.credentials, "Configuring registry client");
        let auth = options.credentials.resolve(reference.registry())?;
        let client = Client::from_source(&settings);
        if !reference.insecure() {
            return Ok((client, auth));
        }

        // any other failure surfaces again on the first real request
        match client.auth(reference.reference(), &auth, operation).await {
            Err(OciDistributionError::RequestError(e)) => {
                debug!(registry = %reference.registry(), error = %e, "HTTPS unreachable, using plain HTTP");
                Ok((Client::from_source(&settings.with_plain_http()), auth))
            }
            _ => Ok((client, auth)),
        }
    }
}

#[async_trait]
impl RegistryClient for OciRegistry {
    async fn read(
        &self,
        reference: &ImageRef,
        options: &TransferOptions,
    ) -> Result<Arc<dyn Image>> {
        let connection = Self::connect(reference, options, RegistryOperation::Pull);
        let (client, auth) = connection.await?;
        debug!(%reference, "Pulling image manifest");
        let (manifest, digest) = client
            .pull_image_manifest(reference.reference(), &auth)
            .await?;
        debug!(%reference, %digest, layers = manifest.layers.len(), "Resolved image");
        Ok(Arc::new(RemoteImage {
            client,
            reference: reference.reference().clone(),
            digest,
            manifest,
        }))
    }

    async fn write(
        &self,
        tag: &TagRef,
        image: &dyn Image,
        options: &TransferOptions,
    ) -> Result<()> {
        let connection = Self::connect(tag.as_image_ref(), options, RegistryOperation::Push);
        let (client, auth) = connection.await?;
        let jobs = options
            .max_concurrency
            .unwrap_or(DEFAULT_MAX_CONCURRENT_UPLOAD);

        debug!(%tag, source = %image.reference(), layers = image.layers().len(), "Collecting layers for push");
        let layers: Vec<ImageLayer> = stream::iter(image.layers())
            .map(|descriptor| async move {
                let data = image.layer(&descriptor.digest).await?;
                Ok::<_, TransferError>(ImageLayer::new(
                    data.to_vec(),
                    descriptor.media_type.clone(),
                    descriptor.annotations.clone(),
                ))
            })
            .boxed() // Workaround to rustc issue https://github.com/rust-lang/rust/issues/104382
            .buffered(jobs)
            .try_collect()
            .await?;

        let manifest = image.manifest().clone();
        let config = Config::new(
            image.config_blob().await?.to_vec(),
            manifest.config.media_type.clone(),
            manifest.config.annotations.clone(),
        );

        let response = client
            .push(tag.reference(), &layers, config, &auth, Some(manifest))
            .await?;
        debug!(%tag, manifest_url = %response.manifest_url, "Pushed image");
        Ok(())
    }
}

/// Image living on a registry; the manifest is fetched eagerly, blobs lazily
pub struct RemoteImage {
    client: Client,
    reference: Reference,
    digest: String,
    manifest: OciImageManifest,
}

impl RemoteImage {
    async fn pull(&self, descriptor: &OciDescriptor) -> Result<Bytes> {
        let mut out: Vec<u8> = Vec::new();
        debug!(reference = %self.reference, digest = %descriptor.digest, "Pulling blob");
        self.client
            .pull_blob(&self.reference, descriptor, &mut out)
            .await?;
        Ok(Bytes::from(out))
    }
}

#[async_trait]
impl Image for RemoteImage {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn digest(&self) -> &str {
        &self.digest
    }

    fn manifest(&self) -> &OciImageManifest {
        &self.manifest
    }

    async fn config_blob(&self) -> Result<Bytes> {
        self.pull(&self.manifest.config).await
    }

    async fn layer(&self, digest: &str) -> Result<Bytes> {
        let descriptor = self
            .find_layer(digest)
            .ok_or_else(|| TransferError::LayerNotFound(digest.to_string()))?;
        self.pull(descriptor).await
    }
}
