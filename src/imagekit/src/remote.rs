//! Registry-backed images.
//!
//! Opens an image from a v2 registry (or in scratch mode when the
//! reference does not resolve), and saves by pushing blobs and a
//! manifest back. Layer bytes are never fetched at open time; a
//! registry layer downloads on first byte access.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use imagekit_core::config::ClientConfig;
use imagekit_core::error::{ImageError, Result};

use crate::config::ConfigFile;
use crate::credentials::Keychain;
use crate::descriptor::{
    Descriptor, Digest, DOCKER_CONFIG, DOCKER_LAYER, DOCKER_MANIFEST, OCI_CONFIG, OCI_LAYER,
    OCI_MANIFEST,
};
use crate::image::{BaseImage, Image, ImageData, ImageOptions};
use crate::layer::{Layer, Staging};
use crate::manifest::{Manifest, Platform};
use crate::reference::Reference;
use crate::registry::{ManifestDocument, RegistryClient};

/// A fully resolved image read from a registry: canonical digest, the
/// manifest, and its decoded configuration.
pub(crate) struct ResolvedImage {
    pub digest: Digest,
    pub media_type: String,
    pub manifest: Manifest,
    pub config: ConfigFile,
}

/// Resolves a reference to a single-platform manifest plus config,
/// following one level of index indirection. `None` when the reference
/// does not exist.
pub(crate) async fn resolve_image(
    client: &RegistryClient,
    reference: &Reference,
    platform: &Platform,
) -> Result<Option<ResolvedImage>> {
    let fetched = match client
        .get_manifest(reference.repository(), &reference.manifest_reference())
        .await?
    {
        Some(fetched) => fetched,
        None => return Ok(None),
    };

    let (digest, media_type, manifest) = match fetched.document {
        ManifestDocument::Manifest(manifest) => (fetched.digest, fetched.media_type, manifest),
        ManifestDocument::Index(index) => {
            let entry = index.select(platform).ok_or_else(|| {
                ImageError::Validation(format!(
                    "no manifest for {}/{} in index for '{}'; available: {}",
                    platform.os,
                    platform.architecture,
                    reference,
                    index.available_platforms().join(", ")
                ))
            })?;
            let inner = client
                .get_manifest(reference.repository(), &entry.descriptor.digest.to_string())
                .await?
                .ok_or_else(|| {
                    ImageError::Validation(format!(
                        "index for '{}' references missing manifest {}",
                        reference, entry.descriptor.digest
                    ))
                })?;
            match inner.document {
                ManifestDocument::Manifest(manifest) => {
                    (inner.digest, inner.media_type, manifest)
                }
                ManifestDocument::Index(_) => {
                    return Err(ImageError::Validation(
                        "nested image index is not supported".to_string(),
                    ))
                }
            }
        }
    };

    let config = client
        .get_config(reference.repository(), &manifest.config)
        .await?;

    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(ImageError::Validation(format!(
            "manifest for '{}' has {} layers but its config lists {} diff ids",
            reference,
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        )));
    }

    Ok(Some(ResolvedImage {
        digest,
        media_type,
        manifest,
        config,
    }))
}

/// Builds registry-backed layer handles from a resolved image.
pub(crate) fn remote_layers(
    client: &Arc<RegistryClient>,
    reference: &Reference,
    resolved: &ResolvedImage,
    staging: &Staging,
) -> Vec<Layer> {
    resolved
        .manifest
        .layers
        .iter()
        .zip(resolved.config.rootfs.diff_ids.iter())
        .map(|(descriptor, diff_id)| {
            Layer::from_remote(
                client.clone(),
                reference.registry(),
                reference.repository(),
                descriptor.clone(),
                diff_id.clone(),
                staging.clone(),
            )
        })
        .collect()
}

/// An image bound to a remote registry.
pub struct RemoteImage {
    keychain: Arc<dyn Keychain>,
    client_config: ClientConfig,
    /// Client for the registry the image was opened from.
    client: Arc<RegistryClient>,
    client_registry: String,
    data: ImageData,
    platform: Platform,
    manifest_media_type: String,
    config_media_type: String,
    previous_image_raw: Option<String>,
    /// Layer pool of the previous image, resolved on first reuse.
    previous_layers: Option<Vec<Layer>>,
}

impl RemoteImage {
    /// Opens an image at `name`, seeding from the base image option when
    /// given. Missing references open in scratch mode.
    pub async fn new(
        name: &str,
        keychain: Arc<dyn Keychain>,
        options: ImageOptions,
    ) -> Result<Self> {
        let reference = Reference::parse(name)?;
        let platform = options.platform.clone().unwrap_or_default();
        let client_config = options.client_config.clone().unwrap_or_default();
        let staging = Staging::new()?;

        let (source_name, source) = match &options.base_image {
            Some(base) => (base.clone(), Reference::parse(base)?),
            None => (name.to_string(), reference.clone()),
        };

        let client = Arc::new(RegistryClient::with_config(
            source.registry(),
            keychain.resolve(source.registry())?,
            &client_config,
        )?);

        let resolved = resolve_image(&client, &source, &platform).await?;
        let (base_config, layers, exists, digest, family_oci) = match &resolved {
            Some(resolved) => {
                debug!(source = %source_name, digest = %resolved.digest, "opened image from registry");
                (
                    resolved.config.clone(),
                    remote_layers(&client, &source, resolved, &staging),
                    true,
                    Some(resolved.digest.clone()),
                    is_oci_family(&resolved.media_type),
                )
            }
            None => {
                debug!(source = %source_name, "reference not found, opening scratch image");
                let mut config = ConfigFile::scratch(&platform.os, &platform.architecture);
                config.os_version = platform.os_version.clone();
                (config, Vec::new(), false, None, false)
            }
        };

        let (manifest_media_type, config_media_type, layer_media_type) = if family_oci {
            (OCI_MANIFEST, OCI_CONFIG, OCI_LAYER)
        } else {
            (DOCKER_MANIFEST, DOCKER_CONFIG, DOCKER_LAYER)
        };

        let previous_name = match &options.previous_image {
            Some(prev) => Some(Reference::parse(prev)?),
            None => None,
        };

        let client_registry = source.registry().to_string();
        Ok(Self {
            keychain,
            client_config,
            client,
            client_registry,
            data: ImageData::new(
                name,
                reference,
                previous_name,
                base_config,
                layers,
                exists,
                digest,
                layer_media_type.to_string(),
                staging,
            ),
            platform,
            manifest_media_type: manifest_media_type.to_string(),
            config_media_type: config_media_type.to_string(),
            previous_image_raw: options.previous_image,
            previous_layers: None,
        })
    }

    pub(crate) fn data_mut(&mut self) -> &mut ImageData {
        &mut self.data
    }

    /// Manifest and config media types this image will emit on save.
    pub(crate) fn emitted_media_types(&self) -> (&str, &str) {
        (&self.manifest_media_type, &self.config_media_type)
    }

    /// Returns a client for a registry, reusing the open-time client
    /// when the host matches. Credentials are resolved once per host.
    fn client_for(&self, registry: &str) -> Result<Arc<RegistryClient>> {
        if registry == self.client_registry {
            return Ok(self.client.clone());
        }
        Ok(Arc::new(RegistryClient::with_config(
            registry,
            self.keychain.resolve(registry)?,
            &self.client_config,
        )?))
    }

    /// The raw reference string `reuse_layer` reads from.
    fn reuse_source_name(&self) -> String {
        self.previous_image_raw
            .clone()
            .unwrap_or_else(|| self.data.raw_name().to_string())
    }

    /// Resolves the previous image's layer pool once and caches it.
    async fn previous_layers(&mut self) -> Result<&[Layer]> {
        if self.previous_layers.is_none() {
            let source_name = self.reuse_source_name();
            let source = self.data.reuse_source();
            let client = self.client_for(source.registry())?;
            let resolved = resolve_image(&client, &source, &self.platform)
                .await?
                .ok_or_else(|| ImageError::PreviousImageNotFound(source_name.clone()))?;
            debug!(
                previous = %source_name,
                layers = resolved.manifest.layers.len(),
                "resolved previous image for layer reuse"
            );
            self.previous_layers = Some(remote_layers(
                &client,
                &source,
                &resolved,
                &self.data.staging,
            ));
        }
        Ok(self.previous_layers.as_deref().unwrap_or_default())
    }
}

impl BaseImage for RemoteImage {
    fn config_file(&self) -> &ConfigFile {
        &self.data.config
    }

    fn layers(&self) -> &[Layer] {
        &self.data.layers
    }
}

#[async_trait]
impl Image for RemoteImage {
    fn name(&self) -> &str {
        self.data.raw_name()
    }

    fn rename(&mut self, name: &str) -> Result<()> {
        self.data.rename(name)?;
        // The reuse pool follows the reference when no explicit
        // previous image was configured.
        if self.previous_image_raw.is_none() {
            self.previous_layers = None;
        }
        Ok(())
    }

    fn label(&self, key: &str) -> Result<String> {
        self.data.label(key)
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.data.set_label(key, value);
        Ok(())
    }

    fn env(&self, key: &str) -> Result<String> {
        self.data.env(key)
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.data.set_env(key, value);
        Ok(())
    }

    fn set_entrypoint(&mut self, entrypoint: Vec<String>) -> Result<()> {
        self.data.set_entrypoint(entrypoint);
        Ok(())
    }

    fn set_cmd(&mut self, cmd: Vec<String>) -> Result<()> {
        self.data.set_cmd(cmd);
        Ok(())
    }

    fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.data.set_working_dir(dir);
        Ok(())
    }

    fn os(&self) -> String {
        self.data.os()
    }

    fn os_version(&self) -> Option<String> {
        self.data.os_version()
    }

    fn architecture(&self) -> String {
        self.data.architecture()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at()
    }

    fn digest(&self) -> Result<Digest> {
        self.data.digest()
    }

    fn top_layer(&self) -> Result<Digest> {
        self.data.top_layer()
    }

    fn add_layer(&mut self, path: &std::path::Path) -> Result<()> {
        self.data.add_layer(path)
    }

    fn add_layer_with_diff_id(&mut self, path: &std::path::Path, diff_id: &str) -> Result<()> {
        self.data.add_layer_with_diff_id(path, diff_id)
    }

    fn rebase(&mut self, old_top_diff_id: &str, new_base: &dyn BaseImage) -> Result<()> {
        self.data.rebase(old_top_diff_id, new_base)
    }

    async fn found(&self) -> Result<bool> {
        let client = self.client_for(self.data.name.registry())?;
        client
            .manifest_exists(
                self.data.name.repository(),
                &self.data.name.manifest_reference(),
            )
            .await
    }

    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn std::io::Read + Send>> {
        self.data.layer_by_diff_id(diff_id)?.uncompressed().await
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let pool = self.previous_layers().await?;
        let mut found = None;
        for layer in pool {
            if layer.diff_id()?.matches(diff_id) {
                found = Some(layer.clone());
                break;
            }
        }
        let layer = found
            .ok_or_else(|| ImageError::PreviousLayerNotFound(diff_id.to_string()))?;
        let layer_diff_id = layer.diff_id()?;
        self.data.push_layer(layer, layer_diff_id);
        Ok(())
    }

    async fn save(&mut self, additional_names: &[&str]) -> Result<String> {
        let created = self.data.pin_created();
        let config = self.data.config_for_save(created);
        let repository = self.data.name.repository().to_string();
        let dest_registry = self.data.name.registry().to_string();
        let client = self.client_for(&dest_registry)?;

        // Layer blobs first, in parallel on a bounded worker set. Order
        // of the returned descriptors follows the stack.
        let semaphore = Arc::new(Semaphore::new(self.client_config.upload_concurrency()));
        let mut uploads = Vec::with_capacity(self.data.layers.len());
        for layer in self.data.layers.iter().cloned() {
            uploads.push(ensure_blob(
                client.clone(),
                repository.clone(),
                dest_registry.clone(),
                semaphore.clone(),
                layer,
            ));
        }
        let layer_descriptors = futures::future::try_join_all(uploads).await?;

        // Config blob.
        let config_bytes = serde_json::to_vec(&config)?;
        let config_descriptor = Descriptor::of_bytes(self.config_media_type.clone(), &config_bytes);
        if !client
            .blob_exists(&repository, &config_descriptor.digest)
            .await?
        {
            client
                .upload_blob_bytes(&repository, &config_descriptor.digest, config_bytes)
                .await?;
        }

        // Manifest last: it must observe every blob as present.
        let manifest = Manifest {
            schema_version: 2,
            media_type: self.manifest_media_type.clone(),
            config: config_descriptor,
            layers: layer_descriptors,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = client
            .put_manifest(
                &repository,
                &self.data.name.manifest_reference(),
                &self.manifest_media_type,
                manifest_bytes.clone(),
            )
            .await?;

        for additional in additional_names {
            let reference = Reference::parse(additional)?;
            let client = self.client_for(reference.registry())?;
            client
                .put_manifest(
                    reference.repository(),
                    &reference.manifest_reference(),
                    &self.manifest_media_type,
                    manifest_bytes.clone(),
                )
                .await?;
        }

        info!(
            name = %self.data.raw_name(),
            digest = %digest,
            layers = manifest.layers.len(),
            "saved image to registry"
        );
        self.data.complete_save(config, digest.clone());
        Ok(digest.to_string())
    }

    async fn delete(&mut self) -> Result<()> {
        let client = self.client_for(self.data.name.registry())?;
        let fetched = client
            .get_manifest(
                self.data.name.repository(),
                &self.data.name.manifest_reference(),
            )
            .await?
            .ok_or_else(|| ImageError::ImageNotFound {
                field: "manifest",
                name: self.data.raw_name().to_string(),
            })?;
        client
            .delete_manifest(self.data.name.repository(), &fetched.digest)
            .await
    }
}

/// Makes one layer's compressed blob present at the destination:
/// HEAD-skip, then a cross-repository mount attempt, then a streamed
/// upload. Returns the layer's descriptor.
async fn ensure_blob(
    client: Arc<RegistryClient>,
    repository: String,
    dest_registry: String,
    semaphore: Arc<Semaphore>,
    layer: Layer,
) -> Result<Descriptor> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| ImageError::Registry(format!("upload scheduling failed: {}", e)))?;

    let descriptor = layer.descriptor().await?;
    if client.blob_exists(&repository, &descriptor.digest).await? {
        debug!(digest = %descriptor.digest, "blob already present, skipping upload");
        return Ok(descriptor);
    }

    if let Some((source_registry, source_repository)) = layer.remote_source() {
        if source_registry == dest_registry && source_repository != repository {
            if client
                .mount_blob(&repository, &descriptor.digest, source_repository)
                .await?
            {
                debug!(
                    digest = %descriptor.digest,
                    from = source_repository,
                    "mounted blob across repositories"
                );
                return Ok(descriptor);
            }
        }
    }

    let path = layer.compressed_path().await?;
    client
        .upload_blob_file(&repository, &descriptor.digest, descriptor.size, &path)
        .await?;
    Ok(descriptor)
}

fn is_oci_family(media_type: &str) -> bool {
    media_type.contains("vnd.oci")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_family_detection() {
        assert!(is_oci_family(OCI_MANIFEST));
        assert!(!is_oci_family(DOCKER_MANIFEST));
        assert!(!is_oci_family(""));
    }
}
