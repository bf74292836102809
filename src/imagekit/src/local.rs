//! Daemon-backed images.
//!
//! Opens an image from a local container daemon's inspect data and saves
//! by loading a Docker-layout tarball back into the daemon. Base layer
//! bytes are materialized lazily from a single cached `image_save`
//! export; images that only mutate configuration never export at all.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use imagekit_core::error::{ImageError, Result};

use crate::config::{ConfigFile, History, RootFs, ROOTFS_TYPE_LAYERS};
use crate::daemon::ContainerDaemon;
use crate::descriptor::{Digest, DOCKER_CONFIG, DOCKER_LAYER, DOCKER_MANIFEST};
use crate::image::{BaseImage, Image, ImageData, ImageOptions};
use crate::layer::{Layer, Staging, TarSource};
use crate::reference::Reference;
use crate::tarball::{repo_tag, write_docker_layout, DockerManifestEntry};

/// A lazily materialized daemon export: one `image_save` call shared by
/// every layer of the exported image, unpacked into staging and keyed by
/// diff id.
struct LocalExport {
    daemon: Arc<dyn ContainerDaemon>,
    image: String,
    staging: Staging,
    layers: OnceCell<HashMap<String, PathBuf>>,
}

impl LocalExport {
    fn new(daemon: Arc<dyn ContainerDaemon>, image: String, staging: Staging) -> Self {
        Self {
            daemon,
            image,
            staging,
            layers: OnceCell::new(),
        }
    }

    async fn materialize(&self) -> Result<HashMap<String, PathBuf>> {
        debug!(image = %self.image, "exporting image from daemon");
        let mut stream = self.daemon.image_save(&self.image).await?;

        let export_tar = self.staging.unique_path("export");
        {
            let mut file = tokio::fs::File::create(&export_tar).await?;
            tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
        }

        let root = self.staging.unique_path("export-root");
        std::fs::create_dir_all(&root)?;
        let mut archive = tar::Archive::new(File::open(&export_tar)?);
        archive.unpack(&root)?;

        let manifest_bytes = std::fs::read(root.join("manifest.json"))?;
        let entries: Vec<DockerManifestEntry> = serde_json::from_slice(&manifest_bytes)?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            ImageError::Daemon(format!("export of '{}' has an empty manifest", self.image))
        })?;

        let config: ConfigFile =
            serde_json::from_slice(&std::fs::read(root.join(&entry.config))?)?;
        if entry.layers.len() != config.rootfs.diff_ids.len() {
            return Err(ImageError::Daemon(format!(
                "export of '{}' lists {} layers but its config has {} diff ids",
                self.image,
                entry.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        let mut map = HashMap::new();
        for (layer_rel, diff_id) in entry.layers.iter().zip(config.rootfs.diff_ids.iter()) {
            let out = self.staging.unique_path("export-layer");
            write_uncompressed(&root.join(layer_rel), &out)?;
            map.insert(diff_id.hex().to_string(), out);
        }
        debug!(image = %self.image, layers = map.len(), "materialized daemon export");
        Ok(map)
    }
}

#[async_trait]
impl TarSource for LocalExport {
    async fn tar_path(&self, diff_id: &Digest) -> Result<PathBuf> {
        let layers = self
            .layers
            .get_or_try_init(|| self.materialize())
            .await?;
        layers.get(diff_id.hex()).cloned().ok_or_else(|| {
            ImageError::Daemon(format!(
                "export of '{}' does not contain layer {}",
                self.image, diff_id
            ))
        })
    }
}

/// Copies a layer file, transparently decompressing gzipped entries so
/// the result is always an uncompressed tar.
fn write_uncompressed(src: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 2];
    let read = File::open(src)?.read(&mut magic)?;
    let file = File::open(src)?;
    let mut out = File::create(dest)?;
    if read == 2 && magic == [0x1f, 0x8b] {
        std::io::copy(&mut GzDecoder::new(file), &mut out)?;
    } else {
        let mut file = file;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

/// The previous image's layer pool for reuse, resolved once per source.
struct PreviousPool {
    name: String,
    diff_ids: Vec<Digest>,
    export: Arc<LocalExport>,
}

/// An image bound to a local container daemon.
pub struct LocalImage {
    daemon: Arc<dyn ContainerDaemon>,
    data: ImageData,
    previous_image_raw: Option<String>,
    previous_pool: Option<PreviousPool>,
}

impl LocalImage {
    /// Opens an image known to the daemon, or a scratch image when the
    /// reference is unknown.
    pub async fn new(
        name: &str,
        daemon: Arc<dyn ContainerDaemon>,
        options: ImageOptions,
    ) -> Result<Self> {
        let reference = Reference::parse(name)?;
        let platform = options.platform.clone().unwrap_or_default();
        let staging = Staging::new()?;

        let source_name = options.base_image.clone().unwrap_or_else(|| name.to_string());
        let inspected = daemon.image_inspect(&source_name).await?;

        let (base_config, layers, exists, digest) = match inspected {
            Some(image) => {
                debug!(source = %source_name, id = %image.id, "opened image from daemon");
                let history = image
                    .diff_ids
                    .iter()
                    .map(|_| History {
                        created: image.created,
                        ..History::default()
                    })
                    .collect();
                let config = ConfigFile {
                    architecture: image.architecture,
                    os: image.os,
                    os_version: image.os_version,
                    created: image.created,
                    config: image.config,
                    rootfs: RootFs {
                        kind: ROOTFS_TYPE_LAYERS.to_string(),
                        diff_ids: image.diff_ids.clone(),
                    },
                    history,
                };
                let export = Arc::new(LocalExport::new(
                    daemon.clone(),
                    source_name.clone(),
                    staging.clone(),
                ));
                let layers = image
                    .diff_ids
                    .iter()
                    .map(|diff_id| {
                        Layer::from_deferred(
                            export.clone(),
                            diff_id.clone(),
                            DOCKER_LAYER,
                            staging.clone(),
                        )
                    })
                    .collect();
                let digest = Digest::parse(&image.id).ok();
                (config, layers, true, digest)
            }
            None => {
                debug!(source = %source_name, "daemon does not know reference, opening scratch image");
                let mut config = ConfigFile::scratch(&platform.os, &platform.architecture);
                config.os_version = platform.os_version.clone();
                (config, Vec::new(), false, None)
            }
        };

        let previous_name = match &options.previous_image {
            Some(prev) => Some(Reference::parse(prev)?),
            None => None,
        };

        Ok(Self {
            daemon,
            data: ImageData::new(
                name,
                reference,
                previous_name,
                base_config,
                layers,
                exists,
                digest,
                DOCKER_LAYER.to_string(),
                staging,
            ),
            previous_image_raw: options.previous_image,
            previous_pool: None,
        })
    }

    /// Asks the daemon to pull the image this handle targets.
    pub async fn pull(&self) -> Result<()> {
        self.daemon.image_pull(self.data.raw_name()).await
    }

    fn reuse_source_name(&self) -> String {
        self.previous_image_raw
            .clone()
            .unwrap_or_else(|| self.data.raw_name().to_string())
    }

    async fn previous_pool(&mut self) -> Result<&PreviousPool> {
        let source_name = self.reuse_source_name();
        let stale = match &self.previous_pool {
            Some(pool) => pool.name != source_name,
            None => true,
        };
        if stale {
            let inspected = self
                .daemon
                .image_inspect(&source_name)
                .await?
                .ok_or_else(|| ImageError::PreviousImageNotFound(source_name.clone()))?;
            debug!(
                previous = %source_name,
                layers = inspected.diff_ids.len(),
                "resolved previous image for layer reuse"
            );
            let export = Arc::new(LocalExport::new(
                self.daemon.clone(),
                source_name.clone(),
                self.data.staging.clone(),
            ));
            self.previous_pool = Some(PreviousPool {
                name: source_name,
                diff_ids: inspected.diff_ids,
                export,
            });
        }
        Ok(self
            .previous_pool
            .as_ref()
            .expect("previous pool was just resolved"))
    }
}

impl BaseImage for LocalImage {
    fn config_file(&self) -> &ConfigFile {
        &self.data.config
    }

    fn layers(&self) -> &[Layer] {
        &self.data.layers
    }
}

#[async_trait]
impl Image for LocalImage {
    fn name(&self) -> &str {
        self.data.raw_name()
    }

    fn rename(&mut self, name: &str) -> Result<()> {
        self.data.rename(name)
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

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        self.data.add_layer(path)
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        self.data.add_layer_with_diff_id(path, diff_id)
    }

    fn rebase(&mut self, old_top_diff_id: &str, new_base: &dyn BaseImage) -> Result<()> {
        self.data.rebase(old_top_diff_id, new_base)
    }

    async fn found(&self) -> Result<bool> {
        Ok(self
            .daemon
            .image_inspect(self.data.raw_name())
            .await?
            .is_some())
    }

    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        self.data.layer_by_diff_id(diff_id)?.uncompressed().await
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let pool = self.previous_pool().await?;
        let matched = pool
            .diff_ids
            .iter()
            .find(|candidate| candidate.matches(diff_id))
            .cloned();
        let (export, matched) = match matched {
            Some(matched) => (pool.export.clone(), matched),
            None => return Err(ImageError::PreviousLayerNotFound(diff_id.to_string())),
        };
        let layer = Layer::from_deferred(
            export,
            matched.clone(),
            DOCKER_LAYER,
            self.data.staging.clone(),
        );
        self.data.push_layer(layer, matched);
        Ok(())
    }

    async fn save(&mut self, additional_names: &[&str]) -> Result<String> {
        let created = self.data.pin_created();
        let config = self.data.config_for_save(created);

        let mut repo_tags = Vec::new();
        if let Some(tag) = repo_tag(&self.data.name) {
            repo_tags.push(tag);
        }
        for additional in additional_names {
            if let Some(tag) = repo_tag(&Reference::parse(additional)?) {
                repo_tags.push(tag);
            }
        }

        let tarball = self.data.staging.unique_path("load");
        let manifest_digest = write_docker_layout(
            &tarball,
            &config,
            self.data.layers.as_slice(),
            DOCKER_CONFIG,
            DOCKER_MANIFEST,
            &repo_tags,
        )
        .await?;

        let file = tokio::fs::File::open(&tarball).await?;
        let id = self.daemon.image_load(Box::new(file)).await?;
        info!(
            name = %self.data.raw_name(),
            id = %id,
            layers = self.data.layers.len(),
            "loaded image into daemon"
        );

        // The daemon is the authority for the loaded image's identity;
        // fall back to the manifest digest if its id is not a digest.
        let digest = Digest::parse(&id).unwrap_or(manifest_digest);
        self.data.complete_save(config, digest);
        Ok(id)
    }

    async fn delete(&mut self) -> Result<()> {
        self.daemon.image_remove(self.data.raw_name()).await
    }
}
