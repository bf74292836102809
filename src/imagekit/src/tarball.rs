//! Tarball-backed images and layout writers.
//!
//! A [`TarballImage`] opens like a remote image but saves to a single
//! tarball on disk, in one of two layouts:
//!
//! - [`Layout::Docker`]: `manifest.json` listing a content-addressed
//!   config and the layer files; the format a container daemon loads.
//! - [`Layout::Oci`]: the OCI image layout (`oci-layout` marker,
//!   `blobs/sha256/*`, `index.json`).
//!
//! Layer bytes are streamed from staged files into the tar writer;
//! duplicate blobs are written once.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use imagekit_core::error::{ImageError, Result};

use crate::config::ConfigFile;
use crate::credentials::Keychain;
use crate::descriptor::{Descriptor, Digest, OCI_INDEX};
use crate::image::{BaseImage, Image, ImageOptions};
use crate::layer::Layer;
use crate::manifest::Manifest;
use crate::reference::Reference;
use crate::remote::RemoteImage;

/// OCI image layout marker contents.
const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Serialization format for the output tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `manifest.json` + content-addressed config and layer files.
    Docker,
    /// `oci-layout` + `blobs/sha256/*` + `index.json`.
    Oci,
}

/// One entry of a Docker-layout `manifest.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DockerManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// An image serialized to a tarball on save.
pub struct TarballImage {
    base: RemoteImage,
    path: PathBuf,
    layout: Layout,
}

impl TarballImage {
    /// Opens an image named `name` (resolved against its registry, or
    /// scratch) that will serialize to `path` on save.
    pub async fn new(
        name: &str,
        keychain: Arc<dyn Keychain>,
        path: impl Into<PathBuf>,
        layout: Layout,
        options: ImageOptions,
    ) -> Result<Self> {
        Ok(Self {
            base: RemoteImage::new(name, keychain, options).await?,
            path: path.into(),
            layout,
        })
    }

    /// The path the tarball is written to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BaseImage for TarballImage {
    fn config_file(&self) -> &ConfigFile {
        self.base.config_file()
    }

    fn layers(&self) -> &[Layer] {
        self.base.layers()
    }
}

#[async_trait]
impl Image for TarballImage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn rename(&mut self, name: &str) -> Result<()> {
        self.base.rename(name)
    }

    fn label(&self, key: &str) -> Result<String> {
        self.base.label(key)
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.base.set_label(key, value)
    }

    fn env(&self, key: &str) -> Result<String> {
        self.base.env(key)
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.base.set_env(key, value)
    }

    fn set_entrypoint(&mut self, entrypoint: Vec<String>) -> Result<()> {
        self.base.set_entrypoint(entrypoint)
    }

    fn set_cmd(&mut self, cmd: Vec<String>) -> Result<()> {
        self.base.set_cmd(cmd)
    }

    fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.base.set_working_dir(dir)
    }

    fn os(&self) -> String {
        self.base.os()
    }

    fn os_version(&self) -> Option<String> {
        self.base.os_version()
    }

    fn architecture(&self) -> String {
        self.base.architecture()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.base.created_at()
    }

    fn digest(&self) -> Result<Digest> {
        self.base.digest()
    }

    fn top_layer(&self) -> Result<Digest> {
        self.base.top_layer()
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        self.base.add_layer(path)
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        self.base.add_layer_with_diff_id(path, diff_id)
    }

    fn rebase(&mut self, old_top_diff_id: &str, new_base: &dyn BaseImage) -> Result<()> {
        self.base.rebase(old_top_diff_id, new_base)
    }

    async fn found(&self) -> Result<bool> {
        self.base.found().await
    }

    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn std::io::Read + Send>> {
        self.base.get_layer(diff_id).await
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        self.base.reuse_layer(diff_id).await
    }

    async fn save(&mut self, additional_names: &[&str]) -> Result<String> {
        let (manifest_media_type, config_media_type) = {
            let (m, c) = self.base.emitted_media_types();
            (m.to_string(), c.to_string())
        };
        let data = self.base.data_mut();
        let created = data.pin_created();
        let config = data.config_for_save(created);

        let digest = match self.layout {
            Layout::Oci => {
                write_oci_layout(
                    &self.path,
                    &config,
                    data.layers.as_slice(),
                    &manifest_media_type,
                    &config_media_type,
                )
                .await?
            }
            Layout::Docker => {
                let mut repo_tags = Vec::new();
                if let Some(tag) = repo_tag(&data.name) {
                    repo_tags.push(tag);
                }
                for additional in additional_names {
                    if let Some(tag) = repo_tag(&Reference::parse(additional)?) {
                        repo_tags.push(tag);
                    }
                }
                write_docker_layout(
                    &self.path,
                    &config,
                    data.layers.as_slice(),
                    &config_media_type,
                    &manifest_media_type,
                    &repo_tags,
                )
                .await?
            }
        };

        info!(
            path = %self.path.display(),
            digest = %digest,
            "serialized image to tarball"
        );
        data.complete_save(config, digest.clone());
        Ok(digest.to_string())
    }

    async fn delete(&mut self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// The `RepoTags` entry for a reference; digest-only references have no
/// tag to record.
pub(crate) fn repo_tag(reference: &Reference) -> Option<String> {
    let tag = reference.tag()?;
    let name = if reference.registry() == "docker.io" {
        reference
            .repository()
            .strip_prefix("library/")
            .unwrap_or(reference.repository())
            .to_string()
    } else {
        format!("{}/{}", reference.registry(), reference.repository())
    };
    Some(format!("{}:{}", name, tag))
}

/// Serializes an image as an OCI image layout tarball. Returns the
/// canonical manifest digest.
pub(crate) async fn write_oci_layout(
    path: &Path,
    config: &ConfigFile,
    layers: &[Layer],
    manifest_media_type: &str,
    config_media_type: &str,
) -> Result<Digest> {
    let (config_bytes, manifest, manifest_bytes) =
        build_documents(config, layers, config_media_type, manifest_media_type).await?;
    let manifest_digest = Digest::sha256_of(&manifest_bytes);

    let file = File::create(path)?;
    let mut builder = tar::Builder::new(file);
    let mut written: HashSet<String> = HashSet::new();

    append_bytes(&mut builder, "oci-layout", OCI_LAYOUT_MARKER.as_bytes())?;

    let config_name = format!("blobs/sha256/{}", manifest.config.digest.hex());
    append_bytes(&mut builder, &config_name, &config_bytes)?;
    written.insert(config_name);

    let manifest_name = format!("blobs/sha256/{}", manifest_digest.hex());
    append_bytes(&mut builder, &manifest_name, &manifest_bytes)?;
    written.insert(manifest_name);

    for (layer, descriptor) in layers.iter().zip(manifest.layers.iter()) {
        let name = format!("blobs/sha256/{}", descriptor.digest.hex());
        if !written.insert(name.clone()) {
            continue;
        }
        let staged = layer.compressed_path().await?;
        append_file(&mut builder, &name, &staged, descriptor.size)?;
    }

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [{
            "mediaType": manifest_media_type,
            "digest": manifest_digest.to_string(),
            "size": manifest_bytes.len(),
        }]
    });
    append_bytes(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;

    let mut file = builder.into_inner()?;
    file.flush()?;
    debug!(path = %path.display(), blobs = written.len(), "wrote OCI layout tarball");
    Ok(manifest_digest)
}

/// Serializes an image as a Docker-layout tarball (the format a daemon
/// loads). Returns the canonical manifest digest.
pub(crate) async fn write_docker_layout(
    path: &Path,
    config: &ConfigFile,
    layers: &[Layer],
    config_media_type: &str,
    manifest_media_type: &str,
    repo_tags: &[String],
) -> Result<Digest> {
    let (config_bytes, manifest, manifest_bytes) =
        build_documents(config, layers, config_media_type, manifest_media_type).await?;
    let manifest_digest = Digest::sha256_of(&manifest_bytes);

    let file = File::create(path)?;
    let mut builder = tar::Builder::new(file);
    let mut written: HashSet<String> = HashSet::new();

    let config_name = format!("{}.json", manifest.config.digest.hex());
    append_bytes(&mut builder, &config_name, &config_bytes)?;

    let mut layer_names = Vec::with_capacity(layers.len());
    for (layer, descriptor) in layers.iter().zip(manifest.layers.iter()) {
        let name = format!("{}.tar.gz", descriptor.digest.hex());
        layer_names.push(name.clone());
        if !written.insert(name.clone()) {
            continue;
        }
        let staged = layer.compressed_path().await?;
        append_file(&mut builder, &name, &staged, descriptor.size)?;
    }

    let entries = vec![DockerManifestEntry {
        config: config_name,
        repo_tags: repo_tags.to_vec(),
        layers: layer_names,
    }];
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&entries)?)?;

    let mut file = builder.into_inner()?;
    file.flush()?;
    debug!(path = %path.display(), layers = layers.len(), "wrote Docker layout tarball");
    Ok(manifest_digest)
}

/// Serializes the config and manifest documents for a layer stack.
async fn build_documents(
    config: &ConfigFile,
    layers: &[Layer],
    config_media_type: &str,
    manifest_media_type: &str,
) -> Result<(Vec<u8>, Manifest, Vec<u8>)> {
    let config_bytes = serde_json::to_vec(config)?;
    let mut layer_descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        layer_descriptors.push(layer.descriptor().await?);
    }
    let manifest = Manifest {
        schema_version: 2,
        media_type: manifest_media_type.to_string(),
        config: Descriptor::of_bytes(config_media_type, &config_bytes),
        layers: layer_descriptors,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    Ok((config_bytes, manifest, manifest_bytes))
}

/// Appends an in-memory document as a 0644 tar entry.
fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Appends a staged blob as a 0644 tar entry, streaming its bytes.
fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    path: &Path,
    size: i64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, File::open(path)?)?;
    Ok(())
}
