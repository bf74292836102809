//! The mutable image model and its operation surface.
//!
//! [`ImageData`] is the backend-independent state of an image being
//! edited: the reference it targets, the configuration inherited from
//! its base, the working configuration, and the layer stack. The three
//! backends wrap it and add their own open and save paths.
//!
//! [`BaseImage`] and [`Image`] form the capability set shared by every
//! backend; rebase accepts any [`BaseImage`], so a new base can come
//! from a different backend than the image being rebased.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use imagekit_core::error::{ImageError, Result};

use crate::config::{ConfigFile, History};
use crate::descriptor::Digest;
use crate::layer::{Layer, Staging};
use crate::reference::Reference;

/// Options accepted when opening an image, shared by all backends.
#[derive(Default)]
pub struct ImageOptions {
    /// Seed configuration and layers from this reference instead of the
    /// image's own name.
    pub base_image: Option<String>,
    /// Reference consulted by `reuse_layer`. Defaults to the image's
    /// current (possibly renamed) reference.
    pub previous_image: Option<String>,
    /// Platform used to resolve multi-platform indexes and to seed
    /// scratch configurations. Defaults to `linux`/`amd64`.
    pub platform: Option<crate::manifest::Platform>,
    /// HTTP and transfer tuning. Defaults apply when unset.
    pub client_config: Option<imagekit_core::config::ClientConfig>,
}

/// Backend-independent mutable image state.
pub(crate) struct ImageData {
    /// The reference string exactly as the caller supplied it.
    raw_name: String,
    /// Parsed form of `raw_name`.
    pub name: Reference,
    pub previous_name: Option<Reference>,
    pub base_config: ConfigFile,
    pub config: ConfigFile,
    pub layers: Vec<Layer>,
    /// Whether the opened source resolved to a manifest.
    pub exists: bool,
    /// Manifest digest observed at open or produced by the last save.
    digest: Option<Digest>,
    /// Set once any mutation lands; cleared by a completed save.
    dirty: bool,
    /// Timestamp pinned by the first save attempt so retries and
    /// unmodified re-saves produce identical bytes.
    pending_created: Option<DateTime<Utc>>,
    /// Media type given to layers added to this image.
    pub layer_media_type: String,
    /// Scratch space shared by this image's layer handles.
    pub staging: Staging,
}

impl ImageData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raw_name: &str,
        name: Reference,
        previous_name: Option<Reference>,
        base_config: ConfigFile,
        layers: Vec<Layer>,
        exists: bool,
        digest: Option<Digest>,
        layer_media_type: String,
        staging: Staging,
    ) -> Self {
        Self {
            raw_name: raw_name.to_string(),
            name,
            previous_name,
            config: base_config.clone(),
            base_config,
            layers,
            exists,
            digest,
            dirty: false,
            pending_created: None,
            layer_media_type,
            staging,
        }
    }

    pub fn raw_name(&self) -> &str {
        &self.raw_name
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.pending_created = None;
    }

    // ------------------------------------------------------------------
    // Configuration reads and mutations
    // ------------------------------------------------------------------

    pub fn label(&self, key: &str) -> Result<String> {
        if !self.exists {
            return Err(ImageError::ImageNotFound {
                field: "label",
                name: self.raw_name.clone(),
            });
        }
        Ok(self.config.config.label(key).unwrap_or_default().to_string())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config.config.set_label(key, value);
        self.mark_dirty();
    }

    pub fn env(&self, key: &str) -> Result<String> {
        if !self.exists {
            return Err(ImageError::ImageNotFound {
                field: "env var",
                name: self.raw_name.clone(),
            });
        }
        Ok(self.config.config.env(key).unwrap_or_default().to_string())
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.config.config.set_env(key, value);
        self.mark_dirty();
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.config.config.entrypoint = Some(entrypoint);
        self.mark_dirty();
    }

    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.config.config.cmd = Some(cmd);
        self.mark_dirty();
    }

    pub fn set_working_dir(&mut self, dir: &str) {
        self.config.config.working_dir = Some(dir.to_string());
        self.mark_dirty();
    }

    /// Retargets the image without touching its contents.
    pub fn rename(&mut self, name: &str) -> Result<()> {
        self.name = Reference::parse(name)?;
        self.raw_name = name.to_string();
        Ok(())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.base_config.created.unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn os(&self) -> String {
        self.config.os.clone()
    }

    pub fn os_version(&self) -> Option<String> {
        self.config.os_version.clone()
    }

    pub fn architecture(&self) -> String {
        self.config.architecture.clone()
    }

    /// The manifest digest, defined for an unmodified opened image and
    /// again after a save.
    pub fn digest(&self) -> Result<Digest> {
        match &self.digest {
            Some(digest) if !self.dirty => Ok(digest.clone()),
            _ if !self.exists => Err(ImageError::ImageNotFound {
                field: "digest",
                name: self.raw_name.clone(),
            }),
            _ => Err(ImageError::Validation(format!(
                "image '{}' has been modified; digest is not available until save",
                self.raw_name
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Layer stack
    // ------------------------------------------------------------------

    pub fn top_layer(&self) -> Result<Digest> {
        self.config
            .rootfs
            .diff_ids
            .last()
            .cloned()
            .ok_or_else(|| ImageError::EmptyLayerStack(self.raw_name.clone()))
    }

    /// Appends a file-backed layer, computing its diff id now.
    pub fn add_layer(&mut self, path: &Path) -> Result<()> {
        let layer = Layer::from_tar_file(
            path,
            self.layer_media_type.clone(),
            self.staging.clone(),
        );
        let diff_id = layer.diff_id()?;
        debug!(path = %path.display(), diff_id = %diff_id, "adding layer");
        self.push_layer(layer, diff_id);
        Ok(())
    }

    /// Appends a file-backed layer, trusting the caller's diff id.
    pub fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        let diff_id = Digest::parse(diff_id)?;
        let layer = Layer::from_tar_file_with_diff_id(
            path,
            diff_id.clone(),
            self.layer_media_type.clone(),
            self.staging.clone(),
        );
        self.push_layer(layer, diff_id);
        Ok(())
    }

    /// Appends an existing handle (reuse path).
    pub fn push_layer(&mut self, layer: Layer, diff_id: Digest) {
        self.layers.push(layer);
        self.config.rootfs.diff_ids.push(diff_id);
        self.config.history.push(History {
            created: Some(Utc::now()),
            ..History::default()
        });
        self.mark_dirty();
    }

    /// Finds a layer by diff id, accepting both `sha256:hex` and bare
    /// hex forms.
    pub fn layer_by_diff_id(&self, diff_id: &str) -> Result<&Layer> {
        for layer in &self.layers {
            if layer.diff_id()?.matches(diff_id) {
                return Ok(layer);
            }
        }
        Err(ImageError::LayerNotFound {
            name: self.raw_name.clone(),
            diff_id: diff_id.to_string(),
        })
    }

    /// The reference `reuse_layer` draws from.
    pub fn reuse_source(&self) -> Reference {
        self.previous_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    // ------------------------------------------------------------------
    // Rebase
    // ------------------------------------------------------------------

    /// Replaces the base prefix ending at `old_top_diff_id` with the
    /// layers of `new_base`, keeping everything above.
    pub fn rebase(&mut self, old_top_diff_id: &str, new_base: &dyn BaseImage) -> Result<()> {
        // Lowest matching index: the prefix is the base.
        let mut split = None;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.diff_id()?.matches(old_top_diff_id) {
                split = Some(i);
                break;
            }
        }
        let split =
            split.ok_or_else(|| ImageError::BadOldTopLayer(old_top_diff_id.to_string()))?;

        let new_base_config = new_base.config_file();
        let top_layers: Vec<Layer> = self.layers[split + 1..].to_vec();
        let top_diff_ids: Vec<Digest> = self.config.rootfs.diff_ids[split + 1..].to_vec();
        let top_history = self.history_above(split, top_diff_ids.len());

        debug!(
            old_top = %old_top_diff_id,
            base_layers = new_base.layers().len(),
            kept_layers = top_layers.len(),
            "rebasing image"
        );

        self.layers = new_base
            .layers()
            .iter()
            .cloned()
            .chain(top_layers)
            .collect();
        self.config.rootfs.diff_ids = new_base_config
            .rootfs
            .diff_ids
            .iter()
            .cloned()
            .chain(top_diff_ids)
            .collect();
        self.config.history = new_base_config
            .history
            .iter()
            .cloned()
            .chain(top_history)
            .collect();

        // The platform follows the new base; everything else is kept.
        self.config.os = new_base_config.os.clone();
        self.config.architecture = new_base_config.architecture.clone();
        self.config.os_version = new_base_config.os_version.clone();

        self.mark_dirty();
        Ok(())
    }

    /// History entries strictly above layer index `split`. If the current
    /// history is not aligned with the layer stack, one plain entry per
    /// kept layer is synthesized so the alignment invariant holds.
    fn history_above(&self, split: usize, kept_layers: usize) -> Vec<History> {
        let mut non_empty_seen = 0;
        let mut cut = self.config.history.len();
        for (i, entry) in self.config.history.iter().enumerate() {
            if !entry.is_empty_layer() {
                non_empty_seen += 1;
                if non_empty_seen == split + 1 {
                    cut = i + 1;
                    break;
                }
            }
        }
        let kept: Vec<History> = self.config.history[cut.min(self.config.history.len())..].to_vec();
        let kept_non_empty = kept.iter().filter(|h| !h.is_empty_layer()).count();
        if kept_non_empty == kept_layers {
            kept
        } else {
            vec![History::default(); kept_layers]
        }
    }

    // ------------------------------------------------------------------
    // Save support
    // ------------------------------------------------------------------

    /// Pins (or re-reads) the timestamp the next save will stamp into
    /// the configuration.
    pub fn pin_created(&mut self) -> DateTime<Utc> {
        match self.pending_created {
            Some(t) => t,
            None => {
                let now = Utc::now();
                self.pending_created = Some(now);
                now
            }
        }
    }

    /// A copy of the working configuration stamped for saving. The live
    /// state is untouched so a failed save leaves nothing half-applied.
    pub fn config_for_save(&self, created: DateTime<Utc>) -> ConfigFile {
        let mut config = self.config.clone();
        config.created = Some(created);
        config
    }

    /// Commits the effects of a successful save to the in-memory state.
    pub fn complete_save(&mut self, config: ConfigFile, digest: Digest) {
        self.config = config.clone();
        self.base_config = config;
        self.digest = Some(digest);
        self.dirty = false;
        self.exists = true;
    }
}

/// The read surface rebase needs from a base image: its configuration
/// and its layer handles. Object safe, so a new base can come from any
/// backend.
pub trait BaseImage {
    fn config_file(&self) -> &ConfigFile;
    fn layers(&self) -> &[Layer];
}

/// The uniform image capability set implemented by every backend.
#[async_trait]
pub trait Image: BaseImage + Send {
    /// The reference string the image currently targets, exactly as
    /// supplied by the caller.
    fn name(&self) -> &str;

    /// Retargets the image without touching its contents.
    fn rename(&mut self, name: &str) -> Result<()>;

    /// A label value; the empty string for a missing key.
    fn label(&self, key: &str) -> Result<String>;

    fn set_label(&mut self, key: &str, value: &str) -> Result<()>;

    /// An environment variable value; the empty string for a missing key.
    fn env(&self, key: &str) -> Result<String>;

    fn set_env(&mut self, key: &str, value: &str) -> Result<()>;
    fn set_entrypoint(&mut self, entrypoint: Vec<String>) -> Result<()>;
    fn set_cmd(&mut self, cmd: Vec<String>) -> Result<()>;
    fn set_working_dir(&mut self, dir: &str) -> Result<()>;

    fn os(&self) -> String;
    fn os_version(&self) -> Option<String>;
    fn architecture(&self) -> String;

    /// Creation time of the opened base configuration.
    fn created_at(&self) -> DateTime<Utc>;

    /// The manifest digest of an unmodified opened image, or of the last
    /// save. Not defined between a mutation and the following save.
    fn digest(&self) -> Result<Digest>;

    /// Diff id of the topmost layer.
    fn top_layer(&self) -> Result<Digest>;

    /// Appends a layer from an uncompressed tar file.
    fn add_layer(&mut self, path: &Path) -> Result<()>;

    /// Appends a layer with a caller-asserted diff id.
    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()>;

    /// Replaces the base prefix ending at `old_top_diff_id` with the
    /// layers of `new_base`, keeping the stack above it.
    fn rebase(&mut self, old_top_diff_id: &str, new_base: &dyn BaseImage) -> Result<()>;

    /// Whether the image's name currently resolves at the backend.
    async fn found(&self) -> Result<bool>;

    /// An uncompressed tar reader for the layer with the given diff id.
    async fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>>;

    /// Pulls a layer from the previous image into this one by diff id.
    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()>;

    /// Publishes the image under its name and every additional name,
    /// returning its canonical content-addressed identifier.
    async fn save(&mut self, additional_names: &[&str]) -> Result<String>;

    /// Removes the image from the backend.
    async fn delete(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OCI_LAYER;

    /// Builds an uncompressed tar with the given files.
    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn test_data(exists: bool) -> ImageData {
        let staging = Staging::new().unwrap();
        ImageData::new(
            "ghcr.io/org/app:latest",
            Reference::parse("ghcr.io/org/app:latest").unwrap(),
            None,
            ConfigFile::scratch("linux", "amd64"),
            Vec::new(),
            exists,
            None,
            OCI_LAYER.to_string(),
            staging,
        )
    }

    fn add_tar_layer(data: &mut ImageData, contents: &[u8]) -> Digest {
        let tar = build_tar(&[("file.txt", contents)]);
        let path = data.staging.unique_path("fixture");
        std::fs::write(&path, &tar).unwrap();
        data.add_layer(&path).unwrap();
        data.config.rootfs.diff_ids.last().unwrap().clone()
    }

    struct FakeBase {
        config: ConfigFile,
        layers: Vec<Layer>,
    }

    impl BaseImage for FakeBase {
        fn config_file(&self) -> &ConfigFile {
            &self.config
        }
        fn layers(&self) -> &[Layer] {
            &self.layers
        }
    }

    fn base_with_layers(staging: &Staging, count: usize, seed: &str) -> FakeBase {
        let mut config = ConfigFile::scratch("linux", "arm64");
        let mut layers = Vec::new();
        for i in 0..count {
            let tar = build_tar(&[("base.txt", format!("{}-{}", seed, i).as_bytes())]);
            let layer = Layer::from_tar_bytes(tar, OCI_LAYER.to_string(), staging.clone());
            let diff_id = layer.diff_id().unwrap();
            config.rootfs.diff_ids.push(diff_id);
            config.history.push(History::default());
            layers.push(layer);
        }
        FakeBase { config, layers }
    }

    #[test]
    fn test_label_missing_image_errors() {
        let data = test_data(false);
        let err = data.label("mykey").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to get label, image 'ghcr.io/org/app:latest' does not exist"
        );
    }

    #[test]
    fn test_label_round_trip() {
        let mut data = test_data(true);
        assert_eq!(data.label("mykey").unwrap(), "");
        data.set_label("mykey", "myvalue");
        assert_eq!(data.label("mykey").unwrap(), "myvalue");
    }

    #[test]
    fn test_env_missing_image_errors() {
        let data = test_data(false);
        let err = data.env("MY_VAR").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to get env var, image 'ghcr.io/org/app:latest' does not exist"
        );
    }

    #[test]
    fn test_top_layer_empty_stack() {
        let data = test_data(true);
        let err = data.top_layer().unwrap_err();
        assert!(matches!(err, ImageError::EmptyLayerStack(_)));
    }

    #[test]
    fn test_add_layer_maintains_alignment() {
        let mut data = test_data(true);
        let first = add_tar_layer(&mut data, b"one");
        let second = add_tar_layer(&mut data, b"two");

        assert_eq!(data.layers.len(), 2);
        assert_eq!(data.config.rootfs.diff_ids.len(), 2);
        for (i, layer) in data.layers.iter().enumerate() {
            assert_eq!(layer.diff_id().unwrap(), data.config.rootfs.diff_ids[i]);
        }
        assert_eq!(data.config.non_empty_history_count(), 2);
        assert_eq!(data.top_layer().unwrap(), second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_rename_keeps_state() {
        let mut data = test_data(true);
        data.set_label("k", "v");
        data.rename("quay.io/other/name:tag").unwrap();
        assert_eq!(data.raw_name(), "quay.io/other/name:tag");
        assert_eq!(data.label("k").unwrap(), "v");
    }

    #[test]
    fn test_digest_rules() {
        let mut data = test_data(true);
        let opened = Digest::sha256_of(b"manifest");
        data.digest = Some(opened.clone());
        assert_eq!(data.digest().unwrap(), opened);

        data.set_label("k", "v");
        assert!(data.digest().is_err());

        let created = data.pin_created();
        let saved_config = data.config_for_save(created);
        data.complete_save(saved_config, Digest::sha256_of(b"manifest-2"));
        assert_eq!(data.digest().unwrap(), Digest::sha256_of(b"manifest-2"));
    }

    #[test]
    fn test_pin_created_stable_until_mutation() {
        let mut data = test_data(true);
        let first = data.pin_created();
        assert_eq!(data.pin_created(), first);
        data.set_label("k", "v");
        // a mutation clears the pin; the next save gets a fresh stamp
        assert!(data.pin_created() >= first);
    }

    #[test]
    fn test_rebase_splices_base() {
        let mut data = test_data(true);
        let staging = data.staging.clone();

        let old_base = base_with_layers(&staging, 2, "old");
        data.rebase_seed_for_test(&old_base);
        let old_top = data.config.rootfs.diff_ids[1].clone();
        let kept_a = add_tar_layer(&mut data, b"app-1");
        let kept_b = add_tar_layer(&mut data, b"app-2");

        let new_base = base_with_layers(&staging, 3, "new");
        data.rebase(&old_top.to_string(), &new_base).unwrap();

        let mut expected: Vec<Digest> = new_base.config.rootfs.diff_ids.clone();
        expected.push(kept_a);
        expected.push(kept_b);
        assert_eq!(data.config.rootfs.diff_ids, expected);
        assert_eq!(data.layers.len(), 5);
        for (i, layer) in data.layers.iter().enumerate() {
            assert_eq!(layer.diff_id().unwrap(), data.config.rootfs.diff_ids[i]);
        }

        // platform follows the new base, config mutations are preserved
        assert_eq!(data.architecture(), "arm64");
        assert_eq!(data.config.non_empty_history_count(), 5);
    }

    #[test]
    fn test_rebase_unknown_old_top() {
        let mut data = test_data(true);
        add_tar_layer(&mut data, b"only");
        let new_base = base_with_layers(&data.staging.clone(), 1, "new");
        let err = data.rebase("sha256:ffff", &new_base).unwrap_err();
        assert!(matches!(err, ImageError::BadOldTopLayer(_)));
    }

    #[test]
    fn test_layer_by_diff_id() {
        let mut data = test_data(true);
        let diff_id = add_tar_layer(&mut data, b"content");
        assert!(data.layer_by_diff_id(&diff_id.to_string()).is_ok());
        assert!(data.layer_by_diff_id(diff_id.hex()).is_ok());
        let err = data.layer_by_diff_id("sha256:dead").unwrap_err();
        assert!(matches!(err, ImageError::LayerNotFound { .. }));
    }

    #[test]
    fn test_reuse_source_prefers_previous() {
        let mut data = test_data(true);
        assert_eq!(data.reuse_source(), data.name);
        data.previous_name = Some(Reference::parse("ghcr.io/org/prev:latest").unwrap());
        assert_eq!(
            data.reuse_source(),
            Reference::parse("ghcr.io/org/prev:latest").unwrap()
        );
    }

    impl ImageData {
        /// Test helper: adopt a base's layers as the current stack.
        fn rebase_seed_for_test(&mut self, base: &FakeBase) {
            self.layers = base.layers.clone();
            self.config.rootfs.diff_ids = base.config.rootfs.diff_ids.clone();
            self.config.history = base.config.history.clone();
        }
    }
}
