//! Lazy layer handles.
//!
//! A [`Layer`] is a cheaply clonable handle over layer bytes that may
//! live in a registry, in a local tar file, in memory, or behind a
//! deferred export. Digests and sizes are computed on first observation
//! and memoized; once observed they never change. Compressed bytes are
//! staged on disk (never fully buffered in memory) in a per-image
//! [`Staging`] directory shared by all of that image's handles.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use imagekit_core::error::{ImageError, Result};

use crate::descriptor::{Descriptor, Digest};
use crate::registry::RegistryClient;

/// Scratch space for staged blobs, shared by the layer handles of one
/// image. Handles keep it alive through rebase and reuse, so a layer
/// moved into another image stays readable.
#[derive(Clone)]
pub struct Staging {
    inner: Arc<StagingInner>,
}

struct StagingInner {
    dir: tempfile::TempDir,
    counter: AtomicU64,
}

impl Staging {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(StagingInner {
                dir: tempfile::TempDir::new()?,
                counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        self.inner.dir.path()
    }

    /// A path that no other caller of this staging area will receive.
    pub fn unique_path(&self, prefix: &str) -> PathBuf {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        self.inner.dir.path().join(format!("{}-{}", prefix, n))
    }
}

impl fmt::Debug for Staging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Staging")
            .field("dir", &self.inner.dir.path())
            .finish()
    }
}

/// Supplies uncompressed layer tars on demand, keyed by diff id. The
/// daemon backend uses this to materialize base layers from a single
/// image export.
#[async_trait]
pub trait TarSource: Send + Sync {
    async fn tar_path(&self, diff_id: &Digest) -> Result<PathBuf>;
}

/// A staged compressed blob: where it is and what it hashes to.
#[derive(Debug, Clone)]
struct CompressedBlob {
    path: PathBuf,
    digest: Digest,
    size: i64,
}

enum LayerSource {
    /// A blob in a registry; bytes are fetched on first access.
    Remote {
        client: Arc<RegistryClient>,
        registry: String,
        repository: String,
        descriptor: Descriptor,
    },
    /// An uncompressed tar on disk.
    TarFile { path: PathBuf },
    /// An uncompressed tar held in memory.
    TarBytes { bytes: Vec<u8> },
    /// An uncompressed tar materialized on demand by a [`TarSource`].
    Deferred {
        source: Arc<dyn TarSource>,
        diff_id: Digest,
    },
}

struct LayerInner {
    source: LayerSource,
    media_type: String,
    staging: Staging,
    diff_id: OnceLock<Digest>,
    compressed: OnceLock<CompressedBlob>,
}

/// A polymorphic, lazily evaluated layer handle.
///
/// Two handles with equal diff ids are interchangeable for rebase and
/// reuse even when their compressed digests differ.
#[derive(Clone)]
pub struct Layer {
    inner: Arc<LayerInner>,
}

impl Layer {
    /// A layer over an uncompressed tar file. The diff id is computed on
    /// first request; digest and size on first gzip staging.
    pub fn from_tar_file(
        path: impl Into<PathBuf>,
        media_type: impl Into<String>,
        staging: Staging,
    ) -> Self {
        Self::build(
            LayerSource::TarFile { path: path.into() },
            media_type.into(),
            staging,
            None,
        )
    }

    /// As [`Layer::from_tar_file`], with a caller-asserted diff id that
    /// is trusted instead of recomputed.
    pub fn from_tar_file_with_diff_id(
        path: impl Into<PathBuf>,
        diff_id: Digest,
        media_type: impl Into<String>,
        staging: Staging,
    ) -> Self {
        Self::build(
            LayerSource::TarFile { path: path.into() },
            media_type.into(),
            staging,
            Some(diff_id),
        )
    }

    /// A layer over in-memory uncompressed tar bytes.
    pub fn from_tar_bytes(
        bytes: Vec<u8>,
        media_type: impl Into<String>,
        staging: Staging,
    ) -> Self {
        Self::build(
            LayerSource::TarBytes { bytes },
            media_type.into(),
            staging,
            None,
        )
    }

    /// A layer backed by a registry blob. The diff id comes from the
    /// source image's config; answering `diff_id()` never downloads.
    pub fn from_remote(
        client: Arc<RegistryClient>,
        registry: impl Into<String>,
        repository: impl Into<String>,
        descriptor: Descriptor,
        diff_id: Digest,
        staging: Staging,
    ) -> Self {
        let media_type = descriptor.media_type.clone();
        Self::build(
            LayerSource::Remote {
                client,
                registry: registry.into(),
                repository: repository.into(),
                descriptor,
            },
            media_type,
            staging,
            Some(diff_id),
        )
    }

    /// A layer whose uncompressed tar is materialized on demand.
    pub fn from_deferred(
        source: Arc<dyn TarSource>,
        diff_id: Digest,
        media_type: impl Into<String>,
        staging: Staging,
    ) -> Self {
        Self::build(
            LayerSource::Deferred {
                source,
                diff_id: diff_id.clone(),
            },
            media_type.into(),
            staging,
            Some(diff_id),
        )
    }

    fn build(
        source: LayerSource,
        media_type: String,
        staging: Staging,
        diff_id: Option<Digest>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(diff_id) = diff_id {
            let _ = cell.set(diff_id);
        }
        Self {
            inner: Arc::new(LayerInner {
                source,
                media_type,
                staging,
                diff_id: cell,
                compressed: OnceLock::new(),
            }),
        }
    }

    /// Media type of the compressed blob.
    pub fn media_type(&self) -> &str {
        &self.inner.media_type
    }

    /// SHA-256 of the uncompressed tar stream.
    pub fn diff_id(&self) -> Result<Digest> {
        if let Some(diff_id) = self.inner.diff_id.get() {
            return Ok(diff_id.clone());
        }
        let computed = match &self.inner.source {
            LayerSource::TarFile { path } => {
                let mut file = File::open(path)?;
                Digest::sha256_of_reader(&mut file)?.0
            }
            LayerSource::TarBytes { bytes } => Digest::sha256_of(bytes),
            // Remote and deferred layers are always constructed with a
            // diff id; reaching here means a construction bug.
            LayerSource::Remote { descriptor, .. } => {
                return Err(ImageError::Validation(format!(
                    "no diff id recorded for registry layer {}",
                    descriptor.digest
                )))
            }
            LayerSource::Deferred { diff_id, .. } => diff_id.clone(),
        };
        let _ = self.inner.diff_id.set(computed);
        Ok(self
            .inner
            .diff_id
            .get()
            .expect("diff id was just set")
            .clone())
    }

    /// SHA-256 of the compressed blob. Remote layers answer from their
    /// descriptor; local sources gzip into staging on first call.
    pub async fn digest(&self) -> Result<Digest> {
        if let LayerSource::Remote { descriptor, .. } = &self.inner.source {
            return Ok(descriptor.digest.clone());
        }
        Ok(self.ensure_compressed().await?.digest)
    }

    /// Compressed size in bytes.
    pub async fn size(&self) -> Result<i64> {
        if let LayerSource::Remote { descriptor, .. } = &self.inner.source {
            return Ok(descriptor.size);
        }
        Ok(self.ensure_compressed().await?.size)
    }

    /// Descriptor of the compressed blob, under this layer's media type.
    pub async fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor {
            media_type: self.inner.media_type.clone(),
            digest: self.digest().await?,
            size: self.size().await?,
        })
    }

    /// Reader over the compressed (gzip) blob.
    pub async fn compressed(&self) -> Result<Box<dyn Read + Send>> {
        let blob = self.ensure_compressed().await?;
        Ok(Box::new(File::open(&blob.path)?))
    }

    /// Path to the staged compressed blob, for streaming writers.
    pub async fn compressed_path(&self) -> Result<PathBuf> {
        Ok(self.ensure_compressed().await?.path)
    }

    /// Reader over the uncompressed tar stream.
    pub async fn uncompressed(&self) -> Result<Box<dyn Read + Send>> {
        match &self.inner.source {
            LayerSource::TarFile { path } => Ok(Box::new(File::open(path)?)),
            LayerSource::TarBytes { bytes } => Ok(Box::new(Cursor::new(bytes.clone()))),
            LayerSource::Deferred { source, diff_id } => {
                let path = source.tar_path(diff_id).await?;
                Ok(Box::new(File::open(path)?))
            }
            LayerSource::Remote { .. } => {
                let blob = self.ensure_compressed().await?;
                Ok(Box::new(GzDecoder::new(File::open(&blob.path)?)))
            }
        }
    }

    /// The registry and repository this layer's bytes live in, when it is
    /// registry-backed. Drives the cross-repository mount optimization.
    pub fn remote_source(&self) -> Option<(&str, &str)> {
        match &self.inner.source {
            LayerSource::Remote {
                registry,
                repository,
                ..
            } => Some((registry.as_str(), repository.as_str())),
            _ => None,
        }
    }

    /// Materializes the compressed blob into staging, once.
    async fn ensure_compressed(&self) -> Result<CompressedBlob> {
        if let Some(blob) = self.inner.compressed.get() {
            return Ok(blob.clone());
        }

        let blob = match &self.inner.source {
            LayerSource::Remote {
                client,
                repository,
                descriptor,
                ..
            } => {
                let dest = self.inner.staging.unique_path("blob");
                let size = client
                    .download_blob(repository, &descriptor.digest, &dest)
                    .await?;
                debug!(digest = %descriptor.digest, size, "staged registry layer");
                CompressedBlob {
                    path: dest,
                    digest: descriptor.digest.clone(),
                    size,
                }
            }
            LayerSource::TarFile { path } => {
                let dest = self.inner.staging.unique_path("layer");
                let (digest, size) = stage_gzip(File::open(path)?, &dest)?;
                CompressedBlob {
                    path: dest,
                    digest,
                    size,
                }
            }
            LayerSource::TarBytes { bytes } => {
                let dest = self.inner.staging.unique_path("layer");
                let (digest, size) = stage_gzip(Cursor::new(bytes.as_slice()), &dest)?;
                CompressedBlob {
                    path: dest,
                    digest,
                    size,
                }
            }
            LayerSource::Deferred { source, diff_id } => {
                let tar = source.tar_path(diff_id).await?;
                let dest = self.inner.staging.unique_path("layer");
                let (digest, size) = stage_gzip(File::open(tar)?, &dest)?;
                CompressedBlob {
                    path: dest,
                    digest,
                    size,
                }
            }
        };

        // First writer wins; a racing computation observed the same
        // source bytes, so the values agree even if the path differs.
        let _ = self.inner.compressed.set(blob);
        Ok(self
            .inner
            .compressed
            .get()
            .expect("compressed blob was just set")
            .clone())
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.source {
            LayerSource::Remote { descriptor, .. } => {
                format!("remote({})", descriptor.digest)
            }
            LayerSource::TarFile { path } => format!("tar({})", path.display()),
            LayerSource::TarBytes { bytes } => format!("memory({} bytes)", bytes.len()),
            LayerSource::Deferred { diff_id, .. } => format!("deferred({})", diff_id),
        };
        f.debug_struct("Layer")
            .field("source", &kind)
            .field("media_type", &self.inner.media_type)
            .finish()
    }
}

/// Gzips a tar stream into `dest` and returns the digest and size of the
/// compressed bytes. Streaming copy with bounded buffers; the hash runs
/// over the staged file in a second pass.
fn stage_gzip(mut tar: impl Read, dest: &Path) -> Result<(Digest, i64)> {
    let file = File::create(dest)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    std::io::copy(&mut tar, &mut encoder)?;
    encoder.finish()?;

    let mut staged = File::open(dest)?;
    Digest::sha256_of_reader(&mut staged)
}
