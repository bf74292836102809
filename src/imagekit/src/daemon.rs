//! Container daemon contract.
//!
//! The daemon backend works against this abstraction rather than a
//! concrete client: the transport (unix socket, named pipe, TCP) and its
//! wire format belong to the implementation. The contract is the set of
//! image operations the backend needs: load, inspect, save (export),
//! pull, and remove.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use imagekit_core::error::Result;

use crate::config::Config;
use crate::descriptor::Digest;

/// A Docker-layout tarball stream flowing to or from the daemon.
pub type TarballStream = Box<dyn AsyncRead + Send + Unpin>;

/// Inspect data for an image known to the daemon.
#[derive(Debug, Clone)]
pub struct DaemonImage {
    /// The daemon's id for the image (the config digest, `sha256:...`).
    pub id: String,
    pub os: String,
    pub architecture: String,
    pub os_version: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Runtime configuration.
    pub config: Config,
    /// Rootfs layer diff ids, lowest first.
    pub diff_ids: Vec<Digest>,
}

/// Image operations of a local container daemon.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    /// Loads a Docker-layout tarball and returns the id the daemon
    /// assigned to the imported image.
    async fn image_load(&self, tarball: TarballStream) -> Result<String>;

    /// Inspects an image by reference. `None` when unknown.
    async fn image_inspect(&self, name: &str) -> Result<Option<DaemonImage>>;

    /// Exports an image as a Docker-layout tarball stream.
    async fn image_save(&self, name: &str) -> Result<TarballStream>;

    /// Pulls an image from its registry into the daemon.
    async fn image_pull(&self, name: &str) -> Result<()>;

    /// Removes an image from the daemon.
    async fn image_remove(&self, name: &str) -> Result<()>;
}
