//! imagekit - construct, mutate, and publish OCI/Docker container images.
//!
//! An image is opened by reference against one of three backends, edited
//! through a uniform operation surface, and saved back:
//!
//! - [`RemoteImage`]: a v2 registry (pull on open, push on save)
//! - [`LocalImage`]: a container daemon behind the [`ContainerDaemon`]
//!   contract (inspect on open, image-load on save)
//! - [`TarballImage`]: a single tarball in Docker or OCI image layout
//!
//! ```no_run
//! use std::sync::Arc;
//! use imagekit::{DefaultKeychain, Image, ImageOptions, RemoteImage};
//!
//! # async fn run() -> imagekit::Result<()> {
//! let keychain = Arc::new(DefaultKeychain::new());
//! let mut image =
//!     RemoteImage::new("ghcr.io/org/app:latest", keychain, ImageOptions::default()).await?;
//! image.set_label("org.opencontainers.image.version", "1.2.3")?;
//! image.set_env("APP_ENV", "production")?;
//! let digest = image.save(&[]).await?;
//! println!("pushed {}", digest);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod daemon;
pub mod descriptor;
pub mod image;
pub mod layer;
pub mod local;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod tarball;

// Re-export common types
pub use imagekit_core::{ClientConfig, ImageError, Result};

pub use config::{Config, ConfigFile, History, RootFs};
pub use credentials::{CredentialStore, DefaultKeychain, Keychain, RegistryAuth};
pub use daemon::{ContainerDaemon, DaemonImage, TarballStream};
pub use descriptor::{Descriptor, Digest};
pub use image::{BaseImage, Image, ImageOptions};
pub use layer::Layer;
pub use local::LocalImage;
pub use manifest::{ImageIndex, Manifest, Platform};
pub use reference::Reference;
pub use registry::RegistryClient;
pub use remote::RemoteImage;
pub use tarball::{Layout, TarballImage};

/// imagekit version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
