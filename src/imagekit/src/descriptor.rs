//! Content-addressed identifiers and descriptors.
//!
//! A [`Digest`] names a blob by the SHA-256 of its wire-format bytes; a
//! [`Descriptor`] pairs a digest with the media type and size of the
//! content it describes.

use std::fmt;
use std::io::Read;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};

use imagekit_core::error::{ImageError, Result};

// Docker media types.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

// OCI media types.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The only digest algorithm supported by this crate.
pub const SHA256: &str = "sha256";

/// Read buffer size for streaming hash computation.
const HASH_BUF_SIZE: usize = 32 * 1024;

/// A content digest: algorithm plus lowercase hex.
///
/// Displays and serializes as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Creates a digest from an algorithm and hex string.
    pub fn new(algorithm: impl Into<String>, hex: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hex: hex.into(),
        }
    }

    /// Parses a digest from `algorithm:hex` form.
    ///
    /// A bare hex string is accepted and assumed to be SHA-256.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = match s.split_once(':') {
            Some((alg, hex)) => (alg, hex),
            None => (SHA256, s),
        };
        if algorithm.is_empty() || hex.is_empty() {
            return Err(ImageError::Validation(format!(
                "malformed digest '{}': expected algorithm:hex",
                s
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ImageError::Validation(format!(
                "malformed digest '{}': non-hex characters",
                s
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_lowercase(),
        })
    }

    /// Computes the SHA-256 digest of a byte slice.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Computes the SHA-256 digest of a reader with a bounded buffer.
    ///
    /// Returns the digest and the number of bytes consumed.
    pub fn sha256_of_reader(reader: &mut impl Read) -> Result<(Self, i64)> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_BUF_SIZE];
        let mut total: i64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as i64;
        }
        Ok((
            Self {
                algorithm: SHA256.to_string(),
                hex: hex::encode(hasher.finalize()),
            },
            total,
        ))
    }

    /// Digest algorithm (always `sha256` for digests produced here).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Lowercase hex form, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether a caller-supplied string names this digest, in either the
    /// `algorithm:hex` or the bare hex form.
    pub fn matches(&self, s: &str) -> bool {
        match s.split_once(':') {
            Some((alg, hex)) => alg == self.algorithm && hex == self.hex,
            None => s == self.hex,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DigestVisitor;

        impl Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a digest string of the form algorithm:hex")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Digest, E> {
                Digest::parse(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

/// A content descriptor: media type, digest, and size of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the exact bytes the media type describes.
    pub digest: Digest,
    /// Content size in bytes.
    pub size: i64,
}

impl Descriptor {
    /// Creates a descriptor over a serialized document, digesting its bytes.
    pub fn of_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::sha256_of(data),
            size: data.len() as i64,
        }
    }
}
