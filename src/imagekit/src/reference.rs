//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` or
//! `busybox@sha256:...` into structured components.

use std::fmt;

use imagekit_core::error::{ImageError, Result};

use crate::descriptor::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither a tag nor a digest is specified.
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
///
/// Supported forms:
/// - `nginx` → `docker.io/library/nginx:latest`
/// - `nginx:1.25` → `docker.io/library/nginx:1.25`
/// - `myuser/myimage` → `docker.io/myuser/myimage:latest`
/// - `ghcr.io/org/image:tag`
/// - `myregistry.io:5000/image:v1`
/// - `ghcr.io/org/image@sha256:...` (optionally with a tag before `@`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parses an image reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        // Digest comes after '@', if present.
        let (remainder, digest) = match reference.rsplit_once('@') {
            Some((rest, digest_part)) => {
                if !digest_part.contains(':') {
                    return Err(invalid(reference, "digest must be of the form algorithm:hex"));
                }
                let digest = Digest::parse(digest_part)
                    .map_err(|e| invalid(reference, &e.to_string()))?;
                (rest, Some(digest))
            }
            None => (reference, None),
        };

        // Tag is the part after the last ':' that follows the last '/',
        // so registry ports are not mistaken for tags.
        let last_slash = remainder.rfind('/');
        let (name, tag) = match remainder.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &remainder[colon + 1..];
                if tag.is_empty() {
                    return Err(invalid(reference, "empty tag"));
                }
                (&remainder[..colon], Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        let (registry, repository) = split_registry(name);
        if repository.is_empty() {
            return Err(invalid(reference, "empty repository"));
        }

        // Apply the default tag only for tagless, digestless references.
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry hostname, possibly with a port.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The manifest reference part: the digest when pinned, otherwise the
    /// tag (defaulted to `latest` at parse time).
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Whether two references target the same registry but different
    /// repositories (the precondition for a cross-repository blob mount).
    pub fn same_registry(&self, other: &Reference) -> bool {
        self.registry == other.registry
    }
}

/// Splits a name into registry and repository, detecting a registry by a
/// dot, colon, or `localhost` in the first path component.
fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest.to_string());
        }
    }

    // Docker Hub: bare names get the library/ prefix.
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    (DEFAULT_REGISTRY.to_string(), repository)
}

fn invalid(reference: &str, reason: &str) -> ImageError {
    ImageError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_simple_name() {
        let r = Reference::parse("nginx").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.tag(), Some("latest"));
        assert!(r.digest().is_none());
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = Reference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.tag(), Some("1.25"));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = Reference::parse("myuser/myimage").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "myuser/myimage");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = Reference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "org/app");
        assert_eq!(r.tag(), Some("v0.1.0"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = Reference::parse("localhost:5000/pack-image-test:latest").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "pack-image-test");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_registry_with_port_no_tag() {
        let r = Reference::parse("myregistry.io:5000/myimage").unwrap();
        assert_eq!(r.registry(), "myregistry.io:5000");
        assert_eq!(r.repository(), "myimage");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_parse_digest_reference() {
        let r = Reference::parse(&format!("busybox@{}", SHA)).unwrap();
        assert_eq!(r.repository(), "library/busybox");
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest().unwrap().to_string(), SHA);
        assert_eq!(r.manifest_reference(), SHA);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = Reference::parse(&format!("ghcr.io/org/app:v1@{}", SHA)).unwrap();
        assert_eq!(r.tag(), Some("v1"));
        assert!(r.digest().is_some());
        // digest pins the manifest reference
        assert_eq!(r.manifest_reference(), SHA);
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = Reference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry(), "localhost");
        assert_eq!(r.repository(), "myimage");
    }

    #[test]
    fn test_parse_deep_repository_path() {
        let r = Reference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository(), "org/sub/image");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("nginx@invaliddigest").is_err());
        assert!(Reference::parse("nginx:").is_err());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let r = Reference::parse("  nginx  ").unwrap();
        assert_eq!(r.repository(), "library/nginx");
    }

    #[test]
    fn test_display_round_trip() {
        let r = Reference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/app:v0.1.0");
        let r = Reference::parse("nginx:1.25").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/nginx:1.25");
    }

    #[test]
    fn test_same_registry() {
        let a = Reference::parse("ghcr.io/org/app").unwrap();
        let b = Reference::parse("ghcr.io/other/base").unwrap();
        let c = Reference::parse("quay.io/org/app").unwrap();
        assert!(a.same_registry(&b));
        assert!(!a.same_registry(&c));
    }
}
