//! Image manifest and index documents.

use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;

/// An image manifest: a config descriptor plus ordered layer descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// A multi-platform image index (Docker manifest list or OCI index).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub manifests: Vec<IndexEntry>,
}

/// A manifest descriptor inside an index, with its platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub platform: Option<Platform>,
}

/// Platform selector for multi-platform images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none", default)]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
}

impl Default for Platform {
    /// Container images are Linux-first; amd64 is the corpus-wide default.
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            os_version: None,
            variant: None,
        }
    }
}

impl Platform {
    /// Whether an index entry platform satisfies this request.
    ///
    /// OS and architecture must match exactly; variant and OS version
    /// constrain the match only when requested.
    fn satisfied_by(&self, candidate: &Platform) -> bool {
        if candidate.os != self.os || candidate.architecture != self.architecture {
            return false;
        }
        if let Some(variant) = &self.variant {
            if candidate.variant.as_deref() != Some(variant.as_str()) {
                return false;
            }
        }
        if let Some(os_version) = &self.os_version {
            if candidate.os_version.as_deref() != Some(os_version.as_str()) {
                return false;
            }
        }
        true
    }
}

impl ImageIndex {
    /// Selects the entry matching the requested platform.
    ///
    /// On a miss, the error lists the platforms the index offers.
    pub fn select(&self, platform: &Platform) -> Option<&IndexEntry> {
        self.manifests
            .iter()
            .find(|entry| match &entry.platform {
                Some(candidate) => platform.satisfied_by(candidate),
                None => false,
            })
    }

    /// Human-readable list of the platforms present in the index.
    pub fn available_platforms(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|entry| entry.platform.as_ref())
            .map(|p| format!("{}/{}", p.os, p.architecture))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Digest, DOCKER_MANIFEST, OCI_MANIFEST};

    fn entry(os: &str, arch: &str, variant: Option<&str>) -> IndexEntry {
        IndexEntry {
            descriptor: Descriptor {
                media_type: OCI_MANIFEST.to_string(),
                digest: Digest::sha256_of(format!("{}/{}", os, arch).as_bytes()),
                size: 7,
            },
            platform: Some(Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                os_version: None,
                variant: variant.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_select_matching_platform() {
        let index = ImageIndex {
            schema_version: 2,
            media_type: String::new(),
            manifests: vec![entry("linux", "amd64", None), entry("linux", "arm64", None)],
        };
        let selected = index
            .select(&Platform {
                architecture: "arm64".to_string(),
                os: "linux".to_string(),
                os_version: None,
                variant: None,
            })
            .unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().architecture,
            "arm64"
        );
    }

    #[test]
    fn test_select_miss_lists_available() {
        let index = ImageIndex {
            schema_version: 2,
            media_type: String::new(),
            manifests: vec![entry("linux", "amd64", None)],
        };
        assert!(index
            .select(&Platform {
                architecture: "s390x".to_string(),
                os: "linux".to_string(),
                os_version: None,
                variant: None,
            })
            .is_none());
        assert_eq!(index.available_platforms(), vec!["linux/amd64".to_string()]);
    }

    #[test]
    fn test_variant_constrains_only_when_requested() {
        let index = ImageIndex {
            schema_version: 2,
            media_type: String::new(),
            manifests: vec![entry("linux", "arm", Some("v7"))],
        };
        // No variant requested: the v7 entry satisfies linux/arm.
        assert!(index.select(&Platform {
            architecture: "arm".to_string(),
            os: "linux".to_string(),
            os_version: None,
            variant: None,
        }).is_some());
        // Mismatched variant requested: no match.
        assert!(index.select(&Platform {
            architecture: "arm".to_string(),
            os: "linux".to_string(),
            os_version: None,
            variant: Some("v6".to_string()),
        }).is_none());
    }

    #[test]
    fn test_manifest_wire_shape() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: DOCKER_MANIFEST.to_string(),
            config: Descriptor::of_bytes("application/vnd.docker.container.image.v1+json", b"{}"),
            layers: vec![],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], DOCKER_MANIFEST);
        assert!(json["config"]["digest"].is_string());
    }

    #[test]
    fn test_index_entry_flattened_descriptor() {
        let json = r#"{
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
                "size": 100,
                "platform": {"architecture": "amd64", "os": "linux"}
            }]
        }"#;
        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert_eq!(index.manifests[0].descriptor.size, 100);
        assert_eq!(index.manifests[0].platform.as_ref().unwrap().os, "linux");
    }
}
