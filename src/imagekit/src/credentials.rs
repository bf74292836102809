//! Registry credentials.
//!
//! A [`Keychain`] maps a registry hostname to the credentials to present
//! there. The persistent [`CredentialStore`] speaks the Docker client's
//! credential file dialect (an `auths` object keyed by registry host,
//! values carrying a base64 `user:password` blob), so a file written by
//! `docker login` can be pointed at directly. The [`DefaultKeychain`]
//! consults the store at `~/.imagekit/config.json`, then the
//! `REGISTRY_USERNAME` / `REGISTRY_PASSWORD` environment variables, then
//! falls back to anonymous access.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use imagekit_core::error::{ImageError, Result};

/// Credentials to present to a registry.
#[derive(Debug, Clone)]
pub enum RegistryAuth {
    /// No credentials.
    Anonymous,
    /// Username and password (or personal access token).
    Basic { username: String, password: String },
    /// A pre-issued bearer token.
    Bearer { token: String },
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::Anonymous
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::Basic { username, password },
            _ => Self::Anonymous,
        }
    }
}

/// Resolves credentials for a registry hostname.
///
/// Resolution happens once per hostname per save.
pub trait Keychain: Send + Sync {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth>;
}

/// A fixed credential is itself a keychain: every registry gets the same
/// answer. Convenient for tests and single-registry callers.
impl Keychain for RegistryAuth {
    fn resolve(&self, _registry: &str) -> Result<RegistryAuth> {
        Ok(self.clone())
    }
}

/// Docker Hub answers to several hostnames; credentials are filed under
/// one canonical key so a login against any alias serves all of them.
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];
const DOCKER_HUB_CANONICAL: &str = "index.docker.io";

/// Canonicalizes a registry key: scheme and trailing slash stripped,
/// lowercased, Docker Hub aliases collapsed.
fn canonical_host(registry: &str) -> String {
    let host = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB_CANONICAL.to_string()
    } else {
        host
    }
}

/// One `auths` entry. Files written by this store carry only the base64
/// `auth` blob; files written by other tools may carry explicit
/// `username`/`password` fields instead, and both spellings are read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    password: Option<String>,
}

impl AuthEntry {
    fn encode(username: &str, password: &str) -> Self {
        Self {
            auth: Some(STANDARD.encode(format!("{}:{}", username, password))),
            username: None,
            password: None,
        }
    }

    /// The base64 blob wins when both spellings are present.
    fn decode(&self) -> Result<Option<(String, String)>> {
        if let Some(auth) = &self.auth {
            let decoded = STANDARD
                .decode(auth)
                .map_err(|e| ImageError::Auth(format!("malformed auth entry: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| ImageError::Auth("auth entry is not valid UTF-8".to_string()))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                ImageError::Auth("auth entry does not decode to user:password".to_string())
            })?;
            return Ok(Some((username.to_string(), password.to_string())));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some((username.clone(), password.clone()))),
            _ => Ok(None),
        }
    }
}

/// Docker-style credential file. Fields other than `auths` (credential
/// helpers, proxy settings, ...) are preserved across rewrites.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// Persistent credential store for container registries.
///
/// Reads and writes a Docker-dialect `config.json`; rewrites go through
/// a temp file persisted over the target so a crash never leaves a
/// half-written file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a credential store at the default path
    /// (`~/.imagekit/config.json`).
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ImageError::Auth("cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self {
            path: home.join(".imagekit").join("config.json"),
        })
    }

    /// Create a credential store at a custom path, e.g. an existing
    /// `~/.docker/config.json`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry. Overwrites any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.read_file()?;
        file.auths
            .insert(canonical_host(registry), AuthEntry::encode(username, password));
        self.write_file(&file)
    }

    /// Get credentials for a registry.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        match self.read_file()?.auths.get(&canonical_host(registry)) {
            Some(entry) => entry.decode(),
            None => Ok(None),
        }
    }

    /// Remove credentials for a registry. Returns true if an entry
    /// existed; removing a missing entry is not an error.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.read_file()?;
        if file.auths.remove(&canonical_host(registry)).is_none() {
            return Ok(false);
        }
        self.write_file(&file)?;
        Ok(true)
    }

    /// All registries with stored credentials, sorted by the canonical
    /// key they are filed under.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        Ok(self.read_file()?.auths.keys().cloned().collect())
    }

    fn read_file(&self) -> Result<AuthFile> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AuthFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            ImageError::Auth(format!(
                "failed to parse credential file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write_file(&self, file: &AuthFile) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            ImageError::Auth(format!(
                "credential file path {} has no parent directory",
                self.path.display()
            ))
        })?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, file)?;
        tmp.persist(&self.path)
            .map_err(|e| ImageError::Io(e.error))?;
        Ok(())
    }
}

/// The store resolves credentials directly: a stored entry yields basic
/// auth, anything else is anonymous.
impl Keychain for CredentialStore {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        Ok(match self.get(registry)? {
            Some((username, password)) => RegistryAuth::Basic { username, password },
            None => RegistryAuth::Anonymous,
        })
    }
}

/// The default keychain: credential store, then environment, then
/// anonymous.
pub struct DefaultKeychain {
    store: Option<CredentialStore>,
}

impl DefaultKeychain {
    pub fn new() -> Self {
        Self {
            store: CredentialStore::default_path().ok(),
        }
    }

    /// Use a credential file at a custom path instead of the default.
    pub fn with_store_path(path: PathBuf) -> Self {
        Self {
            store: Some(CredentialStore::new(path)),
        }
    }
}

impl Default for DefaultKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain for DefaultKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        if let Some(store) = &self.store {
            // An unreadable or entry-less credential file never blocks
            // the environment or anonymous fallbacks.
            if let Ok(auth @ RegistryAuth::Basic { .. }) = store.resolve(registry) {
                return Ok(auth);
            }
        }
        Ok(RegistryAuth::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("config.json"))
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        let creds = store.get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user1".to_string(), "pass1".to_string())));
    }

    #[test]
    fn test_get_missing_registry() {
        let dir = TempDir::new().unwrap();
        assert_eq!(test_store(&dir).get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_overwrite_existing() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        store.store("ghcr.io", "user2", "pass2").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user2".to_string(), "pass2".to_string()))
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert!(store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_remove_missing_registry() {
        let dir = TempDir::new().unwrap();
        assert!(!test_store(&dir).remove("ghcr.io").unwrap());
    }

    #[test]
    fn test_list_registries_sorted() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("quay.io", "u2", "p2").unwrap();
        store.store("ghcr.io", "u1", "p1").unwrap();
        assert_eq!(store.list_registries().unwrap(), vec!["ghcr.io", "quay.io"]);
    }

    #[test]
    fn test_list_empty_store() {
        let dir = TempDir::new().unwrap();
        assert!(test_store(&dir).list_registries().unwrap().is_empty());
    }

    #[test]
    fn test_independent_registries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "u1", "p1").unwrap();
        store.store("quay.io", "u2", "p2").unwrap();
        store.store("registry.example.io:5000", "u3", "p3").unwrap();

        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("u1".to_string(), "p1".to_string()))
        );
        assert_eq!(
            store.get("quay.io").unwrap(),
            Some(("u2".to_string(), "p2".to_string()))
        );
        assert_eq!(
            store.get("registry.example.io:5000").unwrap(),
            Some(("u3".to_string(), "p3".to_string()))
        );

        // removing one leaves the others intact
        assert!(store.remove("quay.io").unwrap());
        assert_eq!(store.get("quay.io").unwrap(), None);
        assert!(store.get("ghcr.io").unwrap().is_some());
        assert!(store.get("registry.example.io:5000").unwrap().is_some());
    }

    #[test]
    fn test_docker_hub_aliases_share_one_entry() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        for alias in ["docker.io", "index.docker.io", "registry-1.docker.io"] {
            assert_eq!(
                store.get(alias).unwrap(),
                Some(("user".to_string(), "pass".to_string())),
                "alias {} must resolve the shared entry",
                alias
            );
        }
        // one canonical key on disk, not three
        assert_eq!(store.list_registries().unwrap(), vec!["index.docker.io"]);
    }

    #[test]
    fn test_host_canonicalization() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("https://GHCR.io/", "user", "pass").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn test_reads_docker_login_auth_blob() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let blob = STANDARD.encode("cli-user:cli-pass");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{}"}}}}}}"#, blob),
        )
        .unwrap();

        let store = CredentialStore::new(path);
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("cli-user".to_string(), "cli-pass".to_string()))
        );
    }

    #[test]
    fn test_reads_explicit_username_password_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"quay.io":{"username":"plain-user","password":"plain-pass"}}}"#,
        )
        .unwrap();

        let store = CredentialStore::new(path);
        assert_eq!(
            store.get("quay.io").unwrap(),
            Some(("plain-user".to_string(), "plain-pass".to_string()))
        );
    }

    #[test]
    fn test_password_may_contain_colons() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user", "pa:ss:word").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user".to_string(), "pa:ss:word".to_string()))
        );
    }

    #[test]
    fn test_preserves_unrelated_file_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{},"credHelpers":{"gcr.io":"gcloud"}}"#,
        )
        .unwrap();

        let store = CredentialStore::new(path.clone());
        store.store("ghcr.io", "user", "pass").unwrap();

        let rewritten: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(rewritten["credHelpers"]["gcr.io"], "gcloud");
        assert!(rewritten["auths"]["ghcr.io"]["auth"].is_string());
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        CredentialStore::new(path.clone())
            .store("ghcr.io", "user", "pass")
            .unwrap();
        let creds = CredentialStore::new(path).get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user".to_string(), "pass".to_string())));
    }

    #[test]
    fn test_credential_store_is_a_keychain() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.store("ghcr.io", "user", "pass").unwrap();

        match store.resolve("ghcr.io").unwrap() {
            RegistryAuth::Basic { username, .. } => assert_eq!(username, "user"),
            other => panic!("expected basic auth, got {:?}", other),
        }
        assert!(matches!(
            store.resolve("quay.io").unwrap(),
            RegistryAuth::Anonymous
        ));
    }

    #[test]
    fn test_default_keychain_prefers_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        CredentialStore::new(path.clone())
            .store("ghcr.io", "stored-user", "stored-pass")
            .unwrap();

        let keychain = DefaultKeychain::with_store_path(path);
        match keychain.resolve("ghcr.io").unwrap() {
            RegistryAuth::Basic { username, .. } => assert_eq!(username, "stored-user"),
            other => panic!("expected basic auth, got {:?}", other),
        }
    }

    #[test]
    fn test_fixed_auth_is_a_keychain() {
        let auth = RegistryAuth::basic("u", "p");
        match auth.resolve("any.registry.io").unwrap() {
            RegistryAuth::Basic { username, .. } => assert_eq!(username, "u"),
            other => panic!("expected basic auth, got {:?}", other),
        }
    }
}
