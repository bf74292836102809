//! Docker Registry v2 API client.
//!
//! Speaks the distribution protocol against Docker Hub and OCI-compliant
//! registries: manifest HEAD/GET/PUT/DELETE, blob existence checks,
//! verified streaming downloads, streamed uploads, and cross-repository
//! blob mounts. Token authentication (401 challenge) is handled
//! automatically, with tokens cached per repository.

use std::collections::HashMap;
use std::path::Path;

use futures::StreamExt;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace, warn};

use imagekit_core::config::ClientConfig;
use imagekit_core::error::{ImageError, Result};

use crate::config::ConfigFile;
use crate::credentials::RegistryAuth;
use crate::descriptor::{Descriptor, Digest};
use crate::manifest::{ImageIndex, Manifest};

/// Docker Hub's API host differs from its reference host.
const DOCKER_HUB_URL: &str = "https://registry-1.docker.io";

/// Accept header for manifest requests: both Docker and OCI families,
/// single manifests and indexes.
const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

const OCTET_STREAM: &str = "application/octet-stream";

/// Token response from a registry auth service.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Default)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: String,
}

/// A fetched manifest document: single-platform or index.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Manifest(Manifest),
    Index(ImageIndex),
}

/// Result of a manifest GET: the parsed document, its canonical digest,
/// and the media type the server reported.
#[derive(Debug, Clone)]
pub struct ManifestFetch {
    pub digest: Digest,
    pub media_type: String,
    pub document: ManifestDocument,
}

/// Registry client bound to one registry host with resolved credentials.
pub struct RegistryClient {
    http: Client,
    registry_url: String,
    auth: RegistryAuth,
    /// Cached bearer tokens, keyed by repository.
    tokens: RwLock<HashMap<String, String>>,
}

impl RegistryClient {
    /// Creates a client for a registry hostname with resolved credentials.
    pub fn new(registry: &str, auth: RegistryAuth) -> Result<Self> {
        Self::with_config(registry, auth, &ClientConfig::default())
    }

    /// Creates a client with explicit tuning configuration.
    pub fn with_config(registry: &str, auth: RegistryAuth, config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("imagekit/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| ImageError::Registry(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            registry_url: registry_to_url(registry),
            auth,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Base URL of the registry this client talks to.
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    // ------------------------------------------------------------------
    // Manifests
    // ------------------------------------------------------------------

    /// Whether a manifest exists at `repository`/`reference`.
    pub async fn manifest_exists(&self, repository: &str, reference: &str) -> Result<bool> {
        let url = self.manifest_url(repository, reference);
        let response = self
            .execute(repository, "pull", || {
                self.http
                    .request(Method::HEAD, &url)
                    .header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(self.status_error(s, response, "manifest check").await),
        }
    }

    /// Fetches and parses a manifest. Returns `None` on 404.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestFetch>> {
        let url = self.manifest_url(repository, reference);
        debug!(url = %url, "fetching manifest");

        let response = self
            .execute(repository, "pull", || {
                self.http
                    .request(Method::GET, &url)
                    .header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(self.status_error(status, response, "manifest fetch").await);
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let reported = header_digest(&response);

        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Registry(format!("failed to read manifest body: {}", e)))?;
        let digest = Digest::sha256_of(&body);
        if let Some(reported) = reported {
            if reported != digest {
                return Err(ImageError::Validation(format!(
                    "manifest digest mismatch: registry reported {}, content hashes to {}",
                    reported, digest
                )));
            }
        }

        trace!(media_type = %media_type, size = body.len(), digest = %digest, "received manifest");

        let document = if media_type.contains("manifest.list") || media_type.contains("image.index")
        {
            ManifestDocument::Index(serde_json::from_slice(&body)?)
        } else {
            ManifestDocument::Manifest(serde_json::from_slice(&body)?)
        };

        Ok(Some(ManifestFetch {
            digest,
            media_type,
            document,
        }))
    }

    /// Publishes a manifest and returns its canonical digest.
    ///
    /// The locally computed digest is the identifier; if the registry
    /// reports a `Docker-Content-Digest`, the two must agree.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<Digest> {
        let url = self.manifest_url(repository, reference);
        let digest = Digest::sha256_of(&body);
        debug!(url = %url, digest = %digest, "publishing manifest");

        let media_type = media_type.to_string();
        let response = self
            .execute(repository, "pull,push", || {
                self.http
                    .request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, media_type.clone())
                    .body(body.clone())
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "manifest publish").await);
        }
        if let Some(reported) = header_digest(&response) {
            if reported != digest {
                return Err(ImageError::Validation(format!(
                    "manifest digest disagreement after publish: registry reported {}, expected {}",
                    reported, digest
                )));
            }
        }
        Ok(digest)
    }

    /// Deletes a manifest by digest.
    pub async fn delete_manifest(&self, repository: &str, digest: &Digest) -> Result<()> {
        let url = self.manifest_url(repository, &digest.to_string());
        let response = self
            .execute(repository, "pull,push", || {
                self.http.request(Method::DELETE, &url)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "manifest delete").await);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Fetches a config blob, verifying its digest against the descriptor.
    pub async fn get_config(
        &self,
        repository: &str,
        descriptor: &Descriptor,
    ) -> Result<ConfigFile> {
        let url = self.blob_url(repository, &descriptor.digest);
        let response = self
            .execute(repository, "pull", || self.http.request(Method::GET, &url))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "config fetch").await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Registry(format!("failed to read config body: {}", e)))?;
        let actual = Digest::sha256_of(&body);
        if actual != descriptor.digest {
            return Err(ImageError::Validation(format!(
                "config digest mismatch: expected {}, got {}",
                descriptor.digest, actual
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Whether a blob is present in `repository`.
    pub async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        let response = self
            .execute(repository, "pull", || self.http.request(Method::HEAD, &url))
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(self.status_error(s, response, "blob check").await),
        }
    }

    /// Streams a blob to `dest`, verifying its digest on the way down.
    /// Returns the blob size in bytes.
    pub async fn download_blob(
        &self,
        repository: &str,
        digest: &Digest,
        dest: &Path,
    ) -> Result<i64> {
        let url = self.blob_url(repository, digest);
        debug!(url = %url, dest = %dest.display(), "downloading blob");

        let response = self
            .execute(repository, "pull", || self.http.request(Method::GET, &url))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "blob fetch").await);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ImageError::Registry(format!("failed to read blob chunk: {}", e)))?;
            hasher.update(&chunk);
            size += chunk.len() as i64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let actual = Digest::new("sha256", hex::encode(hasher.finalize()));
        if &actual != digest {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(ImageError::Validation(format!(
                "blob digest mismatch: expected {}, got {}",
                digest, actual
            )));
        }
        Ok(size)
    }

    /// Attempts a cross-repository mount of a blob already present in
    /// `from_repository` on this registry. Returns whether the mount
    /// happened; a refusal is not an error, the caller falls back to a
    /// byte upload.
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &Digest,
        from_repository: &str,
    ) -> Result<bool> {
        let url = format!(
            "{}/v2/{}/blobs/uploads/?mount={}&from={}",
            self.registry_url,
            repository,
            urlencoding::encode(&digest.to_string()),
            urlencoding::encode(from_repository),
        );
        debug!(url = %url, "attempting cross-repository blob mount");

        let response = self
            .execute(repository, "pull,push", || {
                self.http.request(Method::POST, &url)
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(self
                    .status_error(response.status(), response, "blob mount")
                    .await)
            }
            status => {
                trace!(status = %status, "registry declined blob mount");
                Ok(false)
            }
        }
    }

    /// Uploads a blob from a staged file, streaming its bytes.
    pub async fn upload_blob_file(
        &self,
        repository: &str,
        digest: &Digest,
        size: i64,
        path: &Path,
    ) -> Result<()> {
        let put_url = self.start_upload(repository, digest).await?;
        debug!(digest = %digest, size, "uploading blob");

        // A streaming body cannot be replayed by the generic retry path,
        // so the PUT reopens the file per attempt.
        let token = self.cached_token(repository).await;
        let mut last_err: Option<ImageError> = None;
        for attempt in 0..2 {
            let file = tokio::fs::File::open(path).await?;
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            let request = self
                .apply_auth(
                    self.http
                        .request(Method::PUT, &put_url)
                        .header(header::CONTENT_TYPE, OCTET_STREAM)
                        .header(header::CONTENT_LENGTH, size),
                    token.as_deref(),
                )
                .body(body);

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_server_error() && attempt == 0 => {
                    warn!(status = %response.status(), "blob upload failed, retrying once");
                    last_err = Some(ImageError::Registry(format!(
                        "blob upload failed: {}",
                        response.status()
                    )));
                }
                Ok(response) => {
                    return Err(self
                        .status_error(response.status(), response, "blob upload")
                        .await)
                }
                Err(e) if attempt == 0 => {
                    warn!(error = %e, "blob upload transport error, retrying once");
                    last_err = Some(ImageError::Registry(format!("blob upload failed: {}", e)));
                }
                Err(e) => {
                    return Err(ImageError::Registry(format!("blob upload failed: {}", e)))
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ImageError::Registry("blob upload failed".to_string())))
    }

    /// Uploads a small in-memory blob (config documents).
    pub async fn upload_blob_bytes(
        &self,
        repository: &str,
        digest: &Digest,
        body: Vec<u8>,
    ) -> Result<()> {
        let put_url = self.start_upload(repository, digest).await?;
        debug!(digest = %digest, size = body.len(), "uploading blob");

        let size = body.len() as i64;
        let response = self
            .execute(repository, "pull,push", || {
                self.http
                    .request(Method::PUT, &put_url)
                    .header(header::CONTENT_TYPE, OCTET_STREAM)
                    .header(header::CONTENT_LENGTH, size)
                    .body(body.clone())
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "blob upload").await);
        }
        Ok(())
    }

    /// Initiates a blob upload session and returns the finalization URL
    /// with the digest query attached.
    async fn start_upload(&self, repository: &str, digest: &Digest) -> Result<String> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.registry_url, repository);
        let response = self
            .execute(repository, "pull,push", || {
                self.http.request(Method::POST, &url)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response, "blob upload start").await);
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ImageError::Registry("upload initiation returned no Location header".to_string())
            })?;

        // Some registries return relative upload locations.
        let absolute = if location.starts_with('/') {
            format!("{}{}", self.registry_url, location)
        } else {
            location.to_string()
        };
        let separator = if absolute.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}digest={}",
            absolute,
            separator,
            urlencoding::encode(&digest.to_string())
        ))
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        )
    }

    fn blob_url(&self, repository: &str, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest)
    }

    async fn cached_token(&self, repository: &str) -> Option<String> {
        self.tokens.read().await.get(repository).cloned()
    }

    /// Attaches credentials: a cached/issued bearer token wins, otherwise
    /// whatever the keychain resolved for this host.
    fn apply_auth(&self, request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        if let Some(token) = token {
            return request.bearer_auth(token);
        }
        match &self.auth {
            RegistryAuth::Anonymous => request,
            RegistryAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            RegistryAuth::Bearer { token } => request.bearer_auth(token),
        }
    }

    /// Sends a replayable request with token authentication and a single
    /// retry on transient failures. On 401 the challenge is answered, the
    /// token cached per repository, and the request replayed once.
    async fn execute<F>(&self, repository: &str, actions: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let token = self.cached_token(repository).await;
        let response = self
            .send_with_retry(|| self.apply_auth(build(), token.as_deref()))
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // Token missing, expired, or under-scoped: answer the challenge.
        let challenge = parse_www_authenticate(&response)?;
        let token = self.fetch_token(repository, actions, &challenge).await?;
        {
            let mut tokens = self.tokens.write().await;
            tokens.insert(repository.to_string(), token.clone());
        }
        self.send_with_retry(|| self.apply_auth(build(), Some(&token)))
            .await
    }

    /// Sends a request, retrying once on 5xx or transport errors.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        match build().send().await {
            Ok(response) if response.status().is_server_error() => {
                warn!(status = %response.status(), "transient registry failure, retrying once");
                build()
                    .send()
                    .await
                    .map_err(|e| ImageError::Registry(format!("request failed: {}", e)))
            }
            Ok(response) => Ok(response),
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(error = %e, "transport error, retrying once");
                build()
                    .send()
                    .await
                    .map_err(|e| ImageError::Registry(format!("request failed: {}", e)))
            }
            Err(e) => Err(ImageError::Registry(format!("request failed: {}", e))),
        }
    }

    /// Fetches a bearer token from the challenge's auth service.
    async fn fetch_token(
        &self,
        repository: &str,
        actions: &str,
        challenge: &AuthChallenge,
    ) -> Result<String> {
        let scope = if challenge.scope.is_empty() {
            format!("repository:{}:{}", repository, actions)
        } else {
            challenge.scope.clone()
        };
        let url = format!(
            "{}?service={}&scope={}",
            challenge.realm,
            urlencoding::encode(&challenge.service),
            urlencoding::encode(&scope),
        );
        debug!(realm = %challenge.realm, scope = %scope, "requesting registry token");

        let mut request = self.http.get(&url);
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::Auth(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Auth(format!("token request failed: {}", body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Auth(format!("failed to parse token response: {}", e)))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| ImageError::Auth("token response carried no token".to_string()))
    }

    /// Maps an unexpected status to the right error kind, consuming the
    /// response body for context.
    async fn status_error(
        &self,
        status: StatusCode,
        response: Response,
        what: &str,
    ) -> ImageError {
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ImageError::Auth(format!("{} rejected: {} {}", what, status, body.trim()))
            }
            _ => ImageError::Registry(format!("{} failed: {} {}", what, status, body.trim())),
        }
    }
}

/// Converts a registry hostname to its API base URL.
fn registry_to_url(registry: &str) -> String {
    match registry {
        "docker.io" | "index.docker.io" => DOCKER_HUB_URL.to_string(),
        r if r.starts_with("http://") || r.starts_with("https://") => r.to_string(),
        r if r.starts_with("localhost") || r.starts_with("127.0.0.1") => {
            format!("http://{}", r)
        }
        r => format!("https://{}", r),
    }
}

/// Reads the `Docker-Content-Digest` header, if present and parseable.
fn header_digest(response: &Response) -> Option<Digest> {
    response
        .headers()
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Digest::parse(v).ok())
}

/// Parses a `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`
/// challenge.
fn parse_www_authenticate(response: &Response) -> Result<AuthChallenge> {
    let value = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ImageError::Auth("missing WWW-Authenticate header".to_string()))?;

    let mut challenge = AuthChallenge::default();
    for part in split_challenge(value.trim_start_matches("Bearer ")) {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("realm=") {
            challenge.realm = v.trim_matches('"').to_string();
        } else if let Some(v) = part.strip_prefix("service=") {
            challenge.service = v.trim_matches('"').to_string();
        } else if let Some(v) = part.strip_prefix("scope=") {
            challenge.scope = v.trim_matches('"').to_string();
        }
    }
    if challenge.realm.is_empty() {
        return Err(ImageError::Auth(format!(
            "unparseable WWW-Authenticate header: {}",
            value
        )));
    }
    Ok(challenge)
}

/// Splits a challenge parameter list on commas, except inside quoted
/// values (`scope="repository:app:pull,push"` is one parameter).
fn split_challenge(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}
