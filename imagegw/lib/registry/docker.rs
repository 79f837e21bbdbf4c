use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use getset::Getters;
use oci_spec::image::Digest;
use reqwest::{header, redirect, Client, Response, StatusCode, Url};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::RwLock,
};
use typed_builder::TypedBuilder;

use crate::{
    config::{AuthMethod, LocationConfig},
    registry::{verify_manifest, AuthChallenge, RegistryPull, TokenResponse, VerifiedManifest},
    registry::{MANIFEST_V1_MIME_TYPE, MANIFEST_V1_SIGNED_MIME_TYPE},
    utils::{self, DigestHasher, LAYER_EXTENSION, PARTIAL_EXTENSION},
    GatewayError, GatewayResult, RegistryProtocolError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The domain suffix of Docker Hub, where single component repositories live under `library/`.
pub const DOCKER_HUB_DOMAIN_SUFFIX: &str = "docker.io";

/// The repository namespace of Docker Hub official images.
const DOCKER_LIBRARY_NAMESPACE: &str = "library";

/// The digest of the empty tar layer that some registries serve broken. It carries no content
/// and is never downloaded.
pub const EMPTY_TAR_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// The maximum number of redirects followed for a single request.
const MAX_REDIRECTS: usize = 5;

/// The header carrying the manifest digest.
const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Connection settings of one registry.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RegistryOptions {
    /// Base url of the registry, without a trailing slash.
    #[builder(setter(into))]
    base_url: String,

    /// CA bundle used to verify the registry certificate.
    #[builder(default)]
    cacert: Option<PathBuf>,

    /// User name for private repositories.
    #[builder(default)]
    username: Option<String>,

    /// Password for private repositories.
    #[builder(default)]
    password: Option<String>,

    /// How credentials are presented.
    #[builder(default)]
    auth_method: AuthMethod,
}

/// DockerRegistry is a client for the Docker Registry HTTP API V2.
///
/// It fetches schema 1 manifests, verifies their digest, and downloads layer blobs into a
/// content addressed cache.
///
/// Authentication follows the registry's challenge: a `401` triggers one token request against
/// the announced realm and one retry. Redirects are followed by hand so that credentials are
/// only sent to the registry host itself.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerRegistry {
    /// The HTTP client used to make requests to the registry.
    client: Client,

    /// The registry settings.
    options: RegistryOptions,

    /// The current bearer token.
    #[getset(skip)]
    token: RwLock<Option<String>>,

    /// Whether the registry asked for basic credentials instead of a token.
    #[getset(skip)]
    use_basic: AtomicBool,

    /// Whether private credentials were presented.
    #[getset(skip)]
    private: AtomicBool,

    /// Blob digests that are never downloaded.
    excluded_layers: HashSet<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryOptions {
    /// Builds the options for the location `name`, optionally with `user:password` credentials.
    pub fn from_location(
        name: &str,
        location: &LocationConfig,
        credentials: Option<(String, String)>,
    ) -> Self {
        let (username, password) = credentials.unzip();
        Self {
            base_url: location.base_url(name),
            cacert: location.get_sslcacert().clone(),
            username,
            password,
            auth_method: *location.get_auth_method(),
        }
    }
}

impl DockerRegistry {
    /// Creates a new registry client.
    ///
    /// ## Errors
    ///
    /// Returns an error if the CA bundle cannot be read or the HTTP client cannot be built.
    pub async fn new(options: RegistryOptions) -> GatewayResult<Self> {
        let mut builder = Client::builder().redirect(redirect::Policy::none());

        if let Some(cacert) = &options.cacert {
            let pem = fs::read(cacert).await?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            options,
            token: RwLock::new(None),
            use_basic: AtomicBool::new(false),
            private: AtomicBool::new(false),
            excluded_layers: HashSet::from([EMPTY_TAR_DIGEST.to_string()]),
        })
    }

    /// Adds a blob digest to the deny-list.
    pub fn exclude_layer(&mut self, digest: impl Into<String>) {
        self.excluded_layers.insert(digest.into());
    }

    /// Returns the repository path on this registry.
    ///
    /// Docker Hub keeps single component repositories under `library/`.
    pub fn repository_path(&self, repository: &str) -> String {
        let on_docker_hub = Url::parse(&self.options.base_url)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.ends_with(DOCKER_HUB_DOMAIN_SUFFIX)))
            .unwrap_or(false);

        if on_docker_hub && !repository.contains('/') {
            format!("{DOCKER_LIBRARY_NAMESPACE}/{repository}")
        } else {
            repository.to_string()
        }
    }

    /// Requests a bearer token for the challenge and stores it.
    ///
    /// Configured credentials are sent along, which marks the pull as private.
    async fn fetch_token(&self, challenge: &AuthChallenge) -> GatewayResult<()> {
        tracing::debug!(realm = %challenge.realm, scope = ?challenge.scope, "requesting registry token");

        let mut request = self.client.get(&challenge.realm).query(&challenge.query());
        if let Some(username) = &self.options.username {
            request = request.basic_auth(username, self.options.password.as_ref());
            self.private.store(true, Ordering::SeqCst);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::AuthenticationFailed(format!(
                "token request to {} returned {}",
                challenge.realm,
                response.status()
            )));
        }

        let token = response.json::<TokenResponse>().await?.into_token()?;
        *self.token.write().await = Some(token);

        Ok(())
    }

    /// Reacts to a `401` response. Only the first one per request is recoverable.
    async fn reauthenticate(&self, response: &Response) -> GatewayResult<()> {
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                GatewayError::AuthenticationFailed(
                    "registry returned 401 without a challenge".to_string(),
                )
            })?;
        let challenge = AuthChallenge::parse(challenge)?;

        if challenge.is_bearer() && self.options.auth_method == AuthMethod::Token {
            return self.fetch_token(&challenge).await;
        }

        if self.options.username.is_some() && !self.use_basic.swap(true, Ordering::SeqCst) {
            self.private.store(true, Ordering::SeqCst);
            return Ok(());
        }

        Err(GatewayError::AuthenticationFailed(format!(
            "cannot satisfy {} challenge from {}",
            challenge.mode, challenge.realm
        )))
    }

    /// Attaches credentials to a request bound for the registry host.
    async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let basic = self.options.auth_method == AuthMethod::Basic
            || self.use_basic.load(Ordering::SeqCst);

        match (&self.options.username, basic) {
            (Some(username), true) => {
                self.private.store(true, Ordering::SeqCst);
                request.basic_auth(username, self.options.password.as_ref())
            }
            _ => match self.token.read().await.as_ref() {
                Some(token) => request.bearer_auth(token),
                None => request,
            },
        }
    }

    /// Sends a GET request, re-authenticating once on `401` and following redirects.
    async fn get(&self, url: &str, accept: &[&str]) -> GatewayResult<Response> {
        let mut url = Url::parse(url)
            .map_err(|e| GatewayError::InvalidArgument(format!("invalid url {url}: {e}")))?;
        let origin = (url.host_str().map(str::to_string), url.port_or_known_default());
        let mut reauthenticated = false;
        let mut redirects = 0;

        loop {
            let same_origin =
                (url.host_str().map(str::to_string), url.port_or_known_default()) == origin;

            let mut request = self.client.get(url.clone());
            if !accept.is_empty() {
                request = request.header(header::ACCEPT, accept.join(", "));
            }
            if same_origin {
                request = self.authorize(request).await;
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(RegistryProtocolError::TooManyRedirects(url.to_string()).into());
                }

                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| RegistryProtocolError::BadStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    })?;
                let next = url.join(location).map_err(|e| {
                    GatewayError::InvalidArgument(format!("invalid redirect {location}: {e}"))
                })?;

                tracing::debug!(from = %url, to = %next, "following registry redirect");
                url = next;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                if reauthenticated || !same_origin {
                    return Err(GatewayError::AuthenticationFailed(format!(
                        "registry rejected credentials for {url}"
                    )));
                }

                self.reauthenticate(&response).await?;
                reauthenticated = true;
                continue;
            }

            return Ok(response);
        }
    }

    /// Streams a blob response into `partial`, returning the byte count and hex digest.
    async fn stream_to_file(
        &self,
        response: Response,
        partial: &Path,
        digest: &Digest,
    ) -> GatewayResult<(u64, String)> {
        let mut hasher = DigestHasher::new(digest.algorithm())?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(partial)
            .await?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            hasher.update(&bytes);
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;

        Ok((written, hasher.finalize_hex()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryPull for DockerRegistry {
    async fn fetch_manifest(
        &self,
        repository: &str,
        tag: &str,
    ) -> GatewayResult<VerifiedManifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.options.base_url,
            self.repository_path(repository),
            tag
        );

        let response = self
            .get(&url, &[MANIFEST_V1_SIGNED_MIME_TYPE, MANIFEST_V1_MIME_TYPE])
            .await?;

        if response.status() != StatusCode::OK {
            return Err(RegistryProtocolError::BadStatus {
                status: response.status().as_u16(),
                url,
            }
            .into());
        }

        let digest_header = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST_HEADER)
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .map_err(|_| RegistryProtocolError::InvalidDigestHeader(format!("{value:?}")))
            })
            .transpose()?;
        let expected_length = response.content_length();

        let raw = response.bytes().await?;
        if let Some(expected) = expected_length {
            if expected != raw.len() as u64 {
                return Err(RegistryProtocolError::ContentLengthMismatch {
                    expected,
                    actual: raw.len() as u64,
                }
                .into());
            }
        }

        let verified = verify_manifest(raw, digest_header.as_deref())?;
        tracing::info!(%repository, %tag, digest = %verified.digest, "fetched manifest");

        Ok(verified)
    }

    async fn fetch_layer(
        &self,
        repository: &str,
        digest: &str,
        cache_dir: &Path,
    ) -> GatewayResult<Option<PathBuf>> {
        if self.excluded_layers.contains(digest) {
            tracing::debug!(%digest, "skipping deny-listed layer");
            return Ok(None);
        }

        let parsed = Digest::from_str(digest)?;
        let target = cache_dir.join(format!("{digest}.{LAYER_EXTENSION}"));
        fs::create_dir_all(cache_dir).await?;

        // Reuse a cached blob only if it still hashes correctly
        if target.exists() {
            let actual = utils::get_file_hash(&target, parsed.algorithm()).await?;
            if actual == parsed.digest() {
                tracing::info!(%digest, "layer already cached, skipping download");
                return Ok(Some(target));
            }

            tracing::warn!(%digest, "cached layer is corrupt, downloading again");
            fs::remove_file(&target).await?;
        }

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.options.base_url,
            self.repository_path(repository),
            digest
        );
        let response = self.get(&url, &[]).await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryProtocolError::BadStatus {
                status: response.status().as_u16(),
                url,
            }
            .into());
        }

        let expected_length = response.content_length();
        let partial = cache_dir.join(format!(
            "{digest}.{}.{PARTIAL_EXTENSION}",
            uuid::Uuid::new_v4()
        ));

        let verified = async {
            let (written, actual) = self.stream_to_file(response, &partial, &parsed).await?;

            if let Some(expected) = expected_length {
                if expected != written {
                    return Err(RegistryProtocolError::ContentLengthMismatch {
                        expected,
                        actual: written,
                    }
                    .into());
                }
            }

            if actual != parsed.digest() {
                return Err(GatewayError::ChecksumMismatch {
                    digest: digest.to_string(),
                    expected: parsed.digest().to_string(),
                    actual,
                });
            }

            Ok::<(), GatewayError>(())
        }
        .await;

        if let Err(e) = verified {
            if let Err(remove_error) = fs::remove_file(&partial).await {
                tracing::warn!(error = %remove_error, path = %partial.display(), "failed to remove partial layer");
            }
            return Err(e);
        }

        fs::rename(&partial, &target).await?;
        tracing::info!(%digest, path = %target.display(), "downloaded layer");

        Ok(Some(target))
    }

    fn is_private(&self) -> bool {
        self.private.load(Ordering::SeqCst)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use bytes::Bytes;
    use oci_spec::image::DigestAlgorithm;
    use tempfile::tempdir;

    use super::*;
    use crate::registry::manifest_helper;

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_fetch_manifest_with_token_auth() -> anyhow::Result<()> {
        let (raw, digest) = manifest_helper::signed_manifest_body();
        let server = helper::MockRegistry::start(raw, digest.clone(), Vec::new()).await?;
        let registry = DockerRegistry::new(
            RegistryOptions::builder()
                .base_url(server.url())
                .username(Some("alice".into()))
                .password(Some("secret".into()))
                .build(),
        )
        .await?;

        let verified = registry.fetch_manifest("test/ubuntu", "latest").await?;
        assert_eq!(verified.digest.to_string(), digest);
        assert_eq!(server.state.token_requests.load(Ordering::SeqCst), 1);
        assert!(registry.is_private());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_rejects_second_unauthorized() -> anyhow::Result<()> {
        let (raw, digest) = manifest_helper::signed_manifest_body();
        let server = helper::MockRegistry::start(raw, digest, Vec::new()).await?;
        server.state.reject_tokens.store(true, Ordering::SeqCst);

        let registry =
            DockerRegistry::new(RegistryOptions::builder().base_url(server.url()).build()).await?;
        let result = registry.fetch_manifest("test/ubuntu", "latest").await;

        assert!(matches!(result, Err(GatewayError::AuthenticationFailed(_))));
        assert_eq!(server.state.token_requests.load(Ordering::SeqCst), 1);
        assert!(!registry.is_private());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_digest_mismatch_fetches_no_layers() -> anyhow::Result<()> {
        let (raw, digest) = manifest_helper::signed_manifest_body();
        let mut tampered = raw.to_vec();
        let position = tampered
            .windows(6)
            .position(|w| w == b"ubuntu")
            .expect("name present");
        tampered[position] ^= 0x20;

        let server =
            helper::MockRegistry::start(Bytes::from(tampered), digest, Vec::new()).await?;
        let registry =
            DockerRegistry::new(RegistryOptions::builder().base_url(server.url()).build()).await?;

        let result = registry.fetch_manifest("test/ubuntu", "latest").await;
        assert!(matches!(
            result,
            Err(GatewayError::RegistryProtocol(
                RegistryProtocolError::DigestMismatch { .. }
            ))
        ));
        assert_eq!(server.state.blob_requests.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_fetch_layer_follows_redirect_and_caches() -> anyhow::Result<()> {
        let blob = b"layer content".to_vec();
        let blob_digest = format!(
            "sha256:{}",
            utils::get_bytes_hash(&blob, &DigestAlgorithm::Sha256)?
        );
        let (raw, digest) = manifest_helper::signed_manifest_body();
        let server = helper::MockRegistry::start(raw, digest, blob.clone()).await?;
        let registry =
            DockerRegistry::new(RegistryOptions::builder().base_url(server.url()).build()).await?;

        let cache_dir = tempdir()?;
        let path = registry
            .fetch_layer("test/ubuntu", &blob_digest, cache_dir.path())
            .await?
            .expect("layer downloaded");
        assert_eq!(tokio::fs::read(&path).await?, blob);
        assert_eq!(server.state.redirect_hits.load(Ordering::SeqCst), 1);
        assert_eq!(server.state.blob_requests.load(Ordering::SeqCst), 1);

        // Second fetch is served from the cache
        registry
            .fetch_layer("test/ubuntu", &blob_digest, cache_dir.path())
            .await?;
        assert_eq!(server.state.blob_requests.load(Ordering::SeqCst), 1);

        // A corrupt cache entry is downloaded again
        tokio::fs::write(&path, b"corrupt").await?;
        registry
            .fetch_layer("test/ubuntu", &blob_digest, cache_dir.path())
            .await?;
        assert_eq!(server.state.blob_requests.load(Ordering::SeqCst), 2);
        assert_eq!(tokio::fs::read(&path).await?, blob);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_fetch_layer_checksum_mismatch() -> anyhow::Result<()> {
        let (raw, digest) = manifest_helper::signed_manifest_body();
        let server = helper::MockRegistry::start(raw, digest, b"actual".to_vec()).await?;
        let registry =
            DockerRegistry::new(RegistryOptions::builder().base_url(server.url()).build()).await?;

        let wrong_digest = format!(
            "sha256:{}",
            utils::get_bytes_hash(b"expected", &DigestAlgorithm::Sha256)?
        );
        let cache_dir = tempdir()?;
        let result = registry
            .fetch_layer("test/ubuntu", &wrong_digest, cache_dir.path())
            .await;

        assert!(matches!(result, Err(GatewayError::ChecksumMismatch { .. })));
        let leftovers = std::fs::read_dir(cache_dir.path())?.count();
        assert_eq!(leftovers, 0, "partial download must be removed");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_docker_registry_skips_empty_layer() -> anyhow::Result<()> {
        let registry = DockerRegistry::new(
            RegistryOptions::builder()
                .base_url("http://127.0.0.1:9")
                .build(),
        )
        .await?;

        let cache_dir = tempdir()?;
        let result = registry
            .fetch_layer("test/ubuntu", EMPTY_TAR_DIGEST, cache_dir.path())
            .await?;
        assert!(result.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_docker_registry_repository_path() -> anyhow::Result<()> {
        let hub = DockerRegistry::new(
            RegistryOptions::builder()
                .base_url("https://registry-1.docker.io")
                .build(),
        )
        .await?;
        assert_eq!(hub.repository_path("ubuntu"), "library/ubuntu");
        assert_eq!(hub.repository_path("nersc/ubuntu"), "nersc/ubuntu");

        let private = DockerRegistry::new(
            RegistryOptions::builder()
                .base_url("https://registry.example.com")
                .build(),
        )
        .await?;
        assert_eq!(private.repository_path("ubuntu"), "ubuntu");

        Ok(())
    }
}

#[cfg(test)]
mod helper {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };
    use bytes::Bytes;

    #[derive(Default)]
    pub(super) struct MockState {
        pub manifest: Bytes,
        pub digest: String,
        pub blob: Vec<u8>,
        pub base: String,
        pub reject_tokens: AtomicBool,
        pub token_requests: AtomicUsize,
        pub blob_requests: AtomicUsize,
        pub redirect_hits: AtomicUsize,
    }

    /// A registry that demands a bearer token for manifests and redirects blob requests.
    pub(super) struct MockRegistry {
        pub state: Arc<MockState>,
        addr: std::net::SocketAddr,
    }

    impl MockRegistry {
        pub async fn start(manifest: Bytes, digest: String, blob: Vec<u8>) -> anyhow::Result<Self> {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let state = Arc::new(MockState {
                manifest,
                digest,
                blob,
                base: format!("http://{addr}"),
                ..Default::default()
            });

            let app = Router::new()
                .route("/token", get(token))
                .route("/v2/test/ubuntu/manifests/latest", get(manifest_handler))
                .route("/v2/test/ubuntu/blobs/{digest}", get(blob_redirect))
                .route("/storage/blob", get(blob_handler))
                .with_state(state.clone());

            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });

            Ok(Self { state, addr })
        }

        pub fn url(&self) -> String {
            format!("http://{}", self.addr)
        }
    }

    async fn token(State(state): State<Arc<MockState>>) -> Response {
        state.token_requests.fetch_add(1, Ordering::SeqCst);
        if state.reject_tokens.load(Ordering::SeqCst) {
            return axum::Json(serde_json::json!({"token": "wrong"})).into_response();
        }
        axum::Json(serde_json::json!({"token": "good"})).into_response()
    }

    async fn manifest_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer good");
        if !authorized {
            let challenge = format!(
                r#"Bearer realm="{}/token",service="mock",scope="repository:test/ubuntu:pull""#,
                state.base
            );
            return (StatusCode::UNAUTHORIZED, [("www-authenticate", challenge)]).into_response();
        }

        (
            [("docker-content-digest", state.digest.clone())],
            state.manifest.clone(),
        )
            .into_response()
    }

    async fn blob_redirect(State(state): State<Arc<MockState>>) -> Response {
        state.redirect_hits.fetch_add(1, Ordering::SeqCst);
        (
            StatusCode::TEMPORARY_REDIRECT,
            [("location", "/storage/blob".to_string())],
        )
            .into_response()
    }

    async fn blob_handler(State(state): State<Arc<MockState>>) -> Response {
        state.blob_requests.fetch_add(1, Ordering::SeqCst);
        state.blob.clone().into_response()
    }
}
