use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

use crate::store::ImageStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an imagegw-related operation.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// An error that occurred while resolving, pulling or staging an image.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during a database operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while running database migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred while encoding or decoding JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while parsing a TOML document.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred while parsing an OCI type such as a digest.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// The session is malformed, expired or scoped to another system.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The authentication collaborator or the registry rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The registry answered in a way the protocol does not allow.
    #[error("registry protocol error: {0}")]
    RegistryProtocol(#[from] RegistryProtocolError),

    /// A downloaded blob does not hash to its digest.
    #[error("checksum mismatch for {digest}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The digest of the blob.
        digest: String,

        /// The expected hex digest.
        expected: String,

        /// The hex digest computed from the downloaded content.
        actual: String,
    },

    /// Layer extraction failed.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// The image conversion collaborator failed.
    #[error("conversion failure: {0}")]
    ConversionFailure(String),

    /// The transfer collaborator failed.
    #[error("transfer failure: {0}")]
    TransferFailure(String),

    /// The configuration is missing a platform, a location or a required value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A record status change that the transition table does not allow.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// The current status.
        from: ImageStatus,

        /// The requested status.
        to: ImageStatus,
    },

    /// An unsupported hash algorithm was named by a digest.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    /// A caller supplied a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task handle that the dispatcher does not know about.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// An expiration timeout that is not in `days:hours:minutes:seconds` form.
    #[error("invalid expiration timeout: {0}")]
    InvalidExpirationTimeout(String),
}

/// An error describing how a registry response violated the distribution protocol.
#[derive(Debug, Error)]
pub enum RegistryProtocolError {
    /// The registry returned an unexpected status code.
    #[error("unexpected status {status} for {url}")]
    BadStatus {
        /// The status code.
        status: u16,

        /// The requested url.
        url: String,
    },

    /// The manifest response has no `docker-content-digest` header.
    #[error("missing docker-content-digest header")]
    MissingDigestHeader,

    /// The `docker-content-digest` header is not `<algorithm>:<hex>`.
    #[error("invalid docker-content-digest header: {0}")]
    InvalidDigestHeader(String),

    /// The manifest does not hash to the digest announced by the registry.
    #[error("manifest digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The announced hex digest.
        expected: String,

        /// The hex digest computed from the signed payload.
        actual: String,
    },

    /// The body length disagrees with the `content-length` header.
    #[error("content length mismatch: expected {expected} bytes, got {actual}")]
    ContentLengthMismatch {
        /// The announced length.
        expected: u64,

        /// The received length.
        actual: u64,
    },

    /// The manifest does not follow the expected schema.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// The manifest history does not form a single linear chain.
    #[error("invalid layer graph: {0}")]
    InvalidLayerGraph(String),

    /// A blob download bounced through too many redirects.
    #[error("too many redirects while fetching {0}")]
    TooManyRedirects(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GatewayError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> GatewayError {
        GatewayError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `GatewayResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> GatewayResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
