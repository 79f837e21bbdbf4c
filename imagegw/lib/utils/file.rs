use std::path::Path;

use oci_spec::image::DigestAlgorithm;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const HASH_BUFFER_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An incremental hasher over one of the digest algorithms registries use.
pub enum DigestHasher {
    /// SHA-256.
    Sha256(Sha256),

    /// SHA-384.
    Sha384(Sha384),

    /// SHA-512.
    Sha512(Sha512),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DigestHasher {
    /// Creates a hasher for the given algorithm.
    ///
    /// ## Errors
    ///
    /// Returns `UnsupportedHashAlgorithm` for anything other than sha256, sha384 and sha512.
    pub fn new(algorithm: &DigestAlgorithm) -> GatewayResult<Self> {
        match algorithm {
            DigestAlgorithm::Sha256 => Ok(Self::Sha256(Sha256::new())),
            DigestAlgorithm::Sha384 => Ok(Self::Sha384(Sha384::new())),
            DigestAlgorithm::Sha512 => Ok(Self::Sha512(Sha512::new())),
            _ => Err(GatewayError::UnsupportedHashAlgorithm(algorithm.to_string())),
        }
    }

    /// Feeds more bytes into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha384(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Gets the hex encoded hash of a file, reading it in chunks.
pub async fn get_file_hash(path: &Path, algorithm: &DigestAlgorithm) -> GatewayResult<String> {
    let mut hasher = DigestHasher::new(algorithm)?;
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize_hex())
}

/// Gets the hex encoded hash of an in-memory buffer.
pub fn get_bytes_hash(bytes: &[u8], algorithm: &DigestAlgorithm) -> GatewayResult<String> {
    let mut hasher = DigestHasher::new(algorithm)?;
    hasher.update(bytes);
    Ok(hasher.finalize_hex())
}

/// Returns true if `path` is `root` or lies below it once both are made absolute.
///
/// Neither path has to exist. `..` segments are resolved lexically.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let normalize = |p: &Path| {
        let mut out = std::path::PathBuf::new();
        for component in p.components() {
            match component {
                std::path::Component::ParentDir => {
                    out.pop();
                }
                std::path::Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        out
    };

    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize(&path).starts_with(normalize(&root))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
