use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE, Engine};
use bytes::Bytes;
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};

use crate::{utils, GatewayResult, RegistryProtocolError};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The media type of signed schema 1 manifests.
pub const MANIFEST_V1_SIGNED_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// The media type of unsigned schema 1 manifests.
pub const MANIFEST_V1_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A Docker image manifest, schema version 1.
///
/// `fs_layers[i]` and `history[i]` describe the same layer, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    /// Must be 1.
    pub schema_version: u32,

    /// Repository name.
    #[serde(default)]
    pub name: Option<String>,

    /// Tag the manifest was fetched for.
    #[serde(default)]
    pub tag: Option<String>,

    /// Image architecture.
    #[serde(default)]
    pub architecture: Option<String>,

    /// Layer blobs.
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,

    /// Layer history, one JSON document per layer.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// JWS signature blocks.
    #[serde(default)]
    pub signatures: Vec<SignatureBlock>,
}

/// A layer blob reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsLayer {
    /// The blob digest.
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// A history entry carrying the v1 layer configuration as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The serialized layer configuration.
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// A JWS signature block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// The unprotected header.
    #[serde(default)]
    pub header: serde_json::Value,

    /// The signature.
    #[serde(default)]
    pub signature: String,

    /// The base64url encoded protected header.
    pub protected: String,
}

/// The fields of a protected header that locate the signed payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

/// A manifest whose content matched the digest announced by the registry.
#[derive(Debug, Clone)]
pub struct VerifiedManifest {
    /// The parsed manifest.
    pub manifest: SignedManifest,

    /// The verified digest.
    pub digest: Digest,

    /// The raw response body.
    pub raw: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SignedManifest {
    /// Checks the schema version and that layers and history pair up.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.schema_version != 1 {
            return Err(RegistryProtocolError::MalformedManifest(format!(
                "unsupported schema version {}",
                self.schema_version
            ))
            .into());
        }

        if self.fs_layers.is_empty() || self.history.is_empty() {
            return Err(RegistryProtocolError::MalformedManifest(
                "manifest has no layers".to_string(),
            )
            .into());
        }

        if self.fs_layers.len() != self.history.len() {
            return Err(RegistryProtocolError::MalformedManifest(format!(
                "{} layers but {} history entries",
                self.fs_layers.len(),
                self.history.len()
            ))
            .into());
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses and verifies a manifest body against the `docker-content-digest` header value.
///
/// The signed payload of a JWS manifest is the body prefix of `formatLength` bytes followed by
/// the decoded `formatTail`. Every signature block must agree on both. Unsigned manifests are
/// hashed whole.
///
/// ## Errors
///
/// * `MissingDigestHeader` / `InvalidDigestHeader` for a missing or malformed header
/// * `MalformedManifest` for bodies that are not schema 1 manifests
/// * `DigestMismatch` when the payload does not hash to the announced digest
pub fn verify_manifest(raw: Bytes, digest_header: Option<&str>) -> GatewayResult<VerifiedManifest> {
    let header = digest_header.ok_or(RegistryProtocolError::MissingDigestHeader)?;
    let digest = Digest::from_str(header.trim())
        .map_err(|_| RegistryProtocolError::InvalidDigestHeader(header.to_string()))?;

    let manifest: SignedManifest = serde_json::from_slice(&raw)
        .map_err(|e| RegistryProtocolError::MalformedManifest(e.to_string()))?;

    let payload = signed_payload(&raw, &manifest.signatures)?;
    let actual = utils::get_bytes_hash(&payload, digest.algorithm())?;
    if actual != digest.digest() {
        return Err(RegistryProtocolError::DigestMismatch {
            expected: digest.digest().to_string(),
            actual,
        }
        .into());
    }

    manifest.validate()?;

    Ok(VerifiedManifest {
        manifest,
        digest,
        raw,
    })
}

/// Reconstructs the byte range covered by the manifest signatures.
pub fn signed_payload(raw: &[u8], signatures: &[SignatureBlock]) -> GatewayResult<Vec<u8>> {
    let mut located: Option<(usize, Vec<u8>)> = None;

    for block in signatures {
        let protected: ProtectedHeader = serde_json::from_slice(&jose_decode(&block.protected)?)
            .map_err(|e| {
                RegistryProtocolError::MalformedManifest(format!("bad protected header: {e}"))
            })?;
        let tail = jose_decode(&protected.format_tail)?;

        match &located {
            Some((length, existing)) if *length != protected.format_length || *existing != tail => {
                return Err(RegistryProtocolError::MalformedManifest(
                    "signature blocks disagree on the signed payload".to_string(),
                )
                .into());
            }
            Some(_) => {}
            None => located = Some((protected.format_length, tail)),
        }
    }

    let Some((length, tail)) = located else {
        return Ok(raw.to_vec());
    };

    if length > raw.len() {
        return Err(RegistryProtocolError::MalformedManifest(format!(
            "formatLength {length} exceeds body length {}",
            raw.len()
        ))
        .into());
    }

    let mut payload = Vec::with_capacity(length + tail.len());
    payload.extend_from_slice(&raw[..length]);
    payload.extend_from_slice(&tail);
    Ok(payload)
}

/// Decodes base64url data whose padding was stripped as RFC 7515 requires.
pub fn jose_decode(data: &str) -> GatewayResult<Vec<u8>> {
    let data = data.trim_end_matches('=');
    let mut padded = String::with_capacity(data.len() + 3);
    padded.push_str(data);
    for _ in 0..(4 - data.len() % 4) % 4 {
        padded.push('=');
    }

    URL_SAFE.decode(padded.as_bytes()).map_err(|e| {
        RegistryProtocolError::MalformedManifest(format!("bad base64url data: {e}")).into()
    })
}

/// Encodes data as unpadded base64url.
pub fn jose_encode(data: &[u8]) -> String {
    URL_SAFE.encode(data).trim_end_matches('=').to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use oci_spec::image::DigestAlgorithm;

    use super::*;
    use crate::GatewayError;

    #[test]
    fn test_jose_roundtrip_with_stripped_padding() -> anyhow::Result<()> {
        for input in [&b"a"[..], b"ab", b"abc", b"abcd", b"\xff\xfe\xfd"] {
            let encoded = jose_encode(input);
            assert!(!encoded.ends_with('='));
            assert_eq!(jose_decode(&encoded)?, input);
        }
        Ok(())
    }

    #[test]
    fn test_verify_signed_manifest() -> anyhow::Result<()> {
        let (raw, digest) = helper::signed_manifest_body();
        let verified = verify_manifest(raw.clone(), Some(&digest))?;
        assert_eq!(verified.manifest.fs_layers.len(), 1);
        assert_eq!(verified.digest.to_string(), digest);

        // The signature block is not covered by the digest
        assert_ne!(
            utils::get_bytes_hash(&raw, &DigestAlgorithm::Sha256)?,
            verified.digest.digest()
        );

        Ok(())
    }

    #[test]
    fn test_verify_manifest_detects_flipped_byte() -> anyhow::Result<()> {
        let (raw, digest) = helper::signed_manifest_body();
        let mut tampered = raw.to_vec();
        let position = tampered
            .windows(6)
            .position(|w| w == b"ubuntu")
            .expect("name present");
        tampered[position] = b'U';

        let result = verify_manifest(Bytes::from(tampered), Some(&digest));
        assert!(matches!(
            result,
            Err(GatewayError::RegistryProtocol(
                RegistryProtocolError::DigestMismatch { .. }
            ))
        ));

        Ok(())
    }

    #[test]
    fn test_verify_manifest_header_errors() {
        let (raw, _) = helper::signed_manifest_body();
        assert!(matches!(
            verify_manifest(raw.clone(), None),
            Err(GatewayError::RegistryProtocol(
                RegistryProtocolError::MissingDigestHeader
            ))
        ));
        assert!(matches!(
            verify_manifest(raw, Some("not-a-digest")),
            Err(GatewayError::RegistryProtocol(
                RegistryProtocolError::InvalidDigestHeader(_)
            ))
        ));
    }

    #[test]
    fn test_verify_unsigned_manifest_and_schema() -> anyhow::Result<()> {
        let raw = Bytes::from_static(
            br#"{"schemaVersion": 1, "fsLayers": [{"blobSum": "sha256:aa"}], "history": []}"#,
        );
        let digest = format!(
            "sha256:{}",
            utils::get_bytes_hash(&raw, &DigestAlgorithm::Sha256)?
        );

        // Digest matches but layers and history do not pair up
        assert!(matches!(
            verify_manifest(raw, Some(&digest)),
            Err(GatewayError::RegistryProtocol(
                RegistryProtocolError::MalformedManifest(_)
            ))
        ));

        Ok(())
    }

    #[test]
    fn test_signed_payload_rejects_disagreeing_blocks() {
        let block = |length: usize| SignatureBlock {
            header: serde_json::Value::Null,
            signature: String::new(),
            protected: jose_encode(
                format!(r#"{{"formatLength":{length},"formatTail":"{}"}}"#, jose_encode(b"\n}"))
                    .as_bytes(),
            ),
        };

        assert!(signed_payload(b"0123456789", &[block(4), block(4)]).is_ok());
        assert!(signed_payload(b"0123456789", &[block(4), block(5)]).is_err());
        assert!(signed_payload(b"0123", &[block(40)]).is_err());
    }
}
