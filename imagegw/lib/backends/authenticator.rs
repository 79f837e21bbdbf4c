use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::GatewayConfig, GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The status a mock credential must carry to be accepted.
pub const MOCK_GOOD_STATUS: &str = "good";

/// The token key used when a location has no credentials of its own.
pub const DEFAULT_TOKEN_KEY: &str = "default";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Who a credential belongs to, as vouched for by the authentication backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthIdentity {
    /// The user name.
    pub user: String,

    /// The primary group name.
    pub group: String,

    /// The numeric user id.
    #[serde(default)]
    pub uid: Option<u32>,

    /// The numeric group id.
    #[serde(default)]
    pub gid: Option<u32>,

    /// Registry credentials by location, as `user:password`.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

/// An authenticator for development and tests.
///
/// Credentials have the form `status:user:group[:tokens[:uid:gid]]` and are accepted when the
/// status is `good`. `tokens` is either a JSON object of per-location credentials or a single
/// credential used for every location.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockAuthenticator;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Verifies a credential presented for a system.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the identity behind `credential`.
    ///
    /// ## Errors
    ///
    /// Returns `AuthenticationFailed` when the credential is rejected.
    async fn authenticate(&self, credential: &str, system: &str) -> GatewayResult<AuthIdentity>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the authenticator named by the `Authentication` setting.
pub fn authenticator_for(config: &GatewayConfig) -> GatewayResult<Arc<dyn Authenticator>> {
    match config.get_authentication().as_str() {
        "mock" => Ok(Arc::new(MockAuthenticator)),
        "munge" => Err(GatewayError::Configuration(
            "munge authentication is not available in this build".to_string(),
        )),
        other => Err(GatewayError::Configuration(format!(
            "unsupported authentication type: {other}"
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn parse_tokens(raw: &str) -> GatewayResult<BTreeMap<String, String>> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    if raw.trim_start().starts_with('{') {
        return serde_json::from_str(raw)
            .map_err(|e| GatewayError::AuthenticationFailed(format!("bad tokens: {e}")));
    }

    Ok(BTreeMap::from([(DEFAULT_TOKEN_KEY.to_string(), raw.to_string())]))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, credential: &str, system: &str) -> GatewayResult<AuthIdentity> {
        let parts: Vec<&str> = credential.split(':').collect();
        if parts.len() < 3 {
            return Err(GatewayError::AuthenticationFailed(
                "bad credential".to_string(),
            ));
        }

        let status = parts[0];
        if status != MOCK_GOOD_STATUS {
            return Err(GatewayError::AuthenticationFailed(format!(
                "credential rejected for {system} with status {status}"
            )));
        }

        // A trailing numeric pair is the uid and gid, everything in between is the token field
        let ids = match parts.len() {
            n if n >= 6 => parts[n - 2]
                .parse::<u32>()
                .ok()
                .zip(parts[n - 1].parse::<u32>().ok()),
            _ => None,
        };

        let token_parts = match ids {
            Some(_) => &parts[3..parts.len() - 2],
            None => &parts[3..],
        };

        Ok(AuthIdentity {
            user: parts[1].to_string(),
            group: parts[2].to_string(),
            uid: ids.map(|(uid, _)| uid),
            gid: ids.map(|(_, gid)| gid),
            tokens: parse_tokens(&token_parts.join(":"))?,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_authenticator_forms() -> anyhow::Result<()> {
        let auth = MockAuthenticator;

        let identity = auth.authenticate("good:alice:staff", "cluster").await?;
        assert_eq!(identity.user, "alice");
        assert_eq!(identity.group, "staff");
        assert!(identity.tokens.is_empty());
        assert_eq!(identity.uid, None);

        let identity = auth
            .authenticate("good:alice:staff:secret:1000:100", "cluster")
            .await?;
        assert_eq!(identity.uid, Some(1000));
        assert_eq!(identity.gid, Some(100));
        assert_eq!(
            identity.tokens.get(DEFAULT_TOKEN_KEY).map(String::as_str),
            Some("secret")
        );

        let identity = auth
            .authenticate(r#"good:bob:staff:{"registry.local":"bob:pw"}:1001:100"#, "cluster")
            .await?;
        assert_eq!(
            identity.tokens.get("registry.local").map(String::as_str),
            Some("bob:pw")
        );
        assert_eq!(identity.uid, Some(1001));

        Ok(())
    }

    #[tokio::test]
    async fn test_mock_authenticator_rejects_bad_credentials() {
        let auth = MockAuthenticator;

        assert!(matches!(
            auth.authenticate("bad:alice:staff", "cluster").await,
            Err(GatewayError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            auth.authenticate("good:alice", "cluster").await,
            Err(GatewayError::AuthenticationFailed(_))
        ));
    }
}
