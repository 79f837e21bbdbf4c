use serde::Deserialize;

use crate::{GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The scheme, e.g. `Bearer`.
    pub mode: String,

    /// The token endpoint.
    pub realm: String,

    /// The service the token is requested for.
    pub service: Option<String>,

    /// The scope the token is requested for.
    pub scope: Option<String>,
}

/// A token endpoint response. Registries use either `token` or `access_token`.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    access_token: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AuthChallenge {
    /// Parses a `WWW-Authenticate: <mode> realm=…,service=…,scope=…` header value.
    ///
    /// Values may be quoted, commas inside quotes do not split parameters.
    ///
    /// ## Errors
    ///
    /// Returns `AuthenticationFailed` if the header has no scheme or no realm.
    pub fn parse(header: &str) -> GatewayResult<Self> {
        let header = header.trim();
        let (mode, params) = header.split_once(' ').ok_or_else(|| {
            GatewayError::AuthenticationFailed(format!("malformed auth challenge: {header}"))
        })?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for part in split_auth_params(params) {
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim().trim_matches('"').to_string();
                match key.trim().to_ascii_lowercase().as_str() {
                    "realm" => realm = Some(value),
                    "service" => service = Some(value),
                    "scope" => scope = Some(value),
                    _ => {}
                }
            }
        }

        let realm = realm.ok_or_else(|| {
            GatewayError::AuthenticationFailed(format!("auth challenge has no realm: {header}"))
        })?;

        Ok(Self {
            mode: mode.to_string(),
            realm,
            service,
            scope,
        })
    }

    /// Returns true for a bearer token challenge.
    pub fn is_bearer(&self) -> bool {
        self.mode.eq_ignore_ascii_case("bearer")
    }

    /// Returns the query parameters for the token request.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(service) = &self.service {
            query.push(("service", service.clone()));
        }
        if let Some(scope) = &self.scope {
            query.push(("scope", scope.clone()));
        }
        query
    }
}

impl TokenResponse {
    /// Returns whichever token field the registry filled in.
    pub(crate) fn into_token(self) -> GatewayResult<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                GatewayError::AuthenticationFailed("token response has no token".to_string())
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Split auth header parameters, respecting quoted values.
fn split_auth_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(s[start..].trim());
    }
    parts
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
