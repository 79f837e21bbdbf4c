use std::{collections::BTreeMap, fmt};

use getset::Getters;

use crate::{backends::DEFAULT_TOKEN_KEY, config::GatewayConfig, GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A pull tag resolved against the configured locations.
///
/// `registry.example.org/team/app:1.0` names the location `registry.example.org` when it is
/// configured. Otherwise the whole tag is read against the default location.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PullReference {
    /// The registry location.
    location: String,

    /// The repository on that location.
    repository: String,

    /// The tag within the repository.
    tag: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullReference {
    /// Parses `pulltag` as `[<location>/]<repository>:<tag>`.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidArgument` unless the remainder splits into exactly one repository and tag.
    pub fn parse(pulltag: &str, config: &GatewayConfig) -> GatewayResult<Self> {
        let mut location = config.get_default_image_location().clone();
        let mut rest = pulltag;

        if let Some((first, remainder)) = pulltag.split_once('/') {
            if !first.is_empty() && config.get_locations().contains_key(first) {
                location = first.to_string();
                rest = remainder;
            }
        }

        let mut parts = rest.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(repository), Some(tag), None) if !repository.is_empty() && !tag.is_empty() => {
                Ok(Self {
                    location,
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                })
            }
            _ => Err(GatewayError::InvalidArgument(format!(
                "unable to parse tag {pulltag}"
            ))),
        }
    }

    /// Returns the `(user, password)` pair for this location from session tokens.
    ///
    /// A token for the location wins over the `default` one. A token without `:` is a user name
    /// with an empty password.
    pub fn credentials(&self, tokens: &BTreeMap<String, String>) -> Option<(String, String)> {
        let token = tokens
            .get(&self.location)
            .or_else(|| tokens.get(DEFAULT_TOKEN_KEY))?;

        Some(match token.split_once(':') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => (token.clone(), String::new()),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for PullReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.location, self.repository, self.tag)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{LocationConfig, PlatformConfig};

    fn config() -> GatewayConfig {
        GatewayConfig::builder()
            .platforms(HashMap::from([(
                "cluster".to_string(),
                PlatformConfig::builder().build(),
            )]))
            .locations(HashMap::from([
                (
                    "index.docker.io".to_string(),
                    LocationConfig::builder().build(),
                ),
                (
                    "registry.local".to_string(),
                    LocationConfig::builder().build(),
                ),
            ]))
            .build()
    }

    #[test]
    fn test_pull_reference_parse() -> anyhow::Result<()> {
        let config = config();

        let reference = PullReference::parse("ubuntu:latest", &config)?;
        assert_eq!(reference.get_location(), "index.docker.io");
        assert_eq!(reference.get_repository(), "ubuntu");
        assert_eq!(reference.get_tag(), "latest");

        let reference = PullReference::parse("registry.local/team/app:1.0", &config)?;
        assert_eq!(reference.get_location(), "registry.local");
        assert_eq!(reference.get_repository(), "team/app");

        // An unknown first segment is part of the repository
        let reference = PullReference::parse("team/app:1.0", &config)?;
        assert_eq!(reference.get_location(), "index.docker.io");
        assert_eq!(reference.get_repository(), "team/app");

        for bad in ["ubuntu", "ubuntu:1:2", ":latest", "ubuntu:"] {
            assert!(matches!(
                PullReference::parse(bad, &config),
                Err(GatewayError::InvalidArgument(_))
            ));
        }

        Ok(())
    }

    #[test]
    fn test_pull_reference_credentials() -> anyhow::Result<()> {
        let config = config();
        let reference = PullReference::parse("registry.local/team/app:1.0", &config)?;

        let tokens = BTreeMap::from([
            ("default".to_string(), "anon:".to_string()),
            ("registry.local".to_string(), "alice:pa:ss".to_string()),
        ]);
        assert_eq!(
            reference.credentials(&tokens),
            Some(("alice".to_string(), "pa:ss".to_string()))
        );

        let tokens = BTreeMap::from([("default".to_string(), "bob".to_string())]);
        assert_eq!(
            reference.credentials(&tokens),
            Some(("bob".to_string(), String::new()))
        );

        assert_eq!(reference.credentials(&BTreeMap::new()), None);

        Ok(())
    }
}
