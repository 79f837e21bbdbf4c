use std::{fmt, str::FromStr};

use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::GatewayError;

use super::DEFAULT_IMAGE_EXPIRATION_TIMEOUT;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How long a READY image stays alive after its last access.
///
/// Written as `days:hours:minutes:seconds`, e.g. `90:00:00:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationTimeout {
    days: u64,
    hours: u64,
    minutes: u64,
    seconds: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExpirationTimeout {
    /// Creates a new expiration timeout.
    pub fn new(days: u64, hours: u64, minutes: u64, seconds: u64) -> Self {
        Self {
            days,
            hours,
            minutes,
            seconds,
        }
    }

    /// Returns the total number of seconds.
    pub fn as_secs(&self) -> u64 {
        ((self.days * 24 + self.hours) * 60 + self.minutes) * 60 + self.seconds
    }

    /// Returns the timeout as a chrono delta.
    pub fn as_delta(&self) -> TimeDelta {
        TimeDelta::seconds(self.as_secs() as i64)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ExpirationTimeout {
    fn default() -> Self {
        DEFAULT_IMAGE_EXPIRATION_TIMEOUT
            .parse()
            .unwrap_or(Self::new(90, 0, 0, 0))
    }
}

impl FromStr for ExpirationTimeout {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(GatewayError::InvalidExpirationTimeout(s.to_string()));
        }

        let mut values = [0u64; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .parse()
                .map_err(|_| GatewayError::InvalidExpirationTimeout(s.to_string()))?;
        }

        let [days, hours, minutes, seconds] = values;
        Ok(Self::new(days, hours, minutes, seconds))
    }
}

impl fmt::Display for ExpirationTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:02}:{:02}:{:02}",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

impl Serialize for ExpirationTimeout {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExpirationTimeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
