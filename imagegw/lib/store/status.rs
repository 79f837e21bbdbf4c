use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of an image record.
///
/// ```text
/// INIT → ENQUEUED → PULLING → EXAMINATION → CONVERSION → TRANSFER → READY → EXPIRED
///   └──────────┴─────────┴───────────┴────────────┴──────────┴──→ FAILURE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    /// A pull record was created.
    Init,

    /// The pull task was handed to the dispatcher.
    Enqueued,

    /// A worker is fetching the manifest and layers.
    Pulling,

    /// A worker is examining the expanded image.
    Examination,

    /// A worker is converting the expanded image.
    Conversion,

    /// A worker is copying the image to the target system.
    Transfer,

    /// The image is available on the target system.
    Ready,

    /// The pull failed.
    Failure,

    /// The image was removed from the target system.
    Expired,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageStatus {
    /// All statuses a pull can be in before it completes.
    pub const IN_FLIGHT: [ImageStatus; 6] = [
        ImageStatus::Init,
        ImageStatus::Enqueued,
        ImageStatus::Pulling,
        ImageStatus::Examination,
        ImageStatus::Conversion,
        ImageStatus::Transfer,
    ];

    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Init => "INIT",
            ImageStatus::Enqueued => "ENQUEUED",
            ImageStatus::Pulling => "PULLING",
            ImageStatus::Examination => "EXAMINATION",
            ImageStatus::Conversion => "CONVERSION",
            ImageStatus::Transfer => "TRANSFER",
            ImageStatus::Ready => "READY",
            ImageStatus::Failure => "FAILURE",
            ImageStatus::Expired => "EXPIRED",
        }
    }

    /// Returns true while a pull is still in progress.
    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Returns true once a pull has reached an outcome.
    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    /// Returns true if a record may move from `self` to `next`.
    ///
    /// In-flight states only move forward. Repeating the same in-flight state refreshes the
    /// heartbeat. READY may be refreshed or expired. FAILURE and EXPIRED are final.
    pub fn can_transition_to(&self, next: ImageStatus) -> bool {
        use ImageStatus::*;

        match (self, next) {
            (from, to) if from.is_in_flight() && to.is_in_flight() => to >= *from,
            (from, Ready | Failure) if from.is_in_flight() => true,
            (Ready, Ready | Expired) => true,
            _ => false,
        }
    }

    /// Checks a transition against the table.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidTransition` when [`can_transition_to`] rejects it.
    ///
    /// [`can_transition_to`]: ImageStatus::can_transition_to
    pub fn transition_to(&self, next: ImageStatus) -> GatewayResult<ImageStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(GatewayError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INIT" => ImageStatus::Init,
            "ENQUEUED" => ImageStatus::Enqueued,
            "PULLING" => ImageStatus::Pulling,
            "EXAMINATION" => ImageStatus::Examination,
            "CONVERSION" => ImageStatus::Conversion,
            "TRANSFER" => ImageStatus::Transfer,
            "READY" => ImageStatus::Ready,
            "FAILURE" => ImageStatus::Failure,
            "EXPIRED" => ImageStatus::Expired,
            other => {
                return Err(GatewayError::InvalidArgument(format!(
                    "unknown image status: {other}"
                )))
            }
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_status_string_forms() -> anyhow::Result<()> {
        for status in ImageStatus::IN_FLIGHT
            .into_iter()
            .chain([ImageStatus::Ready, ImageStatus::Failure, ImageStatus::Expired])
        {
            assert_eq!(status.as_str().parse::<ImageStatus>()?, status);
            assert_eq!(
                serde_json::to_string(&status)?,
                format!("\"{}\"", status.as_str())
            );
        }
        assert!("SUCCESS".parse::<ImageStatus>().is_err());
        Ok(())
    }

    #[test]
    fn test_image_status_transitions() {
        use ImageStatus::*;

        assert!(Init.can_transition_to(Enqueued));
        assert!(Enqueued.can_transition_to(Transfer));
        assert!(Pulling.can_transition_to(Pulling));
        assert!(Conversion.can_transition_to(Ready));
        assert!(Init.can_transition_to(Failure));
        assert!(Ready.can_transition_to(Expired));
        assert!(Ready.can_transition_to(Ready));

        assert!(!Transfer.can_transition_to(Pulling));
        assert!(!Init.can_transition_to(Expired));
        assert!(!Failure.can_transition_to(Ready));
        assert!(!Expired.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Pulling));
        assert!(!Ready.can_transition_to(Failure));

        assert!(matches!(
            Expired.transition_to(Init),
            Err(GatewayError::InvalidTransition { from: Expired, to: Init })
        ));
    }
}
