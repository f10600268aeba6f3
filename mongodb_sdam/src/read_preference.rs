use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use crate::SdamError;

/// Staleness bounds below this are rejected no matter the heartbeat frequency.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);
/// Idle primaries write a no-op this often, which bounds how stale a healthy secondary looks.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

pub type TagSet = BTreeMap<String, String>;

/// Where reads may be served from.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    #[serde(default)]
    pub tag_sets: Vec<TagSet>,
    #[serde(default, with = "optional_seconds")]
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadPreferenceMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadPreferenceMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadPreferenceMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadPreferenceMode::Nearest)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    /// Rejects combinations no server could ever satisfy.
    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<(), SdamError> {
        if self.mode == ReadPreferenceMode::Primary {
            if !self.tag_sets.is_empty() {
                return Err(SdamError::InvalidArgument(
                    "read preference mode `primary` cannot be combined with tag sets".to_string(),
                ));
            }
            if self.max_staleness.is_some() {
                return Err(SdamError::InvalidArgument(
                    "read preference mode `primary` cannot be combined with maxStalenessSeconds"
                        .to_string(),
                ));
            }
        }

        if let Some(max_staleness) = self.max_staleness {
            let floor = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
            if max_staleness < floor {
                return Err(SdamError::InvalidArgument(format!(
                    "maxStalenessSeconds must be at least {} seconds, got {}",
                    floor.as_secs(),
                    max_staleness.as_secs()
                )));
            }
        }
        Ok(())
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        // Negative values mean "no maximum".
        Ok(Option::<i64>::deserialize(deserializer)?
            .filter(|s| *s >= 0)
            .map(|s| Duration::from_secs(s as u64)))
    }
}
