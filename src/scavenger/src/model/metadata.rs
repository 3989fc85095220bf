//! Stream metadata carrying retention policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention policy of a stream as written to its metastream.
///
/// Unknown or malformed metadata parses to the empty policy: any metadata
/// write replaces the previous one, even one we cannot read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(
        rename = "$maxAge",
        default,
        skip_serializing_if = "Option::is_none",
        with = "seconds"
    )]
    pub max_age: Option<Duration>,

    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,

    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    pub fn parse(data: &[u8]) -> Self {
        match serde_json::from_slice::<StreamMetadata>(data) {
            Ok(metadata) => metadata.sanitized(),
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable stream metadata, treating as empty");
                Self::default()
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            ..Self::default()
        }
    }

    pub fn with_max_count(max_count: i64) -> Self {
        Self {
            max_count: Some(max_count),
            ..Self::default()
        }
    }

    pub fn with_truncate_before(truncate_before: i64) -> Self {
        Self {
            truncate_before: Some(truncate_before),
            ..Self::default()
        }
    }

    pub fn has_policy(&self) -> bool {
        self.max_age.is_some() || self.max_count.is_some() || self.truncate_before.is_some()
    }

    // negative counts and truncations are meaningless
    fn sanitized(self) -> Self {
        Self {
            max_age: self.max_age,
            max_count: self.max_count.filter(|count| *count > 0),
            truncate_before: self.truncate_before.filter(|tb| *tb >= 0),
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_u64(duration.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
