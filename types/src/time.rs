//! The canonical wire and storage timestamp format.
//!
//! Every timestamp crossing the API or landing in storage is ISO-8601 UTC
//! with exactly millisecond precision (`2024-01-31T09:30:00.000Z`). Client
//! clocks are never trusted for ordering: a submission timestamp that does
//! not match this format is replaced by the server-observed time.

use chrono::{DateTime, NaiveDateTime, Utc};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Rendered length of [`TS_FORMAT`].
const TS_LEN: usize = 24;

/// Render a timestamp in the canonical format.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a timestamp in the canonical format. Anything else (missing
/// milliseconds, offsets other than `Z`, trailing garbage) is rejected.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != TS_LEN || !value.ends_with('Z') {
        return None;
    }
    NaiveDateTime::parse_from_str(value, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for `DateTime<Utc>` fields in the canonical format.
pub mod ts_millis {
    use super::{format_ts, parse_ts};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_ts(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_ts(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

/// Serde adapter for optional timestamps; `None` serializes as `null`.
pub mod ts_millis_opt {
    use super::{format_ts, parse_ts};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&format_ts(*ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) => parse_ts(&raw)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}
