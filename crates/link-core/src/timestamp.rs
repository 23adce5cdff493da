//! Canonical timestamp format shared by both peers.
//!
//! Every timestamp on the wire (heartbeats, core start time) uses
//! `dd:MM:yyyy HH:mm:ss.zzz` in UTC. Encoding keeps milliseconds only, so a
//! value survives encode -> decode when it carries no finer precision.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use thiserror::Error;

/// chrono layout for `dd:MM:yyyy HH:mm:ss.zzz`.
pub const TIMESTAMP_FORMAT: &str = "%d:%m:%Y %H:%M:%S%.3f";

#[derive(Debug, Error)]
#[error("Invalid timestamp {value:?}: {source}")]
pub struct TimestampError {
    value: String,
    #[source]
    source: chrono::ParseError,
}

/// Current time truncated to millisecond precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|source| TimestampError {
            value: value.to_string(),
            source,
        })
}

/// Serde adapter: `#[serde(with = "crate::timestamp::canonical")]`.
pub mod canonical {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(timestamp: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let value = String::deserialize(d)?;
        super::parse_timestamp(&value).map_err(serde::de::Error::custom)
    }
}
