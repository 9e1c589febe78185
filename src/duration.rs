//! Textual durations such as `1w2d`, `1m30s` or `250ms`.
//!
//! Supported units, largest first: `w d h m s ms us ns`. A list of durations
//! is written with spaces or commas between the entries (`"10s, 20s 30s"`).

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

// Sorted by size, largest first; `format` relies on the order.
const UNITS: [(&str, u128); 8] = [
    ("w", 7 * 24 * 3600 * NANOS_PER_SECOND),
    ("d", 24 * 3600 * NANOS_PER_SECOND),
    ("h", 3600 * NANOS_PER_SECOND),
    ("m", 60 * NANOS_PER_SECOND),
    ("s", NANOS_PER_SECOND),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("<undefined>")]
    Empty,
    #[error("unexpected token {token:?} in duration: {input:?}")]
    UnexpectedToken { token: String, input: String },
    #[error("missing unit in duration: {0:?}")]
    MissingUnit(String),
    #[error("invalid unit {unit} in duration: {input:?}")]
    InvalidUnit { unit: String, input: String },
    #[error("duration out of range: {0:?}")]
    Overflow(String),
}

fn unit_nanos(name: &str) -> Option<u128> {
    UNITS.iter().find(|(n, _)| *n == name).map(|(_, nanos)| *nanos)
}

/// Renders `d` as a sequence of `<count><unit>` parts, largest unit first.
pub fn format(d: Duration) -> String {
    let mut rest = d.as_nanos();
    if rest == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (name, nanos) in UNITS {
        if rest >= nanos {
            let count = rest / nanos;
            rest -= count * nanos;
            out.push_str(&count.to_string());
            out.push_str(name);
        }
    }
    out
}

/// Parses a single duration such as `1h30m` or `1.5s`.
pub fn parse(input: &str) -> Result<Duration, DurationError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(DurationError::Empty);
    }

    let mut total: u128 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            let word_len = rest
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(rest.len());
            let token_len = if word_len > 0 {
                word_len
            } else {
                rest.chars().next().map_or(1, char::len_utf8)
            };
            return Err(DurationError::UnexpectedToken {
                token: rest[..token_len].to_string(),
                input: text.to_string(),
            });
        }
        let number = &rest[..number_len];
        rest = rest[number_len..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(DurationError::MissingUnit(text.to_string()));
        }
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let nanos = unit_nanos(unit).ok_or_else(|| DurationError::InvalidUnit {
            unit: unit.to_string(),
            input: text.to_string(),
        })?;

        let part = if let Ok(count) = number.parse::<u128>() {
            count.checked_mul(nanos)
        } else {
            let value: f64 = number.parse().map_err(|_| DurationError::UnexpectedToken {
                token: number.to_string(),
                input: text.to_string(),
            })?;
            Some((value * nanos as f64) as u128)
        };
        total = part
            .and_then(|p| total.checked_add(p))
            .ok_or_else(|| DurationError::Overflow(text.to_string()))?;
    }

    let secs = u64::try_from(total / NANOS_PER_SECOND)
        .map_err(|_| DurationError::Overflow(text.to_string()))?;
    Ok(Duration::new(secs, (total % NANOS_PER_SECOND) as u32))
}

/// Ordered durations, e.g. the backoff intervals of a retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurationList(Vec<Duration>);

impl DurationList {
    pub fn new(durations: Vec<Duration>) -> Self {
        Self(durations)
    }

    pub fn into_inner(self) -> Vec<Duration> {
        self.0
    }
}

impl Deref for DurationList {
    type Target = [Duration];

    fn deref(&self) -> &[Duration] {
        &self.0
    }
}

impl From<Vec<Duration>> for DurationList {
    fn from(durations: Vec<Duration>) -> Self {
        Self(durations)
    }
}

impl FromStr for DurationList {
    type Err = DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split([',', ' '])
            .filter(|part| !part.is_empty())
            .map(parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for DurationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<undefined>");
        }
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&format(*d))?;
        }
        Ok(())
    }
}

impl Serialize for DurationList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DurationList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for a single [`Duration`] written as text.
///
/// ```ignore
/// #[serde(with = "jobgraph::duration::text")]
/// timeout: Duration,
/// ```
pub mod text {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}
