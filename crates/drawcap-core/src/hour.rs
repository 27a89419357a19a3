//! Close-hour parsing and canonical `HH:00` buckets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HourError {
    #[error("empty close hour")]
    Empty,
    #[error("malformed close hour {0:?}")]
    Malformed(String),
    #[error("close hour out of range {0:?}")]
    OutOfRange(String),
}

/// A provider close time split into hour and minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloseTime {
    pub hour: u8,
    pub minute: u8,
}

impl CloseTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, HourError> {
        if hour > 23 || minute > 59 {
            return Err(HourError::OutOfRange(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    /// Parses `HH:MM`, `H:MM`, `HHhMM` and bare `HH`.
    pub fn parse(raw: &str) -> Result<Self, HourError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HourError::Empty);
        }
        let normalized = trimmed.replace(['h', 'H'], ":");
        let mut parts = normalized.splitn(2, ':');
        let hour_text = parts.next().unwrap_or_default().trim();
        let minute_text = parts.next().map(str::trim).unwrap_or("");

        let hour = parse_two_digits(hour_text, raw)?;
        let minute = if minute_text.is_empty() {
            0
        } else {
            parse_two_digits(minute_text, raw)?
        };
        Self::new(hour, minute).map_err(|_| HourError::OutOfRange(raw.to_string()))
    }

    /// Maps the close time onto its canonical bucket. Minutes within
    /// `tolerance` of the next hour belong to that hour; everything else
    /// truncates. A bucket never crosses midnight, so `23:59` stays `23:00`.
    pub fn bucket(&self, tolerance: u8) -> HourBucket {
        if tolerance > 0 && self.hour < 23 && self.minute >= 60u8.saturating_sub(tolerance) {
            HourBucket(self.hour + 1)
        } else {
            HourBucket(self.hour)
        }
    }

    /// Minutes between this close time and the top of `bucket`.
    pub fn distance_to(&self, bucket: HourBucket) -> u32 {
        let own = u32::from(self.hour) * 60 + u32::from(self.minute);
        own.abs_diff(u32::from(bucket.0) * 60)
    }
}

impl fmt::Display for CloseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

fn parse_two_digits(text: &str, raw: &str) -> Result<u8, HourError> {
    if text.is_empty() || text.len() > 2 || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(HourError::Malformed(raw.to_string()));
    }
    text.parse::<u8>()
        .map_err(|_| HourError::Malformed(raw.to_string()))
}

/// Canonical slot hour, rendered as `HH:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourBucket(u8);

impl HourBucket {
    pub fn new(hour: u8) -> Result<Self, HourError> {
        if hour > 23 {
            return Err(HourError::OutOfRange(hour.to_string()));
        }
        Ok(Self(hour))
    }

    pub fn hour(&self) -> u8 {
        self.0
    }

    /// Canonical bucket plus the raw text worth keeping. The raw text is
    /// only kept when it names a minute other than the bucket's own `:00`.
    pub fn from_raw(raw: &str, tolerance: u8) -> Result<(Self, Option<String>), HourError> {
        let close = CloseTime::parse(raw)?;
        let bucket = close.bucket(tolerance);
        let aux = if close.minute == 0 && close.hour == bucket.0 {
            None
        } else {
            Some(close.to_string())
        };
        Ok((bucket, aux))
    }

    /// Close-hour strings tried for this bucket, nearest first:
    /// `HH:00`, `HH:01`, `HH-1:59`, `HH:02`, `HH-1:58`, ...
    /// Every candidate maps back onto this bucket under `tolerance`; the
    /// `00:00` bucket has no previous-day variants.
    pub fn candidates(&self, tolerance: u8) -> Vec<String> {
        let mut out = vec![format!("{:02}:00", self.0)];
        for step in 1..=tolerance.min(29) {
            out.push(format!("{:02}:{:02}", self.0, step));
            if self.0 > 0 {
                out.push(format!("{:02}:{:02}", self.0 - 1, 60 - step));
            }
        }
        out
    }
}

impl fmt::Display for HourBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00", self.0)
    }
}

impl FromStr for HourBucket {
    type Err = HourError;

    /// Strict: only accepts whole hours (`HH:00` or `HH`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let close = CloseTime::parse(s)?;
        if close.minute != 0 {
            return Err(HourError::Malformed(s.to_string()));
        }
        Ok(Self(close.hour))
    }
}

impl Serialize for HourBucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HourBucket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
