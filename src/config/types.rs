use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::{Regex, RegexBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer};

/// A span of time written either as whole seconds or as a `1d 2h 3m 4s` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub fn from_secs(seconds: u64) -> Self {
        Self(std::time::Duration::from_secs(seconds))
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseDurationError {
    #[error("`{0}` is not a duration")]
    Malformed(String),

    #[error("duration `{0}` is too large")]
    TooLarge(String),
}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static REGEXP: OnceLock<Regex> = OnceLock::new();

        let regexp = REGEXP.get_or_init(|| {
            RegexBuilder::new(
                r"
                ^
                (?:(?<days>    \d+)d)? \s*
                (?:(?<hours>   \d+)h)? \s*
                (?:(?<minutes> \d+)m)? \s*
                (?:(?<seconds> \d+)s)?
                $",
            )
            .ignore_whitespace(true)
            .build()
            .unwrap()
        });

        if let Ok(seconds) = s.trim().parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }

        let malformed = || ParseDurationError::Malformed(s.into());
        let captures = regexp.captures(s.trim()).ok_or_else(malformed)?;

        let mut parts = [0u64; 4];
        let mut found = false;

        for (part, name) in parts.iter_mut().zip(["days", "hours", "minutes", "seconds"]) {
            if let Some(m) = captures.name(name) {
                *part = m
                    .as_str()
                    .parse()
                    .map_err(|_| ParseDurationError::TooLarge(s.into()))?;
                found = true;
            }
        }

        if !found {
            return Err(malformed());
        }

        let [days, hours, minutes, seconds] = parts;

        days.checked_mul(24)
            .and_then(|h| h.checked_add(hours))
            .and_then(|h| h.checked_mul(60))
            .and_then(|m| m.checked_add(minutes))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(seconds))
            .map(Duration::from_secs)
            .ok_or_else(|| ParseDurationError::TooLarge(s.into()))
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a duration")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_u64(v.try_into().map_err(E::custom)?)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!("1d 2h".parse(), Ok(Duration::from_secs(26 * 3600)));
        assert_eq!("15m".parse(), Ok(Duration::from_secs(900)));
        assert_eq!("1h30m10s".parse(), Ok(Duration::from_secs(5410)));
        assert_eq!("42".parse(), Ok(Duration::from_secs(42)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Duration>().is_err());
        assert!("soon".parse::<Duration>().is_err());
        assert!("5 minutes".parse::<Duration>().is_err());
    }
}
