use std::fmt::{self, Display};

use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// The canonical `YYYY-MM-DD HH:MM:SS` representation of notification dates (always UTC).
pub static DATE_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// A single feed item, normalized for the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub severity: i64,
    pub published_at: OffsetDateTime,
    pub title: String,
    pub description: String,
    pub url: String,
}

impl FeedEntry {
    /// The publication date in [`DATE_FORMAT`].
    pub fn date_added(&self) -> String {
        format_date(self.published_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Critical = 1,
    Major = 2,
    Minor = 3,
    Notice = 4,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::Major,
        Severity::Minor,
        Severity::Notice,
    ];

    pub fn from_level(level: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as i64 == level)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Notice => "notice",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Reads the leading integer of `raw` the way loosely typed feeds expect: surrounding garbage is
/// ignored and anything without a leading number is `0`.
pub fn coerce_severity(raw: &str) -> i64 {
    let s = raw.trim_start();

    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value = digits[..end].bytes().fold(0i64, |acc, d| {
        acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
    });

    if negative {
        -value
    } else {
        value
    }
}

/// Parses a feed date. Unrecognized dates become the unix epoch.
pub fn parse_date(raw: &str) -> OffsetDateTime {
    let raw = raw.trim();

    OffsetDateTime::parse(raw, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc3339))
        .or_else(|_| PrimitiveDateTime::parse(raw, DATE_FORMAT).map(PrimitiveDateTime::assume_utc))
        .map(|date| date.to_offset(UtcOffset::UTC))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn format_date(date: OffsetDateTime) -> String {
    let date = date.to_offset(UtcOffset::UTC);

    // four-digit years always fit the format.
    date.format(DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}
