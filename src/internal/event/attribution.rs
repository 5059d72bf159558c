//! Attribution records: who did something and when.
//!
//! An attribution is the `Name <email> seconds offset` triple carried on
//! author, committer and tagger lines. The zone offset from the input is
//! preserved for round-trip emission; equality and ordering compare the
//! instant, so `+0000` and `-0000` renditions of the same moment agree.

use std::fmt::Display;

use bstr::ByteSlice;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SurgeonError;

/// A name, email and zoned timestamp, as carried on attribution lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub name: String,
    pub email: String,
    pub date: DateTime<FixedOffset>,
}

impl Display for Attribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.date.timestamp(),
            self.date.format("%z")
        )
    }
}

impl Attribution {
    /// Build an attribution from parts. The offset is in seconds east
    /// of UTC.
    pub fn new(name: &str, email: &str, seconds: i64, offset_secs: i32) -> Option<Attribution> {
        let tz = FixedOffset::east_opt(offset_secs)?;
        let date = tz.timestamp_opt(seconds, 0).single()?;
        Some(Attribution {
            name: name.to_string(),
            email: email.to_string(),
            date,
        })
    }

    /// Parse the body of an attribution line:
    /// `Name <email> <unix-seconds> <±HHMM>`.
    pub fn from_data(data: &[u8]) -> Result<Attribution, SurgeonError> {
        let bad = || {
            SurgeonError::InvalidValue(
                String::from_utf8_lossy(data).into_owned(),
                "attribution line",
            )
        };
        let lt = data.find_byte(b'<').ok_or_else(bad)?;
        let gt = data.find_byte(b'>').ok_or_else(bad)?;
        if gt < lt {
            return Err(bad());
        }
        let name = data[..lt].trim().to_str().map_err(|_| bad())?.to_string();
        let email = data[lt + 1..gt].to_str().map_err(|_| bad())?.to_string();
        let rest = data[gt + 1..].trim();
        let mut fields = rest.split_str(b" ").filter(|f| !f.is_empty());
        let seconds: i64 = fields
            .next()
            .and_then(|f| f.to_str().ok())
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad)?;
        let offset = fields
            .next()
            .and_then(parse_zone_offset)
            .ok_or_else(bad)?;
        Attribution::new(&name, &email, seconds, offset).ok_or_else(bad)
    }

    /// Serialize back to the attribution line body, preserving the
    /// original zone offset.
    pub fn to_data(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// The instant of this attribution as a Unix timestamp.
    pub fn timestamp(&self) -> i64 {
        self.date.timestamp()
    }

    /// Action stamp: UTC RFC3339 date joined to the email with `!`.
    /// Stable across repositories, so it can identify the same commit
    /// after marks have been renumbered.
    pub fn action_stamp(&self) -> String {
        format!(
            "{}!{}",
            self.date
                .with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%SZ"),
            self.email
        )
    }
}

/// Parse a `±HHMM` zone token into seconds east of UTC.
fn parse_zone_offset(token: &[u8]) -> Option<i32> {
    if token.len() != 5 {
        return None;
    }
    let sign = match token[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = token[1..].to_str().ok()?;
    let hh: i32 = digits[..2].parse().ok()?;
    let mm: i32 = digits[2..].parse().ok()?;
    if hh > 23 || mm > 59 {
        return None;
    }
    Some(sign * (hh * 3600 + mm * 60))
}
