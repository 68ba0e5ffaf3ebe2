//! Fake-time annotation grammar
//!
//! A value is one of:
//! - an absolute UTC timestamp, `2024-01-02 03:04:05[.fffffffff]`
//! - a signed offset built from `<sign><integer><unit>` tokens, unit one of
//!   `y d h m s` (a year is 365 days); later tokens may drop the sign and
//!   inherit the previous one, so `+1d2h` is 93600 seconds
//! - a bare signed number of seconds, `+30` or `-1.5`
//!
//! Offsets must start with an explicit `+` or `-`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

/// Layout of absolute timestamps, fraction optional
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;
const SECONDS_PER_YEAR: i64 = 365 * SECONDS_PER_DAY;

/// Largest bare number of seconds accepted, well inside `TimeDelta` range
const MAX_BARE_SECONDS: f64 = 1.0e15;

/// Errors from parsing or applying a fake-time value
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FakeTimeError {
    /// Annotation present but blank
    #[error("fake time is empty")]
    Empty,

    /// Value looked like a timestamp but did not parse
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp {
        /// Offending value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Offset without a leading `+` or `-`
    #[error("offset '{0}' must start with '+' or '-'")]
    MissingSign(String),

    /// Offset with a malformed token
    #[error("invalid offset '{value}': {reason}")]
    InvalidOffset {
        /// Offending value
        value: String,
        /// What was wrong with it
        reason: String,
    },

    /// Process mode was asked to move the clock forward
    #[error("setting a future time is not supported in process mode (delay {0})")]
    FutureNotSupported(String),
}

impl FakeTimeError {
    fn offset(value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOffset {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed fake-time value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeTimeSpec {
    /// Absolute UTC wall-clock time
    Absolute(NaiveDateTime),
    /// Signed shift relative to the real clock
    Offset(TimeDelta),
}

/// Delay handed to the clock-adjusting sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDelay {
    /// Whole seconds
    pub seconds: i64,
    /// Nanosecond remainder
    pub nanoseconds: u32,
}

impl FakeTimeSpec {
    /// Parse an annotation value
    pub fn parse(value: &str) -> Result<Self, FakeTimeError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(FakeTimeError::Empty);
        }

        if value.contains(':') {
            return NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
                .map(Self::Absolute)
                .map_err(|e| FakeTimeError::InvalidTimestamp {
                    value: value.to_string(),
                    reason: e.to_string(),
                });
        }

        parse_offset(value).map(Self::Offset)
    }

    /// Value of the `FAKETIME` variable read by libfaketime
    pub fn libfaketime_value(&self) -> String {
        match self {
            Self::Absolute(t) => format!("@{}", t.format(TIMESTAMP_FORMAT)),
            Self::Offset(d) => format_signed_seconds(*d),
        }
    }

    /// Move an absolute time forward by `elapsed`; offsets are unchanged
    pub fn advance(self, elapsed: TimeDelta) -> Result<Self, FakeTimeError> {
        match self {
            Self::Absolute(t) => t
                .checked_add_signed(elapsed)
                .map(Self::Absolute)
                .ok_or_else(|| FakeTimeError::InvalidTimestamp {
                    value: t.format(TIMESTAMP_FORMAT).to_string(),
                    reason: "out of range after advancing".to_string(),
                }),
            Self::Offset(_) => Ok(self),
        }
    }

    /// Delay for process mode at wall-clock time `now`
    ///
    /// Offsets are taken as the delay itself; a timestamp is delayed by how
    /// far it lies behind `now`. A negative delay would move the clock
    /// forward, which the sidecar cannot do.
    pub fn process_delay(&self, now: DateTime<Utc>) -> Result<ProcessDelay, FakeTimeError> {
        let delay = match self {
            Self::Absolute(t) => now.naive_utc().signed_duration_since(*t),
            Self::Offset(d) => *d,
        };

        if delay < TimeDelta::zero() {
            return Err(FakeTimeError::FutureNotSupported(format_signed_seconds(
                delay,
            )));
        }

        Ok(ProcessDelay {
            seconds: delay.num_seconds(),
            nanoseconds: delay.subsec_nanos().unsigned_abs(),
        })
    }
}

impl FromStr for FakeTimeSpec {
    type Err = FakeTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FakeTimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(t) => write!(f, "{}", t.format(TIMESTAMP_FORMAT)),
            Self::Offset(d) => write!(f, "{}", format_signed_seconds(*d)),
        }
    }
}

fn parse_offset(value: &str) -> Result<TimeDelta, FakeTimeError> {
    let Some(body) = value.strip_prefix(['+', '-']) else {
        return Err(FakeTimeError::MissingSign(value.to_string()));
    };

    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return parse_bare_seconds(value);
    }

    let mut total: i64 = 0;
    let mut sign: i64 = 1;
    let mut chars = value.chars().peekable();

    while chars.peek().is_some() {
        match chars.peek() {
            Some('+') => {
                sign = 1;
                chars.next();
            }
            Some('-') => {
                sign = -1;
                chars.next();
            }
            _ => {}
        }

        let mut digits = String::new();
        while let Some(&c) = chars.peek().filter(|c| c.is_ascii_digit()) {
            digits.push(c);
            chars.next();
        }
        if digits.is_empty() {
            return Err(FakeTimeError::offset(value, "expected a number"));
        }

        let unit = match chars.next() {
            Some('y') => SECONDS_PER_YEAR,
            Some('d') => SECONDS_PER_DAY,
            Some('h') => SECONDS_PER_HOUR,
            Some('m') => SECONDS_PER_MINUTE,
            Some('s') => 1,
            Some(other) => {
                return Err(FakeTimeError::offset(
                    value,
                    format!("unknown unit '{}'", other),
                ))
            }
            None => {
                return Err(FakeTimeError::offset(
                    value,
                    format!("missing unit after '{}'", digits),
                ))
            }
        };

        let amount: i64 = digits
            .parse()
            .map_err(|_| FakeTimeError::offset(value, "number too large"))?;
        total = amount
            .checked_mul(unit)
            .and_then(|secs| secs.checked_mul(sign))
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| FakeTimeError::offset(value, "offset too large"))?;
    }

    TimeDelta::try_seconds(total).ok_or_else(|| FakeTimeError::offset(value, "offset too large"))
}

fn parse_bare_seconds(value: &str) -> Result<TimeDelta, FakeTimeError> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| FakeTimeError::offset(value, "not a number"))?;
    if !seconds.is_finite() || seconds.abs() > MAX_BARE_SECONDS {
        return Err(FakeTimeError::offset(value, "offset too large"));
    }

    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9).round() as i64;
    TimeDelta::try_seconds(whole)
        .map(|d| d + TimeDelta::nanoseconds(nanos))
        .ok_or_else(|| FakeTimeError::offset(value, "offset too large"))
}

/// Format a delta as signed seconds, `+93600`, `-30`, `+1.5`
fn format_signed_seconds(delta: TimeDelta) -> String {
    let sign = if delta < TimeDelta::zero() { '-' } else { '+' };
    let abs = delta.abs();
    let seconds = abs.num_seconds();
    let nanos = abs.subsec_nanos();
    if nanos == 0 {
        format!("{sign}{seconds}")
    } else {
        let fraction = format!("{:09}", nanos);
        format!("{sign}{seconds}.{}", fraction.trim_end_matches('0'))
    }
}
