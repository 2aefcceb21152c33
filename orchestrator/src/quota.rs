//! Recognizes "limit reached" conditions in agent replies and normalizes the
//! advertised reset time to an absolute UTC timestamp.
//!
//! Clock times without a zone are read as UTC.

use chrono::DateTime;
use chrono::Duration;
use chrono::NaiveTime;
use chrono::TimeZone;
use chrono::Utc;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::QuotaSnapshot;

/// Longest hold applied when a reply names no usable reset time.
pub const MAX_RESET_HOURS: i64 = 24 * 366;

const LIMIT_PATTERNS: &[&str] = &[
    r"(?i)quota\s+(?:exceeded|exhausted|reached)",
    r"(?i)exceeded\s+(?:your|the)\s+(?:current\s+)?quota",
    r"(?i)insufficient_quota|resource_exhausted",
    r"(?i)rate[\s_-]?limit(?:ed)?",
    r"(?i)usage\s+limit",
    r"(?i)limit\s+(?:reached|exceeded)",
    r"(?i)too\s+many\s+requests",
    r"\b429\b",
    r"(?i)out\s+of\s+(?:credits|tokens)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetSource {
    RetryAfter,
    Timestamp,
    Epoch,
    Relative,
    ClockTime,
    /// Structured quota fields from the reply.
    Reported,
    /// Nothing usable was found, or the time was already past.
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSignal {
    /// Phrase that identified the condition.
    pub matched: String,
    pub reset_at: DateTime<Utc>,
    pub source: ResetSource,
}

pub struct QuotaDetector {
    limit_patterns: Vec<Regex>,
    retry_after: Option<Regex>,
    timestamp: Option<Regex>,
    epoch: Option<Regex>,
    relative: Option<Regex>,
    relative_part: Option<Regex>,
    clock: Option<Regex>,
    default_hold: Duration,
}

impl Default for QuotaDetector {
    fn default() -> Self {
        Self::new(24)
    }
}

impl QuotaDetector {
    pub fn new(default_reset_hours: i64) -> Self {
        Self {
            limit_patterns: LIMIT_PATTERNS.iter().copied().filter_map(compile).collect(),
            retry_after: compile(r"(?i)retry[\s_-]after[\s:=]*(\d+)"),
            timestamp: compile(
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:\d{2})",
            ),
            epoch: compile(r"(?i)(?:reset|until|at)\D{0,20}?\b(\d{10})\b"),
            relative: compile(
                r"(?i)\b(?:in|after)\s+(\d+\s*[a-z]+(?:[\s,]*(?:and\s+)?\d+\s*[a-z]+)*)",
            ),
            relative_part: compile(
                r"(?i)(\d+)\s*(days?|d|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)",
            ),
            clock: compile(
                r"(?i)\bresets?\b\D{0,12}?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*(?:utc\b)?",
            ),
            default_hold: Duration::hours(default_reset_hours.clamp(1, MAX_RESET_HOURS)),
        }
    }

    /// `None` unless `text` reports a limit condition.
    pub fn detect(&self, text: &str, now: DateTime<Utc>) -> Option<QuotaSignal> {
        let matched = self
            .limit_patterns
            .iter()
            .find_map(|pattern| pattern.find(text))?
            .as_str()
            .to_string();
        let (reset_at, source) = self.parse_reset(text, now);
        Some(QuotaSignal {
            matched,
            reset_at,
            source,
        })
    }

    /// Reads structured quota fields; `None` while quota remains.
    pub fn from_snapshot(&self, snapshot: &QuotaSnapshot, now: DateTime<Utc>) -> Option<QuotaSignal> {
        if !snapshot.is_exhausted() {
            return None;
        }
        let (reset_at, source) = match snapshot.reset_at {
            Some(at) if at > now => (at, ResetSource::Reported),
            _ => self.default_reset(now),
        };
        Some(QuotaSignal {
            matched: format!("{}/{} units used", snapshot.used, snapshot.limit),
            reset_at,
            source,
        })
    }

    /// First recognizable reset time in `text`. Past absolute times and text
    /// without a reset time fall back to the default hold.
    pub fn parse_reset(&self, text: &str, now: DateTime<Utc>) -> (DateTime<Utc>, ResetSource) {
        let fallback = self.default_reset(now);

        if let Some(secs) = capture(self.retry_after.as_ref(), text, 1) {
            return secs
                .parse::<i64>()
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|delta| now.checked_add_signed(delta))
                .map_or(fallback, |at| (at, ResetSource::RetryAfter));
        }

        if let Some(found) = self.timestamp.as_ref().and_then(|re| re.find(text))
            && let Some(at) = parse_timestamp(found.as_str())
        {
            return if at > now {
                (at, ResetSource::Timestamp)
            } else {
                fallback
            };
        }

        if let Some(at) = capture(self.epoch.as_ref(), text, 1)
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            return if at > now {
                (at, ResetSource::Epoch)
            } else {
                fallback
            };
        }

        if let Some(span) = capture(self.relative.as_ref(), text, 1) {
            match self.relative_duration(span) {
                Some(Ok(delta)) => {
                    return now
                        .checked_add_signed(delta)
                        .map_or(fallback, |at| (at, ResetSource::Relative));
                }
                Some(Err(Overflow)) => return fallback,
                None => {}
            }
        }

        if let Some(at) = self.clock_time(text, now) {
            return (at, ResetSource::ClockTime);
        }

        fallback
    }

    /// Sum of the duration parts in `span`; `None` when it names none.
    fn relative_duration(&self, span: &str) -> Option<Result<Duration, Overflow>> {
        let part = self.relative_part.as_ref()?;
        let mut total = Duration::zero();
        for caps in part.captures_iter(span) {
            let Some(amount) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            let Ok(amount) = amount.parse::<i64>() else {
                return Some(Err(Overflow));
            };
            let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
            let delta = match unit.chars().next() {
                Some('d') => Duration::try_days(amount),
                Some('h') => Duration::try_hours(amount),
                Some('m') => Duration::try_minutes(amount),
                Some('s') => Duration::try_seconds(amount),
                _ => continue,
            };
            let Some(sum) = delta.and_then(|delta| total.checked_add(&delta)) else {
                return Some(Err(Overflow));
            };
            total = sum;
        }
        (total > Duration::zero()).then_some(Ok(total))
    }

    fn default_reset(&self, now: DateTime<Utc>) -> (DateTime<Utc>, ResetSource) {
        (
            now.checked_add_signed(self.default_hold).unwrap_or(now),
            ResetSource::Default,
        )
    }

    /// Clock times at or before `now` mean the same time tomorrow.
    fn clock_time(&self, text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let caps = self.clock.as_ref()?.captures(text)?;
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute = caps.get(2).map(|m| m.as_str().parse::<u32>());
        let meridiem = caps.get(3).map(|m| m.as_str().to_ascii_lowercase());

        // A bare number ("reset 5") is too ambiguous to act on.
        if minute.is_none() && meridiem.is_none() {
            return None;
        }
        let minute = match minute {
            Some(parsed) => parsed.ok()?,
            None => 0,
        };
        let hour = match meridiem.as_deref() {
            Some(half) if !(1..=12).contains(&hour) => {
                tracing::debug!(hour, half, "clock hour out of range");
                return None;
            }
            Some("am") => hour % 12,
            Some(_) => hour % 12 + 12,
            None => hour,
        };

        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let today = now.date_naive().and_time(time).and_utc();
        Some(if today <= now {
            today + Duration::days(1)
        } else {
            today
        })
    }
}

/// A reset time too far out to represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Overflow;

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            tracing::error!(pattern, error = %err, "invalid quota pattern");
            None
        }
    }
}

fn capture<'t>(regex: Option<&Regex>, text: &'t str, group: usize) -> Option<&'t str> {
    regex?.captures(text)?.get(group).map(|m| m.as_str())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.replacen(' ', "T", 1);
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
