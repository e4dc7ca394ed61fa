//! Posting-date normalization.
//!
//! Career pages print dates as relative text ("3d", "30+ days ago", "2 months") or in one of many
//! calendar layouts. Everything resolves to a UTC timestamp; text no rule accepts is an error the caller
//! logs while keeping the listing.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("unparseable date `{0}`")]
    Unparseable(String),
}

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Date(&'static str),
    DateTime(&'static str),
    Zoned(&'static str),
    Rfc3339,
}

// Several layouts are ambiguous (YYYY-MM-DD vs YYYY-DD-MM); the first one that parses the whole string wins.
const ABSOLUTE_PATTERNS: &[Pattern] = &[
    Pattern::Date("%Y-%m-%d"),
    Pattern::Date("%Y-%d-%m"),
    Pattern::Date("%d-%m-%Y"),
    Pattern::Date("%m-%d-%Y"),
    Pattern::DateTime("%Y-%m-%dT%H:%M:%S"),
    Pattern::Zoned("%Y-%m-%dT%H:%M:%S%z"),
    Pattern::Rfc3339,
    Pattern::Date("%b %d, %Y"),
    Pattern::Date("%d %b %Y"),
    Pattern::Date("%b %d %Y"),
    Pattern::Date("%Y/%m/%d"),
    Pattern::Date("%Y/%d/%m"),
    Pattern::Date("%m/%d/%Y"),
    Pattern::Date("%d/%m/%Y"),
    Pattern::Date("%Y.%m.%d"),
    Pattern::Date("%Y.%d.%m"),
    Pattern::Date("%d.%m.%Y"),
    Pattern::Date("%m.%d.%Y"),
    Pattern::Date("%Y %b %d"),
    Pattern::Date("%Y %b. %d"),
    Pattern::Date("%Y %B %d"),
    Pattern::Date("%Y-%b-%d"),
    Pattern::Date("%Y-%B-%d"),
    Pattern::Date("%d %b. %Y"),
    Pattern::Date("%d %B %Y"),
    Pattern::Date("%d-%b-%Y"),
    Pattern::Date("%d-%B-%Y"),
    Pattern::Date("%d/%b/%Y"),
    Pattern::Date("%d/%B/%Y"),
];

fn day_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\+?\s*(?:d|days?)\b").expect("valid day regex"))
}

fn month_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\+?\s*(?:m|mo|mos|months?)\b").expect("valid month regex"))
}

fn digit_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digit regex"))
}

/// Normalize `text` relative to the current time.
pub fn normalize_date(text: &str) -> Result<DateTime<Utc>, DateError> {
    normalize_date_at(text, Utc::now())
}

/// Normalize `text`, resolving relative forms against `now`.
pub fn normalize_date_at(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DateError> {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let unparseable = || DateError::Unparseable(trimmed.to_string());

    if lower == "today" {
        return Ok(now);
    }

    if day_token().is_match(&lower) {
        let days = first_digit_run(&lower).ok_or_else(unparseable)?;
        return Duration::try_days(days)
            .and_then(|delta| now.checked_sub_signed(delta))
            .ok_or_else(unparseable);
    }

    if month_token().is_match(&lower) {
        let months = first_digit_run(&lower)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(unparseable)?;
        return subtract_months(now, months).ok_or_else(unparseable);
    }

    parse_absolute(trimmed).ok_or_else(unparseable)
}

/// Step back `months` calendar months, clamping the day to the last valid day of the target month.
pub fn subtract_months(ts: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    ts.checked_sub_months(Months::new(months))
}

fn first_digit_run(text: &str) -> Option<i64> {
    digit_run().find(text)?.as_str().parse().ok()
}

fn parse_absolute(text: &str) -> Option<DateTime<Utc>> {
    ABSOLUTE_PATTERNS.iter().find_map(|pattern| match *pattern {
        Pattern::Date(fmt) => NaiveDate::parse_from_str(text, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc()),
        Pattern::DateTime(fmt) => NaiveDateTime::parse_from_str(text, fmt)
            .ok()
            .map(|naive| naive.and_utc()),
        Pattern::Zoned(fmt) => DateTime::parse_from_str(text, fmt)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Pattern::Rfc3339 => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn midnight(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn today_is_case_insensitive() {
        let now = at(2024, 5, 10);
        assert_eq!(normalize_date_at("Today", now).unwrap(), now);
        assert_eq!(normalize_date_at("  TODAY ", now).unwrap(), now);
    }

    #[test]
    fn relative_days_use_first_digit_run() {
        let now = at(2024, 5, 10);
        assert_eq!(normalize_date_at("3d", now).unwrap(), at(2024, 5, 7));
        assert_eq!(normalize_date_at("Posted 30+ days ago", now).unwrap(), at(2024, 4, 10));
        assert_eq!(normalize_date_at("1 day ago", now).unwrap(), at(2024, 5, 9));
    }

    #[test]
    fn relative_days_track_wall_clock() {
        let expected = Utc::now() - Duration::days(3);
        let got = normalize_date("3d").unwrap();
        assert!((got - expected).num_seconds().abs() < 5);
    }

    #[test]
    fn relative_months_clamp_day_of_month() {
        let now = at(2024, 3, 31);
        assert_eq!(normalize_date_at("1 month ago", now).unwrap(), at(2024, 2, 29));
        assert_eq!(normalize_date_at("2 months", now).unwrap(), at(2024, 1, 31));
        assert_eq!(normalize_date_at("2mo", at(2023, 4, 30)).unwrap(), at(2023, 2, 28));
    }

    #[test]
    fn month_subtraction_crosses_year_boundary() {
        let got = subtract_months(at(2024, 1, 31), 1).unwrap();
        assert_eq!((got.year(), got.month(), got.day()), (2023, 12, 31));
        let got = subtract_months(at(2023, 3, 31), 1).unwrap();
        assert_eq!((got.month(), got.day()), (2, 28));
    }

    #[test]
    fn month_names_are_not_unit_tokens() {
        let now = at(2024, 5, 10);
        assert_eq!(normalize_date_at("15 Dec 2023", now).unwrap(), midnight(2023, 12, 15));
        assert_eq!(normalize_date_at("12 May 2023", now).unwrap(), midnight(2023, 5, 12));
    }

    #[test]
    fn absolute_formats_first_match_wins() {
        let now = at(2024, 5, 10);
        // Both YYYY-MM-DD and YYYY-DD-MM accept this; the earlier pattern decides.
        assert_eq!(normalize_date_at("2023-03-04", now).unwrap(), midnight(2023, 3, 4));
        assert_eq!(normalize_date_at("2023-15-04", now).unwrap(), midnight(2023, 4, 15));
        assert_eq!(normalize_date_at("06/15/2023", now).unwrap(), midnight(2023, 6, 15));
        assert_eq!(normalize_date_at("15.06.2023", now).unwrap(), midnight(2023, 6, 15));
    }

    #[test]
    fn named_month_variants_parse() {
        let now = at(2024, 5, 10);
        let expected = midnight(2023, 6, 15);
        for text in [
            "Jun 15, 2023",
            "June 15, 2023",
            "Jun 15 2023",
            "2023 Jun. 15",
            "2023 June 15",
            "2023-Jun-15",
            "15 June 2023",
            "15-Jun-2023",
            "15/June/2023",
        ] {
            assert_eq!(normalize_date_at(text, now).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn iso_timestamps_resolve_to_utc() {
        let now = at(2024, 5, 10);
        let expected = Utc.with_ymd_and_hms(2023, 6, 15, 8, 30, 0).single().unwrap();
        assert_eq!(normalize_date_at("2023-06-15T08:30:00", now).unwrap(), expected);
        assert_eq!(normalize_date_at("2023-06-15T10:30:00+0200", now).unwrap(), expected);
        assert_eq!(normalize_date_at("2023-06-15T08:30:00Z", now).unwrap(), expected);
    }

    #[test]
    fn unknown_text_is_an_error() {
        let now = at(2024, 5, 10);
        assert_eq!(
            normalize_date_at("recently", now),
            Err(DateError::Unparseable("recently".into()))
        );
        assert!(normalize_date_at("99999999999999999999d", now).is_err());
        assert!(normalize_date_at("", now).is_err());
    }
}
