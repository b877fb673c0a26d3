//! Datetime parsing and formatting shared by the database layer
//!
//! Timestamps are stored as RFC3339 text with millisecond precision so that
//! lexical ordering in SQL matches chronological ordering.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Errors that can occur during datetime operations
#[derive(Error, Debug)]
pub enum DateTimeError {
    #[error("Invalid datetime format: '{input}' - expected RFC3339 (2023-01-01T12:00:00Z) or SQLite (2023-01-01 12:00:00)")]
    InvalidFormat { input: String },
}

pub struct DateTimeParser;

impl DateTimeParser {
    /// Parse datetime from the formats that can end up in the database:
    /// RFC3339 written by this application and SQLite's `CURRENT_TIMESTAMP`.
    pub fn parse_flexible(datetime_str: &str) -> Result<DateTime<Utc>, DateTimeError> {
        let trimmed = datetime_str.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(dt.with_timezone(&Utc));
        }

        let naive_formats = [
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%dT%H:%M:%S%.f",
        ];

        for format in &naive_formats {
            if let Ok(naive_dt) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(DateTime::from_naive_utc_and_offset(naive_dt, Utc));
            }
        }

        Err(DateTimeError::InvalidFormat {
            input: datetime_str.to_string(),
        })
    }

    /// Format datetime for storage
    pub fn format_for_storage(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
