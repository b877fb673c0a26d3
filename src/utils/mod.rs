//! Small helpers shared across layers

pub mod datetime;
pub mod encoding;

pub use datetime::DateTimeParser;
pub use encoding::{decode_identity, encode_identity};

use chrono::{DateTime, Utc};

/// Parse a stored timestamp column, logging and falling back to the epoch
/// when the value is unreadable.
pub fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTimeParser::parse_flexible(value).unwrap_or_else(|e| {
        tracing::warn!("{}", e);
        DateTime::<Utc>::default()
    })
}

/// Join a base URL and port the way proxy registrations are stored
/// (`http://host` + `8089` -> `http://host:8089`).
pub fn join_url_port(url: &str, port: u16) -> String {
    format!("{}:{}", url.trim_end_matches('/'), port)
}
