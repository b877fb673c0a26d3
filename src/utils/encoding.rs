//! Base64 identities carried in request paths
//!
//! Stream URLs, icon URLs and session identities travel inside URL paths as
//! standard base64 with padding. Decoding is lenient: missing padding and
//! the URL-safe alphabet are both accepted, since players and operators tend
//! to mangle both.

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};

use crate::errors::WebError;

pub fn encode_identity(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

pub fn decode_identity(encoded: &str) -> Result<String, WebError> {
    let trimmed = encoded.trim().trim_start_matches('/');
    let bytes = STANDARD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|_| WebError::InvalidIdentity {
            value: encoded.to_string(),
        })?;

    String::from_utf8(bytes).map_err(|_| WebError::InvalidIdentity {
        value: encoded.to_string(),
    })
}
