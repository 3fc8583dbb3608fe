//! Domain-name normalization and configuration validation.
//!
//! Every runner and the storage layer agree on one canonical host form: the
//! output of [`normalize_domain_name`].

use thiserror::Error;

/// Allowed probe interval, in minutes
pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid domain name: {0:?}")]
    InvalidName(String),
    #[error("Interval must be between {MIN_INTERVAL_MINUTES} and {MAX_INTERVAL_MINUTES} minutes, got {0}")]
    IntervalOutOfRange(u32),
    #[error("Domain already exists: {0}")]
    AlreadyExists(String),
    #[error("Domain not found: {0}")]
    NotFound(String),
}

/// Reduce user input to a bare host name.
///
/// Trim, lowercase, strip a leading `http://` or `https://`, strip a leading
/// `www.`, cut at the first `/`, then cut at the first `:`. The order matters:
/// `"HTTPS://WWW.Example.com:443/path"` becomes `"example.com"`.
pub fn normalize_domain_name(input: &str) -> String {
    let mut host = input.trim().to_lowercase();

    if let Some(rest) = host.strip_prefix("http://") {
        host = rest.to_string();
    }
    if let Some(rest) = host.strip_prefix("https://") {
        host = rest.to_string();
    }
    if let Some(rest) = host.strip_prefix("www.") {
        host = rest.to_string();
    }
    if let Some(index) = host.find('/') {
        host.truncate(index);
    }
    if let Some(index) = host.find(':') {
        host.truncate(index);
    }

    host
}

/// Normalize and check that what is left looks like a host name
pub fn validate_domain_name(input: &str) -> Result<String, DomainError> {
    let host = normalize_domain_name(input);

    let valid = !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && !host.ends_with('.')
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid { Ok(host) } else { Err(DomainError::InvalidName(input.to_string())) }
}

pub fn validate_interval(minutes: u32) -> Result<u32, DomainError> {
    if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(DomainError::IntervalOutOfRange(minutes))
    }
}
