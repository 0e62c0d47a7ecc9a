// src/validate.rs

//! Validation of every identifier that can reach a command line or a
//! generated configuration file
//!
//! Inputs are rejected before any external mutation, so a validation
//! failure never needs rollback.

use crate::{Error, Result};
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Maximum total domain length (RFC 1035)
pub const MAX_DOMAIN_LEN: usize = 253;
/// Maximum email length (RFC 5321 path limit)
pub const MAX_EMAIL_LEN: usize = 254;

// Labels are 1-63 chars, alphanumeric at both ends; the TLD is alphabetic
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,63}$",
    )
    .unwrap()
});

static EMAIL_LOCAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]{1,64}$").unwrap());

static SERVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

static SOCKET_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[a-zA-Z0-9._/-]+\.sock$").unwrap());

static SQL_IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,31}$").unwrap());

/// Validate a domain name and return it lowercased
pub fn domain(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Validation("domain is required".to_string()));
    }
    if input.len() > MAX_DOMAIN_LEN {
        return Err(Error::Validation(format!(
            "domain exceeds {} characters ({})",
            MAX_DOMAIN_LEN,
            input.len()
        )));
    }
    if !DOMAIN_RE.is_match(input) {
        return Err(Error::Validation(format!("invalid domain: {}", input)));
    }
    Ok(input.to_ascii_lowercase())
}

/// Validate an email address; the domain part goes through [`domain`]
pub fn email(input: &str) -> Result<String> {
    let input = input.trim();
    if input.len() > MAX_EMAIL_LEN {
        return Err(Error::Validation(format!(
            "email exceeds {} characters ({})",
            MAX_EMAIL_LEN,
            input.len()
        )));
    }
    let (local, host) = input
        .split_once('@')
        .ok_or_else(|| Error::Validation(format!("invalid email: {}", input)))?;
    if !EMAIL_LOCAL_RE.is_match(local) || local.starts_with('.') || local.ends_with('.') {
        return Err(Error::Validation(format!("invalid email: {}", input)));
    }
    let host = domain(host).map_err(|_| Error::Validation(format!("invalid email: {}", input)))?;
    Ok(format!("{}@{}", local, host))
}

/// Shape check for a service name; membership is checked by the registry
pub fn service_name(input: &str) -> Result<&str> {
    if input.len() > 64 || !SERVICE_NAME_RE.is_match(input) {
        return Err(Error::Validation(format!("invalid service name: {:?}", input)));
    }
    Ok(input)
}

/// A discovered PHP-FPM socket path destined for a generated config file
pub fn socket_path(input: &str) -> Result<&str> {
    if !SOCKET_PATH_RE.is_match(input) || input.split('/').any(|c| c == "..") {
        return Err(Error::Validation(format!("unsafe socket path: {:?}", input)));
    }
    Ok(input)
}

/// Database and user names interpolated into SQL
pub fn sql_identifier(input: &str) -> Result<&str> {
    if !SQL_IDENTIFIER_RE.is_match(input) {
        return Err(Error::Validation(format!("invalid SQL identifier: {:?}", input)));
    }
    Ok(input)
}

/// DNS forwarder addresses
pub fn forwarder(input: &str) -> Result<IpAddr> {
    input
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid forwarder address: {:?}", input)))
}
