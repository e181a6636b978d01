//! Service identity helpers — name validation and location parsing.
//!
//! A service name is the routing key for everything in the fabric, so it is
//! validated once at the edge and trusted everywhere else. Locations are
//! concrete `scheme://host:port` strings; homes are `scheme://host` without
//! the port, the key for port allocation.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::YamfError;

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_$-]+$").expect("valid service-name pattern"));

/// Validate a service name: non-empty, `[A-Za-z0-9_$-]` only.
///
/// There is no generated-name path — every service must be named explicitly.
pub fn validate_service_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(YamfError::Validation(
            "service name must not be empty".to_string(),
        ));
    }
    if !SERVICE_NAME.is_match(name) {
        return Err(YamfError::Validation(format!(
            "invalid service name '{name}': only letters, digits, '_', '$', and '-' are allowed"
        )));
    }
    Ok(())
}

/// Split a location into its home (`scheme://host`) and port.
///
/// IPv6 hosts keep their brackets in the home part:
/// `http://[::1]:8080` → (`http://[::1]`, 8080).
pub fn split_location(location: &str) -> crate::Result<(String, u16)> {
    let (scheme, rest) = location.split_once("://").ok_or_else(|| {
        YamfError::Validation(format!("invalid location '{location}': missing scheme"))
    })?;
    if scheme != "http" && scheme != "https" {
        return Err(YamfError::Validation(format!(
            "invalid location '{location}': unsupported scheme '{scheme}'"
        )));
    }
    let rest = rest.trim_end_matches('/');
    let (host, port) = if let Some(bracket_end) = rest.find(']') {
        // Bracketed IPv6 host
        if !rest.starts_with('[') {
            return Err(YamfError::Validation(format!(
                "invalid location '{location}': malformed IPv6 host"
            )));
        }
        let host = &rest[..=bracket_end];
        let port = rest[bracket_end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| YamfError::Validation(format!("invalid location '{location}': missing port")))?;
        (host, port)
    } else {
        rest.rsplit_once(':').ok_or_else(|| {
            YamfError::Validation(format!("invalid location '{location}': missing port"))
        })?
    };
    if host.is_empty() {
        return Err(YamfError::Validation(format!(
            "invalid location '{location}': empty host"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        YamfError::Validation(format!("invalid location '{location}': bad port '{port}'"))
    })?;
    Ok((format!("{scheme}://{host}"), port))
}

/// The home (`scheme://host`, no port, no trailing slash) of any base URL.
///
/// Accepts URLs both with and without a port; the port is discarded.
pub fn home_of(url: &str) -> crate::Result<String> {
    if let Ok((home, _port)) = split_location(url) {
        return Ok(home);
    }
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        YamfError::Validation(format!("invalid URL '{url}': missing scheme"))
    })?;
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(YamfError::Validation(format!("invalid URL '{url}': empty host")));
    }
    Ok(format!("{scheme}://{host}"))
}
