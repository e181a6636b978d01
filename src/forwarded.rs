//! RFC 7239 `Forwarded` header handling for proxy hops.
//!
//! Each hop appends one element carrying `for`, `by`, `host`, and `proto`
//! without disturbing elements added by earlier hops. Values that are not
//! plain tokens (IPv6 bracketed hosts, anything with a colon) are emitted
//! as quoted strings, and quoted strings are unescaped on parse.

use axum::http::{HeaderMap, HeaderValue};

pub const FORWARDED: &str = "forwarded";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// One parsed element of a `Forwarded` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardedElement {
    pub by: Option<String>,
    pub r#for: Option<String>,
    pub host: Option<String>,
    pub proto: Option<String>,
}

impl ForwardedElement {
    /// Serialize in the fixed `for=...;by=...;host=...;proto=...` order.
    pub fn to_header_value(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if let Some(v) = &self.r#for {
            parts.push(format!("for={}", quote_if_needed(v)));
        }
        if let Some(v) = &self.by {
            parts.push(format!("by={}", quote_if_needed(v)));
        }
        if let Some(v) = &self.host {
            parts.push(format!("host={}", quote_if_needed(v)));
        }
        if let Some(v) = &self.proto {
            parts.push(format!("proto={}", quote_if_needed(v)));
        }
        parts.join(";")
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn quote_if_needed(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_token_char) {
        value.to_string()
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    }
}

/// Parse a `Forwarded` header value into its element list.
///
/// Commas inside quoted strings do not split elements; unknown parameter
/// names are ignored. Malformed fragments are skipped rather than failing
/// the whole header — a proxy must tolerate what earlier hops produced.
pub fn parse(value: &str) -> Vec<ForwardedElement> {
    split_unquoted(value, ',')
        .into_iter()
        .map(|element| {
            let mut parsed = ForwardedElement::default();
            for pair in split_unquoted(&element, ';') {
                let Some((key, raw)) = pair.split_once('=') else {
                    continue;
                };
                let key = key.trim().to_ascii_lowercase();
                let value = unquote(raw.trim());
                match key.as_str() {
                    "by" => parsed.by = Some(value),
                    "for" => parsed.r#for = Some(value),
                    "host" => parsed.host = Some(value),
                    "proto" => parsed.proto = Some(value),
                    _ => {}
                }
            }
            parsed
        })
        .collect()
}

fn split_unquoted(value: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            c if c == separator && !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Append this hop to the forwarded chain in `headers`.
///
/// `sender` is the peer the request arrived from, `by` is this hop's own
/// location. The original `Host` and scheme are preserved from the incoming
/// request's values. `X-Forwarded-For` is appended; `X-Forwarded-Host` and
/// `X-Forwarded-Proto` are only set when absent, keeping the first hop's
/// view authoritative.
pub fn append_hop(headers: &mut HeaderMap, sender: &str, by: &str, host: Option<&str>, proto: &str) {
    let element = ForwardedElement {
        r#for: Some(sender.to_string()),
        by: Some(by.to_string()),
        host: host.map(str::to_string),
        proto: Some(proto.to_string()),
    };
    let appended = match headers.get(FORWARDED).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => {
            format!("{existing}, {}", element.to_header_value())
        }
        _ => element.to_header_value(),
    };
    if let Ok(value) = HeaderValue::from_str(&appended) {
        headers.insert(FORWARDED, value);
    }

    let xff = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {sender}"),
        _ => sender.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = host {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(X_FORWARDED_HOST, value);
            }
        }
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        if let Ok(value) = HeaderValue::from_str(proto) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }
}
