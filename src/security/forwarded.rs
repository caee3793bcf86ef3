//! `Forwarded` (RFC 7239) and `X-Forwarded-*` parsing.
//!
//! # Responsibilities
//! - Read exactly one header family: `Forwarded` when present, the
//!   `X-Forwarded-*` set otherwise
//! - Produce a complete [`ForwardedChain`] or an error, never a partial chain
//!
//! # Design Decisions
//! - Every malformed element fails the whole parse
//! - Only the nearest hop's port is kept (first `for` entry)
//! - An invalid `X-Forwarded-Proto` is dropped instead of failing the parse

use http::header::FORWARDED;
use http::HeaderMap;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_BY: &str = "x-forwarded-by";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Forwarding data reported by the proxies in front of the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedChain {
    for_list: Vec<String>,
    by_list: Vec<String>,
    host: Option<String>,
    proto: Option<String>,
    port: Option<String>,
}

impl ForwardedChain {
    /// Client first, then each proxy in the order they appended themselves.
    pub fn for_list(&self) -> &[String] {
        &self.for_list
    }

    pub fn by_list(&self) -> &[String] {
        &self.by_list
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn proto(&self) -> Option<&str> {
        self.proto.as_deref()
    }

    /// Port of the original client, as reported.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Originating client address, the first `for` entry.
    pub fn client(&self) -> Option<&str> {
        self.for_list.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardedError {
    #[error("header value is not visible ASCII")]
    NotText,

    #[error("unrecognized forwarded parameter `{0}`")]
    UnknownParameter(String),

    #[error("forwarded element `{0}` has no value")]
    MissingValue(String),

    #[error("malformed node address `{0}`")]
    MalformedAddress(String),

    #[error("invalid proto `{0}`")]
    InvalidProto(String),

    #[error("malformed host `{0}`")]
    MalformedHost(String),

    #[error("unterminated quoted string in `{0}`")]
    UnterminatedQuote(String),
}

/// Parses the forwarding headers of a request.
///
/// Returns `Ok(None)` when the request carries none of them.
pub fn parse(headers: &HeaderMap) -> Result<Option<ForwardedChain>, ForwardedError> {
    if headers.contains_key(FORWARDED) {
        return parse_forwarded(headers).map(Some);
    }
    let present = [
        X_FORWARDED_FOR,
        X_FORWARDED_BY,
        X_FORWARDED_PROTO,
        X_FORWARDED_HOST,
        X_FORWARDED_PORT,
    ]
    .iter()
    .any(|name| headers.contains_key(*name));
    if !present {
        return Ok(None);
    }
    parse_x_forwarded(headers).map(Some)
}

fn parse_forwarded(headers: &HeaderMap) -> Result<ForwardedChain, ForwardedError> {
    let mut chain = ForwardedChain::default();
    for value in headers.get_all(FORWARDED) {
        let value = value.to_str().map_err(|_| ForwardedError::NotText)?;
        for element in elements(value)? {
            let element = element.as_str();
            let (name, raw) = element
                .split_once('=')
                .ok_or_else(|| ForwardedError::MissingValue(element.to_string()))?;
            match name.to_ascii_lowercase().as_str() {
                "for" => {
                    let first = chain.for_list.is_empty();
                    let (addr, port) = split_node(raw)?;
                    if first {
                        chain.port = port;
                    }
                    chain.for_list.push(addr);
                }
                "by" => chain.by_list.push(split_node(raw)?.0),
                "proto" => {
                    let proto = unquote(raw);
                    if !is_valid_proto(proto) {
                        return Err(ForwardedError::InvalidProto(proto.to_string()));
                    }
                    chain.proto = Some(proto.to_string());
                }
                "host" => chain.host = Some(checked_host(unquote(raw))?),
                _ => return Err(ForwardedError::UnknownParameter(name.to_string())),
            }
        }
    }
    Ok(chain)
}

fn parse_x_forwarded(headers: &HeaderMap) -> Result<ForwardedChain, ForwardedError> {
    let mut chain = ForwardedChain::default();

    for entry in list_entries(headers, X_FORWARDED_FOR)? {
        let first = chain.for_list.is_empty();
        let (addr, port) = split_node(&entry)?;
        if first {
            chain.port = port;
        }
        chain.for_list.push(addr);
    }
    for entry in list_entries(headers, X_FORWARDED_BY)? {
        chain.by_list.push(split_node(&entry)?.0);
    }

    if let Some(proto) = last_value(headers, X_FORWARDED_PROTO)? {
        if is_valid_proto(&proto) {
            chain.proto = Some(proto);
        } else {
            tracing::debug!(proto = %proto, "Dropping invalid X-Forwarded-Proto");
        }
    }
    if let Some(host) = last_value(headers, X_FORWARDED_HOST)? {
        chain.host = Some(checked_host(&host)?);
    }
    if let Some(port) = last_value(headers, X_FORWARDED_PORT)? {
        chain.port = Some(port);
    }
    Ok(chain)
}

/// Splits a `Forwarded` value into `name=value` elements on `;` and `,`.
/// Whitespace is dropped outside quoted strings; quoted strings keep their
/// quotes and lose their escapes.
fn elements(value: &str) -> Result<Vec<String>, ForwardedError> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '\\' if quoted => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => break,
            },
            ';' | ',' if !quoted => {
                if !current.is_empty() {
                    elements.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !quoted => {}
            c => current.push(c),
        }
    }
    if quoted {
        return Err(ForwardedError::UnterminatedQuote(value.to_string()));
    }
    if !current.is_empty() {
        elements.push(current);
    }
    Ok(elements)
}

/// Comma separated entries over every instance of `name`, in order.
fn list_entries(headers: &HeaderMap, name: &str) -> Result<Vec<String>, ForwardedError> {
    let mut entries = Vec::new();
    for value in headers.get_all(name) {
        let value = value.to_str().map_err(|_| ForwardedError::NotText)?;
        entries.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        );
    }
    Ok(entries)
}

fn last_value(headers: &HeaderMap, name: &str) -> Result<Option<String>, ForwardedError> {
    match headers.get_all(name).iter().last() {
        Some(value) => {
            let value = value.to_str().map_err(|_| ForwardedError::NotText)?.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        None => Ok(None),
    }
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"')
}

/// Splits a node into address and optional port.
fn split_node(raw: &str) -> Result<(String, Option<String>), ForwardedError> {
    let node = unquote(raw);
    let malformed = || ForwardedError::MalformedAddress(node.to_string());

    if let Some(rest) = node.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']').ok_or_else(malformed)?;
        if addr.is_empty() || addr.contains('[') {
            return Err(malformed());
        }
        let port = match tail {
            "" => None,
            tail => Some(tail.strip_prefix(':').ok_or_else(malformed)?.to_string()),
        };
        return Ok((addr.to_string(), port));
    }
    if node.contains('[') || node.contains(']') {
        return Err(malformed());
    }

    // A bare address with more than one colon is an unbracketed IPv6 address.
    match node.split_once(':') {
        Some((addr, port)) if !port.contains(':') => Ok((addr.to_string(), Some(port.to_string()))),
        _ => Ok((node.to_string(), None)),
    }
}

/// `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`
fn is_valid_proto(proto: &str) -> bool {
    let mut chars = proto.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn checked_host(host: &str) -> Result<String, ForwardedError> {
    if let Some(open) = host.find('[') {
        if open != 0 || !host.contains(']') {
            return Err(ForwardedError::MalformedHost(host.to_string()));
        }
    }
    Ok(host.to_string())
}
