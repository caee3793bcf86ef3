//! Configured response header edits and `SameSite` cookie attributes.

use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{HeaderName, HeaderValue, Response};

use crate::config::schema::{HeadersOptions, SameSiteOptions};
use crate::pipeline::{Outbound, PipelineError, Stage, StageContext};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderRuleError {
    #[error("header entry `{0}` is not of the form `Name: value`")]
    Malformed(String),

    #[error("invalid header name `{0}`")]
    InvalidName(String),

    #[error("invalid value for header `{0}`")]
    InvalidValue(String),
}

/// Parsed `headers` option group.
#[derive(Debug, Clone, Default)]
pub struct HeaderRules {
    add: Vec<(HeaderName, HeaderValue)>,
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

fn parse_name(name: &str) -> Result<HeaderName, HeaderRuleError> {
    HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| HeaderRuleError::InvalidName(name.to_string()))
}

fn parse_entry(entry: &str) -> Result<(HeaderName, HeaderValue), HeaderRuleError> {
    let (name, value) = entry
        .split_once(':')
        .ok_or_else(|| HeaderRuleError::Malformed(entry.to_string()))?;
    let name = parse_name(name)?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|_| HeaderRuleError::InvalidValue(name.to_string()))?;
    Ok((name, value))
}

impl TryFrom<&HeadersOptions> for HeaderRules {
    type Error = HeaderRuleError;

    fn try_from(options: &HeadersOptions) -> Result<Self, Self::Error> {
        Ok(Self {
            add: options.add.iter().map(|e| parse_entry(e)).collect::<Result<_, _>>()?,
            set: options.set.iter().map(|e| parse_entry(e)).collect::<Result<_, _>>()?,
            remove: options.remove.iter().map(|n| parse_name(n)).collect::<Result<_, _>>()?,
        })
    }
}

impl HeaderRules {
    pub fn apply(&self, response: &mut Response<Bytes>) {
        let headers = response.headers_mut();
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    fn attribute(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Parsed `samesite` option group.
#[derive(Debug, Clone, Default)]
pub struct SameSiteRules {
    lists: Vec<(SameSite, Vec<String>)>,
}

impl From<&SameSiteOptions> for SameSiteRules {
    fn from(options: &SameSiteOptions) -> Self {
        Self {
            lists: vec![
                (SameSite::Strict, options.strict.clone()),
                (SameSite::Lax, options.lax.clone()),
                (SameSite::None, options.none.clone()),
            ],
        }
    }
}

impl SameSiteRules {
    /// An exact cookie name wins over `*`.
    fn lookup(&self, cookie: &str) -> Option<SameSite> {
        let find = |wanted: &str| {
            self.lists
                .iter()
                .find(|(_, names)| names.iter().any(|n| n == wanted))
                .map(|(s, _)| *s)
        };
        find(cookie).or_else(|| find("*"))
    }

    fn rewrite(&self, cookie: &str) -> Option<String> {
        let name = cookie.split(['=', ';']).next()?.trim();
        let attributes: Vec<String> = cookie
            .split(';')
            .skip(1)
            .map(|a| a.trim().to_ascii_lowercase())
            .collect();
        if attributes.iter().any(|a| a.starts_with("samesite")) {
            return None;
        }
        let same_site = self.lookup(name)?;
        let mut out = format!("{}; SameSite={}", cookie.trim_end(), same_site.attribute());
        if same_site == SameSite::None && !attributes.iter().any(|a| a == "secure") {
            out.push_str("; Secure");
        }
        Some(out)
    }

    pub fn apply(&self, response: &mut Response<Bytes>) {
        let cookies: Vec<HeaderValue> = response.headers().get_all(SET_COOKIE).iter().cloned().collect();
        if cookies.is_empty() {
            return;
        }
        let headers = response.headers_mut();
        headers.remove(SET_COOKIE);
        for cookie in cookies {
            let rewritten = cookie
                .to_str()
                .ok()
                .and_then(|c| self.rewrite(c))
                .and_then(|c| HeaderValue::from_str(&c).ok());
            headers.append(SET_COOKIE, rewritten.unwrap_or(cookie));
        }
    }
}

/// Applies header edits and `SameSite` attributes to HTTP/1.1 responses.
#[derive(Debug, Default)]
pub struct ResponseHeadersStage {
    headers: Option<HeaderRules>,
    samesite: Option<SameSiteRules>,
}

impl ResponseHeadersStage {
    pub fn new(headers: Option<HeaderRules>, samesite: Option<SameSiteRules>) -> Self {
        Self { headers, samesite }
    }
}

impl Stage for ResponseHeadersStage {
    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Response(mut response) => {
                if let Some(samesite) = &self.samesite {
                    samesite.apply(&mut response);
                }
                if let Some(headers) = &self.headers {
                    headers.apply(&mut response);
                }
                ctx.fire_outbound(Outbound::Response(response));
            }
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}
