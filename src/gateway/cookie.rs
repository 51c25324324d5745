//! Forwarded upstream cookie.
//!
//! Callers hand over whatever their session layer captured: either a ready `Cookie` header
//! (`a=1; b=2`) or a raw comma-joined `Set-Cookie` dump with attributes. Only the cookies the
//! upstream host actually checks are kept. Pairs and attributes are told apart by the
//! `cookie` crate's own `Set-Cookie` grammar.

use std::fmt;

use axum_extra::extract::cookie::Cookie;

use super::error::GatewayError;

/// Legacy `Set-Cookie` attributes the cookie parser accepts but does not record.
const IGNORED_ATTRIBUTES: &[&str] = &["version", "comment", "commenturl", "discard", "port", "priority"];

/// Split a comma-joined `Set-Cookie` dump into single entries. A comma only starts a new
/// entry when the text after it looks like `name=value`, so `Expires` dates stay whole.
fn entries(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;

    for (at, _) in raw.match_indices(',') {
        let rest = &raw[at + 1..];
        let next = rest.split([';', ',']).next().unwrap_or_default();
        if next.contains('=') {
            out.push(&raw[start..at]);
            start = at + 1;
        }
    }
    out.push(&raw[start..]);
    out
}

fn is_attribute(piece: &str) -> bool {
    let name = piece.split('=').next().unwrap_or_default().trim().to_ascii_lowercase();
    if IGNORED_ATTRIBUTES.contains(&name.as_str()) {
        return true;
    }

    match Cookie::parse(format!("x=; {}", piece.trim())) {
        Ok(c) => {
            c.path().is_some()
                || c.domain().is_some()
                || c.expires().is_some()
                || c.max_age().is_some()
                || c.secure().is_some()
                || c.http_only().is_some()
                || c.same_site().is_some()
                || c.partitioned().is_some()
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamCookie {
    pairs: Vec<(String, String)>,
}

impl UpstreamCookie {
    /// Keep the cookies named in `names` or starting with one of `prefixes`. With both lists
    /// empty every cookie is kept.
    pub fn parse(raw: &str, names: &[String], prefixes: &[String]) -> Result<Self, GatewayError> {
        let keep_all = names.is_empty() && prefixes.is_empty();
        let mut pairs: Vec<(String, String)> = Vec::new();

        let pieces = entries(raw).into_iter().flat_map(|entry| entry.split(';'));
        for piece in pieces {
            if piece.trim().is_empty() || is_attribute(piece) {
                continue;
            }
            let Ok(cookie) = Cookie::parse(piece.trim()) else {
                continue;
            };
            let (name, value) = cookie.name_value();

            let wanted = keep_all
                || names.iter().any(|n| n == name)
                || prefixes.iter().any(|p| name.starts_with(p.as_str()));
            if !wanted {
                continue;
            }

            match pairs.iter_mut().find(|(existing, _)| existing == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => pairs.push((name.to_string(), value.to_string())),
            }
        }

        if pairs.is_empty() {
            return Err(GatewayError::InvalidCookie("no usable upstream cookies"));
        }

        Ok(UpstreamCookie { pairs })
    }

    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UpstreamCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}
