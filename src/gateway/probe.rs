//! Metadata probing and the short-lived probe cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;
use reqwest::{header, Url};

use super::cookie::UpstreamCookie;
use super::error::GatewayError;
use super::fetch::StreamRequest;
use super::resolve;
use super::upstream::Upstream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub content_length: u64,
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
    pub direct_url: Url,
    pub captured_at: Instant,
}

impl ProbeResult {
    pub fn is_manifest(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(super::manifest::is_manifest_content_type)
    }
}

type ProbeKey = (String, String);

/// Advisory cache of probe results keyed by (URL, cookie). Entries are replaced, never edited;
/// stale entries are treated as absent; a full cache evicts its oldest entry.
pub struct ProbeCache {
    entries: Mutex<HashMap<ProbeKey, ProbeResult>>,
    ttl: Duration,
    capacity: usize,
}

impl ProbeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        ProbeCache {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn key(url: &Url, cookie: &UpstreamCookie) -> ProbeKey {
        (url.as_str().to_owned(), cookie.header_value())
    }

    pub fn get(&self, url: &Url, cookie: &UpstreamCookie) -> Option<ProbeResult> {
        let key = Self::key(url, cookie);
        let mut entries = self.entries.lock();

        match entries.get(&key) {
            Some(entry) if entry.captured_at.elapsed() < self.ttl => Some(entry.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, url: &Url, cookie: &UpstreamCookie, result: ProbeResult) {
        let key = Self::key(url, cookie);
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, entry| entry.captured_at.elapsed() < self.ttl);
        }
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.captured_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                trace!(target: "mediagateway", "[Probe] evicting {}", oldest.0);
                entries.remove(&oldest);
            }
        }

        entries.insert(key, result);
    }

    pub fn evict(&self, url: &Url, cookie: &UpstreamCookie) {
        self.entries.lock().remove(&Self::key(url, cookie));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Learn size, range support and content type of the request's target without transferring
/// its body. Served from `cache` while fresh; populates it on success.
pub async fn probe(
    upstream: &Upstream,
    cache: &ProbeCache,
    request: &StreamRequest,
) -> Result<ProbeResult, GatewayError> {
    let (url, cookie) = (&request.target, &request.cookie);
    if let Some(hit) = cache.get(url, cookie) {
        trace!(target: "mediagateway", "[Probe] cache hit for {}", url);
        return Ok(hit);
    }

    let resolved = resolve::follow_head(upstream, request).await?;
    let response = &resolved.response;
    let status = response.status();

    if !status.is_success() {
        return Err(GatewayError::UpstreamRejected(status));
    }

    let headers = response.headers();
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(GatewayError::MissingContentLength)?;

    let accepts_ranges = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let result = ProbeResult {
        content_length,
        accepts_ranges,
        content_type,
        direct_url: resolved.url.clone(),
        captured_at: Instant::now(),
    };

    debug!(target: "mediagateway", "[Probe] {}: {} bytes, ranges: {}, type: {:?}, hops: {}",
        url, result.content_length, result.accepts_ranges, result.content_type, resolved.hops);

    cache.insert(url, cookie, result.clone());

    Ok(result)
}
