//! Segment relay: one upstream GET per HLS segment, redirects followed, no retries.

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use log::{debug, info};
use reqwest::Url;

use super::cors_headers;
use super::error::GatewayError;
use super::fetch::{self, Sent, StreamRequest};
use super::GatewayState;

const SEGMENT_EXTENSIONS: &[&str] = &["ts", "m4s", "aac", "ac3", "ec3", "mp4a", "vtt", "webvtt", "key", "cmfv", "cmfa"];
const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

fn extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub fn is_segment_path(url: &Url) -> bool {
    extension(url).is_some_and(|ext| SEGMENT_EXTENSIONS.contains(&ext.as_str()))
}

fn default_content_type(url: &Url) -> &'static str {
    match extension(url).as_deref() {
        Some("m4s") | Some("cmfv") => "video/iso.segment",
        Some("aac") => "audio/aac",
        Some("ac3") | Some("ec3") | Some("mp4a") | Some("cmfa") => "audio/mp4",
        Some("vtt") | Some("webvtt") => "text/vtt",
        Some("key") => "application/octet-stream",
        _ => "video/mp2t",
    }
}

/// Relay one segment. The client's `Range` header is forwarded verbatim and a 200 or 206
/// answer is passed through with its range headers; anything else is an error.
pub async fn relay(state: &GatewayState, request: &StreamRequest) -> Result<Response, GatewayError> {
    let config = state.upstream.config();
    let range = request.upstream_range.as_deref();
    let mut url = request.target.clone();
    let mut hops = 0u8;

    let response = loop {
        let builder = state.upstream.get(&url, &request.cookie, range);
        let response = match fetch::send_guarded(request, builder, config.connect_timeout).await? {
            Sent::Response(response) => response,
            Sent::Failed(err) => return Err(err.into()),
            Sent::TimedOut => return Err(GatewayError::Timeout(config.connect_timeout)),
        };

        match super::resolve::redirect_target(&response, &url) {
            Some(next) => {
                hops += 1;
                if hops > config.max_redirects {
                    return Err(GatewayError::TooManyRedirects { hops });
                }
                url = next?;
                debug!(target: "mediagateway", "[Segment] redirect {} to {}", hops, url);
            }
            None => break response,
        }
    };

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return Err(GatewayError::UpstreamRejected(status));
    }

    let headers = segment_headers(response.headers(), &url);
    info!(target: "mediagateway", "[Segment] {} {}", status.as_u16(), url);

    let (body, _report) = fetch::pump(
        response,
        request.cancel.clone(),
        request.settings(config),
        url.path().to_owned(),
    );

    let mut relayed = Response::new(body);
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    Ok(relayed)
}

fn segment_headers(upstream: &HeaderMap, url: &Url) -> HeaderMap {
    let mut headers = cors_headers();

    let content_type = upstream
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(default_content_type(url)));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(SEGMENT_CACHE_CONTROL));

    for name in [header::CONTENT_LENGTH, header::CONTENT_RANGE, header::ACCEPT_RANGES] {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    headers
}
