//! Direct-URL resolution: walk the redirect chain with header-only requests so the client can
//! fetch the final location itself.

use log::debug;
use reqwest::{header, Response, Url};

use super::error::GatewayError;
use super::fetch::{send_guarded, Sent, StreamRequest};
use super::upstream::Upstream;

pub struct Resolved {
    pub url: Url,
    pub response: Response,
    pub hops: u8,
}

/// Where a 3xx answer points to, resolved against the URL that produced it.
pub fn redirect_target(response: &Response, current: &Url) -> Option<Result<Url, GatewayError>> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response.headers().get(header::LOCATION)?;
    let target = location
        .to_str()
        .map_err(|_| GatewayError::InvalidUrl("non-ASCII redirect location".into()))
        .and_then(|loc| {
            current
                .join(loc)
                .map_err(|e| GatewayError::InvalidUrl(format!("Invalid redirect URL: {}", e)))
        });
    Some(target)
}

/// Follow redirects with HEAD requests, at most `max_redirects` hops. Every hop is bounded by
/// the connect timeout, the request's deadline and its cancellation.
pub async fn follow_head(upstream: &Upstream, request: &StreamRequest) -> Result<Resolved, GatewayError> {
    let config = upstream.config();
    let mut current = request.target.clone();
    let mut hops = 0u8;

    loop {
        let builder = upstream.head(&current, &request.cookie);
        let response = match send_guarded(request, builder, config.connect_timeout).await? {
            Sent::Response(response) => response,
            Sent::Failed(err) => return Err(err.into()),
            Sent::TimedOut => return Err(GatewayError::Timeout(config.connect_timeout)),
        };

        let next = match redirect_target(&response, &current) {
            Some(next) => next?,
            None => {
                return Ok(Resolved {
                    url: current,
                    response,
                    hops,
                })
            }
        };

        hops += 1;
        if hops > config.max_redirects {
            return Err(GatewayError::TooManyRedirects { hops });
        }

        debug!(target: "mediagateway", "[Resolve] hop {}: {} -> {}", hops, current, next);
        current = next;
    }
}

/// Final URL of the request's target after redirects, without transferring any body bytes.
pub async fn direct_url(upstream: &Upstream, request: &StreamRequest) -> Result<Url, GatewayError> {
    let resolved = follow_head(upstream, request).await?;
    let status = resolved.response.status();

    if status.is_client_error() || status.is_server_error() {
        return Err(GatewayError::UpstreamRejected(status));
    }

    Ok(resolved.url)
}
