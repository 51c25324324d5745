use std::sync::Arc;

use anyhow::{Context, Result};
use log::trace;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    redirect, Method, RequestBuilder, Url,
};

use crate::config::Config;

use super::cookie::UpstreamCookie;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_MEDIA: &str =
    "video/webm,video/ogg,video/*;q=0.9,application/ogg;q=0.7,audio/*;q=0.6,*/*;q=0.5";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// Shared keep-alive client towards the upstream host. Redirects are never followed by
/// reqwest itself: every hop is counted by the caller.
#[derive(Clone)]
pub struct Upstream {
    http_client: reqwest::Client,
    config: Arc<Config>,
}

impl Upstream {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(std::time::Duration::from_secs(1))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Upstream {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get(&self, url: &Url, cookie: &UpstreamCookie, range: Option<&str>) -> RequestBuilder {
        self.request(Method::GET, url, cookie, range)
    }

    pub fn head(&self, url: &Url, cookie: &UpstreamCookie) -> RequestBuilder {
        self.request(Method::HEAD, url, cookie, None)
    }

    fn request(
        &self,
        method: Method,
        url: &Url,
        cookie: &UpstreamCookie,
        range: Option<&str>,
    ) -> RequestBuilder {
        trace!(target: "mediagateway", "{} {}{}", method, url,
            range.map(|r| format!(" (Range: {})", r)).unwrap_or_default());

        self.http_client
            .request(method, url.clone())
            .headers(self.identity_headers(url, cookie, range))
    }

    /// Browser-like header set; the upstream host refuses anything that doesn't look like a player.
    fn identity_headers(&self, url: &Url, cookie: &UpstreamCookie, range: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_MEDIA));
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        if let Ok(referer) = HeaderValue::from_str(&self.config.referer_for(url)) {
            headers.insert(header::REFERER, referer);
        }
        if let Ok(value) = HeaderValue::from_str(&cookie.header_value()) {
            headers.insert(header::COOKIE, value);
        }
        if let Some(value) = range.and_then(|r| HeaderValue::from_str(r).ok()) {
            headers.insert(header::RANGE, value);
        }

        headers
    }
}
