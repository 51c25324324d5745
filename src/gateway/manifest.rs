//! HLS manifest rewriting: every media reference is pointed back through the gateway.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use log::{debug, info};
use reqwest::Url;

use super::cookie::UpstreamCookie;
use super::error::GatewayError;
use super::fetch::{self, Opened};
use super::{cors_headers, GatewayState};

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MANIFEST_CACHE_CONTROL: &str = "public, max-age=5";
/// Largest playlist accepted from upstream.
const MAX_MANIFEST_BYTES: usize = 8 * 1024 * 1024;

pub fn is_manifest_path(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

pub fn is_manifest_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        mime.as_str(),
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" | "audio/mpegurl" | "audio/x-mpegurl"
    )
}

/// Builds gateway URLs that carry an absolute upstream target and the forwarded cookie.
pub struct GatewayLinks {
    base: String,
    cookie: String,
}

impl GatewayLinks {
    /// `base` is the gateway's public origin (`https://gw.example.com`), or empty for
    /// origin-relative links.
    pub fn new(base: &str, cookie: &UpstreamCookie) -> Self {
        GatewayLinks {
            base: base.trim_end_matches('/').to_owned(),
            cookie: cookie.header_value(),
        }
    }

    pub fn link(&self, target: &Url) -> String {
        format!(
            "{}/stream?url={}&cookie={}",
            self.base,
            urlencoding::encode(target.as_str()),
            urlencoding::encode(&self.cookie)
        )
    }
}

/// Rewrite every URI line of `manifest`, resolved against `manifest_url`. Tags, comments and
/// blank lines pass through untouched and line order is kept.
pub fn rewrite(manifest: &str, manifest_url: &Url, links: &GatewayLinks) -> String {
    let mut out = String::with_capacity(manifest.len() * 2);

    for line in manifest.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        let ending = &line[content.len()..];
        let reference = content.trim();

        if reference.is_empty() || reference.starts_with('#') {
            out.push_str(line);
            continue;
        }

        match manifest_url.join(reference) {
            Ok(target) => {
                out.push_str(&links.link(&target));
                out.push_str(ending);
            }
            // Left as-is rather than dropping a segment and shifting the playlist.
            Err(_) => out.push_str(line),
        }
    }

    out
}

/// Fetch the manifest through the fetch engine (redirects, retries), rewrite it against its
/// final location and serve it with a short cache lifetime.
pub async fn serve(
    state: &GatewayState,
    request: &fetch::StreamRequest,
    public_base: &str,
) -> Result<Response, GatewayError> {
    let Opened {
        response,
        final_url,
        attempts,
        redirects,
    } = fetch::open(&state.upstream, request).await?;

    let settings = request.settings(state.upstream.config());
    let raw = fetch::collect(response, request, settings, MAX_MANIFEST_BYTES).await?;
    let body = String::from_utf8_lossy(&raw);
    let links = GatewayLinks::new(public_base, &request.cookie);
    let rewritten = rewrite(&body, &final_url, &links);

    info!(target: "mediagateway", "[Manifest] {} rewritten ({} lines, {} attempts, {} redirects)",
        request.target, rewritten.lines().count(), attempts, redirects);
    debug!(target: "mediagateway", "[Manifest] resolved against {}", final_url);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, MANIFEST_CACHE_CONTROL)
        .header(header::CONTENT_LENGTH, rewritten.len());

    if let Some(headers) = builder.headers_mut() {
        headers.extend(cors_headers());
    }

    Ok(builder.body(Body::from(rewritten))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn links() -> GatewayLinks {
        let cookie = UpstreamCookie::parse("e=1; p=2", &[], &[]).unwrap();
        GatewayLinks::new("https://gw.example.com/", &cookie)
    }

    #[test]
    fn test_relative_segment_becomes_absolute_gateway_url() {
        let manifest_url = Url::parse("https://cdn.example.com/show/ep1/index.m3u8?tok=9").unwrap();
        let manifest = "#EXTM3U\n#EXTINF:10.0,\nsegment001.ts\n";

        let out = rewrite(manifest, &manifest_url, &links());
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:10.0,");
        assert_eq!(
            lines[2],
            "https://gw.example.com/stream?url=https%3A%2F%2Fcdn.example.com%2Fshow%2Fep1%2Fsegment001.ts&cookie=e%3D1%3B%20p%3D2"
        );
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_directives_blank_lines_and_order_preserved() {
        let manifest_url = Url::parse("https://cdn.example.com/hls/master.m3u8").unwrap();
        let manifest = "#EXTM3U\r\n#EXT-X-VERSION:3\r\n\r\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\r\n#EXTINF:4,\r\n/abs/a.ts\r\n#EXTINF:4,\r\nhttps://other.example.net/b.ts\r\n#EXT-X-ENDLIST";

        let out = rewrite(manifest, &manifest_url, &links());
        let lines: Vec<&str> = out.split("\r\n").collect();

        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"");
        assert!(lines[5].contains("url=https%3A%2F%2Fcdn.example.com%2Fabs%2Fa.ts"));
        assert!(lines[7].contains("url=https%3A%2F%2Fother.example.net%2Fb.ts"));
        assert_eq!(lines[8], "#EXT-X-ENDLIST");
    }

    #[test]
    fn test_relative_links_without_public_base() {
        let cookie = UpstreamCookie::parse("e=1", &[], &[]).unwrap();
        let links = GatewayLinks::new("", &cookie);
        let target = Url::parse("https://cdn.example.com/a.ts").unwrap();
        assert!(links.link(&target).starts_with("/stream?url="));
    }

    /// Upstream that answers a manifest request with headers and the first line, then goes
    /// quiet without closing.
    async fn silent_manifest_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.apple.mpegurl\r\nContent-Length: 1000\r\n\r\n#EXTM3U\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        format!("http://{}/live/index.m3u8", addr)
    }

    #[tokio::test]
    async fn test_stalled_manifest_body_ends_at_request_budget() {
        let target = silent_manifest_upstream().await;
        let config = Config {
            request_timeout: Some(Duration::from_secs(1)),
            stall_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        let state = GatewayState::new(config).unwrap();
        let cookie = UpstreamCookie::parse("e=1", &[], &[]).unwrap();
        let request = fetch::StreamRequest::new(Url::parse(&target).unwrap(), cookie, &state.config);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), serve(&state, &request, "")).await;

        let err = result.expect("manifest read must not outlive the budget").unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_oversized_manifest_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'#'; MAX_MANIFEST_BYTES + 1]))
            .mount(&server)
            .await;

        let state = GatewayState::new(Config::default()).unwrap();
        let cookie = UpstreamCookie::parse("e=1", &[], &[]).unwrap();
        let target = Url::parse(&format!("{}/big.m3u8", server.uri())).unwrap();
        let request = fetch::StreamRequest::new(target, cookie, &state.config);

        let err = serve(&state, &request, "").await.unwrap_err();
        assert!(matches!(err, GatewayError::BodyTooLarge { .. }));
    }

    #[test]
    fn test_content_type_detection() {
        assert!(is_manifest_content_type("application/vnd.apple.mpegurl"));
        assert!(is_manifest_content_type("application/x-mpegURL; charset=utf-8"));
        assert!(!is_manifest_content_type("video/mp2t"));
        assert!(is_manifest_path(&Url::parse("https://a.example/x/INDEX.M3U8?t=1").unwrap()));
        assert!(!is_manifest_path(&Url::parse("https://a.example/x/seg.ts").unwrap()));
    }
}
