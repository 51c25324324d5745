pub mod cookie;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod probe;
pub mod range;
pub mod resolve;
pub mod segment;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{debug, info, warn};
use reqwest::Url;
use serde::Deserialize;

use crate::config::Config;

use self::cookie::UpstreamCookie;
use self::error::GatewayError;
use self::fetch::{Framing, StreamRequest};
use self::probe::{ProbeCache, ProbeResult};
use self::range::{ByteRange, RangePlan, RangeWindow};
use self::upstream::Upstream;

const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub upstream: Upstream,
    pub probes: Arc<ProbeCache>,
}

impl GatewayState {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let upstream = Upstream::new(config.clone())?;
        let probes = Arc::new(ProbeCache::new(config.probe_ttl, config.probe_cache_capacity));

        Ok(GatewayState {
            config,
            upstream,
            probes,
        })
    }
}

/// CORS headers carried by every response the gateway produces, errors included.
pub fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Range"));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Range, Accept-Ranges, Content-Length"),
    );
    headers
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/stream", get(stream).head(stream_head).options(preflight))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    url: Option<String>,
    cookie: Option<String>,
    redirect: Option<String>,
}

impl StreamQuery {
    fn target(&self, config: &Config) -> Result<(Url, UpstreamCookie), GatewayError> {
        let raw_url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(GatewayError::MissingParameter("url"))?;
        let raw_cookie = self
            .cookie
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(GatewayError::MissingParameter("cookie"))?;

        let url = Url::parse(raw_url.trim()).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
        }

        let cookie = UpstreamCookie::parse(raw_cookie, &config.cookie_names, &config.cookie_prefixes)?;
        Ok((url, cookie))
    }

    fn wants_redirect(&self) -> bool {
        matches!(self.redirect.as_deref(), Some("true") | Some("1"))
    }
}

/// Origin the gateway is reachable at, for links embedded in rewritten manifests. Empty when
/// unknown, which yields origin-relative links.
fn public_base(config: &Config, headers: &HeaderMap) -> String {
    if let Some(url) = &config.public_url {
        return url.as_str().trim_end_matches('/').to_owned();
    }

    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match header_str("host") {
        Some(host) => {
            let proto = header_str("x-forwarded-proto")
                .and_then(|p| p.split(',').next())
                .map(str::trim)
                .unwrap_or("http");
            format!("{}://{}", proto, host)
        }
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Manifest,
    Segment,
    Progressive,
}

impl Route {
    fn of(target: &Url) -> Self {
        if manifest::is_manifest_path(target) {
            Route::Manifest
        } else if segment::is_segment_path(target) {
            Route::Segment
        } else {
            Route::Progressive
        }
    }
}

async fn stream(
    State(state): State<GatewayState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let (target, cookie) = query.target(&state.config)?;

    if query.wants_redirect() {
        let request = StreamRequest::new(target, cookie, &state.config);
        let guard = request.cancel.clone().drop_guard();
        let url = resolve::direct_url(&state.upstream, &request).await?;
        guard.disarm();
        info!(target: "mediagateway", "[Resolve] {} -> {}", request.target, url);
        return Ok((
            cors_headers(),
            Json(serde_json::json!({ "success": true, "url": url.as_str() })),
        )
            .into_response());
    }

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut request = StreamRequest::new(target, cookie, &state.config);
    // Fires if this handler is dropped, i.e. the client went away before headers.
    let guard = request.cancel.clone().drop_guard();

    let route = Route::of(&request.target);
    debug!(target: "mediagateway", "[Request] {:?} {} (Range: {:?})", route, request.target, range_header);

    let response = match route {
        Route::Manifest => manifest::serve(&state, &request, &public_base(&state.config, &headers)).await,
        Route::Segment => {
            request.upstream_range = range_header;
            segment::relay(&state, &request).await
        }
        Route::Progressive => progressive(&state, request, range_header, &headers).await,
    }?;

    guard.disarm();
    Ok(response)
}

/// Probe, plan one chunk, fetch it and stream it. When probing fails for any reason other
/// than a redirect loop, the client's request is passed through unplanned.
async fn progressive(
    state: &GatewayState,
    mut request: StreamRequest,
    range_header: Option<String>,
    headers: &HeaderMap,
) -> Result<Response, GatewayError> {
    let config = &state.config;
    request.client_range = range_header.as_deref().and_then(ByteRange::parse);

    let metadata = match probe::probe(&state.upstream, &state.probes, &request).await {
        Ok(metadata) => metadata,
        Err(err @ (GatewayError::TooManyRedirects { .. } | GatewayError::Cancelled)) => return Err(err),
        Err(err) => {
            warn!(target: "mediagateway", "[Probe] {} failed: {}, passing request through", request.target, err);
            request.upstream_range = range_header;
            let opened = fetch::open(&state.upstream, &request).await?;
            let framing = Framing::Passthrough {
                client_range: request.upstream_range.is_some(),
            };
            return fetch::deliver(opened, framing, &request, config, DEFAULT_CONTENT_TYPE);
        }
    };

    if metadata.is_manifest() {
        return manifest::serve(state, &request, &public_base(config, headers)).await;
    }

    if let Some(limit) = config.direct_max_bytes {
        if metadata.content_length <= limit {
            info!(target: "mediagateway", "[Direct] {} ({} bytes) -> {}",
                request.target, metadata.content_length, metadata.direct_url);
            return direct_redirect(&metadata);
        }
    }

    let plan = match range::plan(request.client_range, &metadata, config.max_chunk_size) {
        Ok(plan) => plan,
        Err(err) => {
            // The size we planned against may simply be out of date.
            state.probes.evict(&request.target, &request.cookie);
            return Err(err);
        }
    };
    request.window = plan.window;
    request.upstream_range = plan.upstream_range();

    let opened = match fetch::open(&state.upstream, &request).await {
        Ok(opened) => opened,
        Err(err) => {
            if matches!(err, GatewayError::UpstreamRejected(s) if s == StatusCode::RANGE_NOT_SATISFIABLE) {
                state.probes.evict(&request.target, &request.cookie);
            }
            return Err(err);
        }
    };

    if contradicts(&opened.response, &metadata) {
        debug!(target: "mediagateway", "[Probe] {} changed size, dropping cached probe", request.target);
        state.probes.evict(&request.target, &request.cookie);
    }

    let default_type = metadata.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
    fetch::deliver(opened, Framing::Planned(plan), &request, config, default_type)
}

/// Answer a HEAD from metadata alone. Manifests are named by their path; everything else is
/// described by a HEAD upstream, and no body is ever requested.
async fn stream_head(
    State(state): State<GatewayState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let (target, cookie) = query.target(&state.config)?;
    let request = StreamRequest::new(target, cookie, &state.config);
    let guard = request.cancel.clone().drop_guard();

    let (status, head) = if Route::of(&request.target) == Route::Manifest {
        manifest_head()
    } else {
        let metadata = probe::probe(&state.upstream, &state.probes, &request).await?;
        if metadata.is_manifest() {
            manifest_head()
        } else {
            let client_range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(ByteRange::parse);
            let plan = range::plan(client_range, &metadata, state.config.max_chunk_size)?;
            media_head(&metadata, plan)
        }
    };

    guard.disarm();
    debug!(target: "mediagateway", "[Head] {} {}", status.as_u16(), request.target);

    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = head;
    Ok(response)
}

fn manifest_head() -> (StatusCode, HeaderMap) {
    let mut headers = cors_headers();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(manifest::MANIFEST_CONTENT_TYPE));
    (StatusCode::OK, headers)
}

fn media_head(metadata: &ProbeResult, plan: RangePlan) -> (StatusCode, HeaderMap) {
    let mut headers = cors_headers();

    let content_type = metadata
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    if metadata.accepts_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    match plan.window {
        Some(window) if plan.partial => {
            if let Ok(value) = HeaderValue::from_str(&window.content_range()) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
            (StatusCode::PARTIAL_CONTENT, headers)
        }
        _ => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.content_length));
            (StatusCode::OK, headers)
        }
    }
}

fn contradicts(response: &reqwest::Response, metadata: &ProbeResult) -> bool {
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(RangeWindow::from_content_range)
        .is_some_and(|window| window.total != metadata.content_length)
}

fn direct_redirect(metadata: &ProbeResult) -> Result<Response, GatewayError> {
    let mut builder = Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, metadata.direct_url.as_str());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(cors_headers());
    }
    Ok(builder.body(axum::body::Body::empty())?)
}

async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers())
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        cors_headers(),
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "probe_cache_entries": state.probes.len(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state() -> GatewayState {
        GatewayState::new(Config {
            retry_delay_unit: Duration::from_millis(10),
            ..Config::default()
        })
        .unwrap()
    }

    fn stream_uri(target: &str, cookie: &str) -> String {
        format!(
            "/stream?url={}&cookie={}",
            urlencoding::encode(target),
            urlencoding::encode(cookie)
        )
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, bytes::Bytes) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn mount_head(server: &MockServer, route: &str, total: usize, content_type: &str) {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("content-type", content_type)
                    .set_body_bytes(vec![0u8; total]),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_missing_parameters_are_rejected() {
        let (status, headers, body) = call(router(state()), get("/stream?url=https%3A%2F%2Fa.example%2Fv.mp4")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("cookie"));

        let (status, _, _) = call(router(state()), get("/stream")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let (status, _, _) = call(router(state()), get(&stream_uri("not a url", "e=1"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = call(router(state()), get(&stream_uri("ftp://a.example/v.mp4", "e=1"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_preflight_and_health() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/stream")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, HEAD, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Range");

        let (status, _, body) = call(router(state()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["probe_cache_entries"], 0);
    }

    #[tokio::test]
    async fn test_redirect_mode_returns_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/watch/1"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/media/1.mp4?sig=z"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/media/1.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let uri = format!("{}&redirect=true", stream_uri(&format!("{}/watch/1", server.uri()), "e=1"));
        let (status, _, body) = call(router(state()), get(&uri)).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["url"], format!("{}/media/1.mp4?sig=z", server.uri()));
    }

    #[tokio::test]
    async fn test_client_range_is_served_as_partial_content() {
        let server = MockServer::start().await;
        mount_head(&server, "/v.mp4", 10_000, "video/mp4").await;
        Mock::given(method("GET"))
            .and(path("/v.mp4"))
            .and(header_is("range", "bytes=0-999"))
            .and(header_is("cookie", "e=1; p=2; h=3"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-999/10000")
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(vec![9u8; 1000]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = Request::builder()
            .uri(stream_uri(&format!("{}/v.mp4", server.uri()), "e=1; p=2; h=3"))
            .header(header::RANGE, "bytes=0-999")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-999/10000");
        assert_eq!(headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "Content-Range, Accept-Ranges, Content-Length");
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn test_small_resource_without_range_is_plain_200() {
        let server = MockServer::start().await;
        mount_head(&server, "/small.mp4", 200_000, "video/mp4").await;
        Mock::given(method("GET"))
            .and(path("/small.mp4"))
            .and(header_is("range", "bytes=0-199999"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-199999/200000")
                    .set_body_bytes(vec![5u8; 200_000]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (status, headers, body) =
            call(router(state()), get(&stream_uri(&format!("{}/small.mp4", server.uri()), "e=1"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_LENGTH], "200000");
        assert!(headers.get(header::CONTENT_RANGE).is_none());
        assert_eq!(body.len(), 200_000);
    }

    #[tokio::test]
    async fn test_large_resource_is_served_one_chunk_at_a_time() {
        let server = MockServer::start().await;
        mount_head(&server, "/big.mp4", 2_000_000, "video/mp4").await;
        Mock::given(method("GET"))
            .and(path("/big.mp4"))
            .and(header_is("range", "bytes=0-524287"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-524287/2000000")
                    .set_body_bytes(vec![1u8; 524_288]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (status, headers, _) =
            call(router(state()), get(&stream_uri(&format!("{}/big.mp4", server.uri()), "e=1"))).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-524287/2000000");
        assert_eq!(headers[header::CONTENT_LENGTH], "524288");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let server = MockServer::start().await;
        mount_head(&server, "/v.mp4", 10_000, "video/mp4").await;

        let request = Request::builder()
            .uri(stream_uri(&format!("{}/v.mp4", server.uri()), "e=1"))
            .header(header::RANGE, "bytes=20000-")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */10000");
    }

    #[tokio::test]
    async fn test_probe_failure_falls_back_to_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v.webm"))
            .and(header_is("range", "bytes=10-19"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 10-19/100")
                    .insert_header("content-type", "video/webm")
                    .set_body_bytes(vec![2u8; 10]),
            )
            .mount(&server)
            .await;

        let request = Request::builder()
            .uri(stream_uri(&format!("{}/v.webm", server.uri()), "e=1"))
            .header(header::RANGE, "bytes=10-19")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 10-19/100");
        assert_eq!(headers[header::CONTENT_TYPE], "video/webm");
        assert_eq!(body.len(), 10);
    }

    #[tokio::test]
    async fn test_manifest_is_rewritten_through_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hls/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/vnd.apple.mpegurl")
                    .set_body_string("#EXTM3U\n#EXTINF:10.0,\nsegment001.ts\n#EXT-X-ENDLIST\n"),
            )
            .mount(&server)
            .await;

        let request = Request::builder()
            .uri(stream_uri(&format!("{}/hls/index.m3u8", server.uri()), "e=1"))
            .header(header::HOST, "gw.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=5");

        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:10.0,");
        let expected_target = urlencoding::encode(&format!("{}/hls/segment001.ts", server.uri())).into_owned();
        assert_eq!(
            lines[2],
            format!("http://gw.example.com/stream?url={}&cookie=e%3D1", expected_target)
        );
        assert_eq!(lines[3], "#EXT-X-ENDLIST");
    }

    #[tokio::test]
    async fn test_manifest_detected_by_content_type() {
        let server = MockServer::start().await;
        mount_head(&server, "/live", 64, "application/x-mpegURL").await;
        Mock::given(method("GET"))
            .and(path("/live"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nchunk_1.ts\n"))
            .mount(&server)
            .await;

        let (status, headers, body) =
            call(router(state()), get(&stream_uri(&format!("{}/live", server.uri()), "e=1"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("/stream?url="));
    }

    #[tokio::test]
    async fn test_small_resource_redirects_when_enabled() {
        let server = MockServer::start().await;
        mount_head(&server, "/thumb.mp4", 1_000, "video/mp4").await;

        let state = GatewayState::new(Config {
            direct_max_bytes: Some(4_096),
            ..Config::default()
        })
        .unwrap();
        let (status, headers, _) =
            call(router(state), get(&stream_uri(&format!("{}/thumb.mp4", server.uri()), "e=1"))).await;

        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(headers[header::LOCATION], format!("{}/thumb.mp4", server.uri()));
    }

    #[tokio::test]
    async fn test_head_is_answered_without_fetching_body() {
        let server = MockServer::start().await;
        mount_head(&server, "/v.mp4", 10_000, "video/mp4").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let request = Request::builder()
            .method(Method::HEAD)
            .uri(stream_uri(&format!("{}/v.mp4", server.uri()), "e=1"))
            .header(header::RANGE, "bytes=0-999")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-999/10000");
        assert_eq!(headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(body.is_empty());

        let request = Request::builder()
            .method(Method::HEAD)
            .uri(stream_uri(&format!("{}/v.mp4", server.uri()), "e=1"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_LENGTH], "10000");
        assert!(headers.get(header::CONTENT_RANGE).is_none());
    }

    #[tokio::test]
    async fn test_head_on_manifest_skips_upstream() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let request = Request::builder()
            .method(Method::HEAD)
            .uri(stream_uri(&format!("{}/hls/index.m3u8", server.uri()), "e=1"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = call(router(state()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
    }

    #[test]
    fn test_public_base_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_base(&Config::default(), &headers), "");

        headers.insert(header::HOST, HeaderValue::from_static("gw.local:3000"));
        assert_eq!(public_base(&Config::default(), &headers), "http://gw.local:3000");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(public_base(&Config::default(), &headers), "https://gw.local:3000");

        let config = Config {
            public_url: Some(Url::parse("https://media.example.com/").unwrap()),
            ..Config::default()
        };
        assert_eq!(public_base(&config, &headers), "https://media.example.com");
    }

    #[test]
    fn test_routing_by_extension() {
        let route = |s: &str| Route::of(&Url::parse(s).unwrap());
        assert_eq!(route("https://a.example/x/index.m3u8"), Route::Manifest);
        assert_eq!(route("https://a.example/x/seg1.ts"), Route::Segment);
        assert_eq!(route("https://a.example/x/movie.mp4"), Route::Progressive);
        assert_eq!(route("https://a.example/watch?v=1"), Route::Progressive);
    }
}
