//! Upstream fetch engine.
//!
//! `open` runs the pre-byte part of a request: redirects and retries happen there and nowhere
//! else, so nothing is ever retried once the client has seen headers. `pump` then moves the
//! body to the client through a bounded channel and tears the upstream connection down on
//! completion, stall, deadline or client disconnect.

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use reqwest::{RequestBuilder, Url};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

use super::cookie::UpstreamCookie;
use super::cors_headers;
use super::error::{is_reset, is_transient, GatewayError};
use super::range::{ByteRange, RangePlan, RangeWindow};
use super::resolve::redirect_target;
use super::upstream::Upstream;

/// Chunks buffered between the upstream reader and the client writer.
const CHANNEL_CHUNKS: usize = 4;

/// How long an abnormal end waits for room in the channel to reach a slow client.
const ABORT_GRACE: Duration = Duration::from_secs(5);

const PROGRESSIVE_CACHE_CONTROL: &str = "public, max-age=3600";

/// One inbound call. Owned by the task serving it and gone once the response is done.
#[derive(Debug)]
pub struct StreamRequest {
    pub target: Url,
    pub cookie: UpstreamCookie,
    pub client_range: Option<ByteRange>,
    pub window: Option<RangeWindow>,
    /// `Range` header sent upstream, if any.
    pub upstream_range: Option<String>,
    pub cancel: CancellationToken,
    pub budget: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl StreamRequest {
    pub fn new(target: Url, cookie: UpstreamCookie, config: &Config) -> Self {
        StreamRequest {
            target,
            cookie,
            client_range: None,
            window: None,
            upstream_range: None,
            cancel: CancellationToken::new(),
            budget: config.request_timeout,
            deadline: config.request_timeout.map(|budget| Instant::now() + budget),
        }
    }

    pub fn settings(&self, config: &Config) -> StreamSettings {
        StreamSettings {
            stall_timeout: config.effective_stall_timeout(),
            check_interval: config.stall_check_interval,
            deadline: self.deadline,
        }
    }

    fn budget_exceeded(&self) -> GatewayError {
        GatewayError::Timeout(self.budget.unwrap_or_default())
    }
}

pub struct Opened {
    pub response: reqwest::Response,
    pub final_url: Url,
    pub attempts: u8,
    pub redirects: u8,
}

#[derive(Debug)]
enum Step {
    Redirect(Url),
    Retry(StatusCode),
    Reject(StatusCode),
    Deliver,
}

fn classify(response: &reqwest::Response, current: &Url) -> Result<Step, GatewayError> {
    if let Some(next) = redirect_target(response, current) {
        return next.map(Step::Redirect);
    }

    let status = response.status();
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Ok(Step::Retry(status))
    } else if status.is_client_error() || status.is_redirection() {
        Ok(Step::Reject(status))
    } else {
        Ok(Step::Deliver)
    }
}

pub(super) enum Sent {
    Response(reqwest::Response),
    Failed(reqwest::Error),
    TimedOut,
}

/// Send `builder`, giving up on cancellation, on the request's hard deadline, or when no
/// response headers arrived within `connect_timeout`.
pub(super) async fn send_guarded(
    request: &StreamRequest,
    builder: RequestBuilder,
    connect_timeout: Duration,
) -> Result<Sent, GatewayError> {
    tokio::select! {
        biased;
        _ = request.cancel.cancelled() => Err(GatewayError::Cancelled),
        _ = deadline_reached(request.deadline) => Err(request.budget_exceeded()),
        result = tokio::time::timeout(connect_timeout, builder.send()) => Ok(match result {
            Ok(Ok(response)) => Sent::Response(response),
            Ok(Err(err)) => Sent::Failed(err),
            Err(_) => Sent::TimedOut,
        }),
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Failure {
    Status(StatusCode),
    Transport(reqwest::Error),
    TimedOut,
}

impl Failure {
    fn into_error(self, attempts: u8, connect_timeout: Duration) -> GatewayError {
        match self {
            Failure::Status(status) => GatewayError::UpstreamUnavailable { status, attempts },
            Failure::Transport(err) => GatewayError::Transport(err),
            Failure::TimedOut => GatewayError::Timeout(connect_timeout),
        }
    }
}

/// Request `request.target` until a deliverable answer arrives. Redirects and retries are
/// counted separately: at most `max_redirects` hops and `max_attempts` tries.
pub async fn open(upstream: &Upstream, request: &StreamRequest) -> Result<Opened, GatewayError> {
    let config = upstream.config();
    let range = request.upstream_range.as_deref();
    let mut url = request.target.clone();
    let mut redirects = 0u8;
    let mut attempt = 1u8;

    loop {
        debug!(target: "mediagateway", "[Attempt {}] Requesting: {}{}", attempt, url,
            range.map(|r| format!(" (Range: {})", r)).unwrap_or_default());

        let builder = upstream.get(&url, &request.cookie, range);
        let failure = match send_guarded(request, builder, config.connect_timeout).await? {
            Sent::Response(response) => match classify(&response, &url)? {
                Step::Deliver => {
                    debug!(target: "mediagateway", "[Attempt {}] Response status: {}", attempt, response.status());
                    return Ok(Opened {
                        response,
                        final_url: url,
                        attempts: attempt,
                        redirects,
                    });
                }
                Step::Redirect(next) => {
                    redirects += 1;
                    if redirects > config.max_redirects {
                        error!(target: "mediagateway", "[Attempt {}] Too many redirects", attempt);
                        return Err(GatewayError::TooManyRedirects { hops: redirects });
                    }
                    debug!(target: "mediagateway", "[Attempt {}] Redirecting to: {}", attempt, next);
                    url = next;
                    continue;
                }
                Step::Reject(status) => {
                    error!(target: "mediagateway", "[Attempt {}] Failed with status: {}", attempt, status);
                    return Err(GatewayError::UpstreamRejected(status));
                }
                Step::Retry(status) => Failure::Status(status),
            },
            Sent::Failed(err) if is_transient(&err) => Failure::Transport(err),
            Sent::Failed(err) => {
                error!(target: "mediagateway", "[Attempt {}] Request error: {}", attempt, err);
                return Err(err.into());
            }
            Sent::TimedOut => Failure::TimedOut,
        };

        if attempt >= config.max_attempts {
            let err = failure.into_error(attempt, config.connect_timeout);
            error!(target: "mediagateway", "[Attempt {}] Giving up: {}", attempt, err);
            return Err(err);
        }

        let delay = config.retry_delay_unit * u32::from(attempt);
        match &failure {
            Failure::Status(status) => warn!(target: "mediagateway",
                "[Attempt {}] Server error {}, retrying in {:?}", attempt, status, delay),
            Failure::Transport(err) => warn!(target: "mediagateway",
                "[Attempt {}] Retrying after error: {}, in {:?}", attempt, err, delay),
            Failure::TimedOut => warn!(target: "mediagateway",
                "[Attempt {}] Initial connection timeout, retrying in {:?}", attempt, delay),
        }

        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = deadline_reached(request.deadline) => return Err(request.budget_exceeded()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Stalled,
    ClientDisconnected,
    /// Reset after headers went out: the client paused or seeked. Not an error.
    UpstreamReset,
    UpstreamFailed,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub stall_timeout: Duration,
    pub check_interval: Duration,
    pub deadline: Option<Instant>,
}

/// Hand `response`'s body to a pump task and return the client-facing body fed by it.
pub fn pump(
    response: reqwest::Response,
    cancel: CancellationToken,
    settings: StreamSettings,
    label: String,
) -> (Body, JoinHandle<StreamReport>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CHUNKS);
    let task = tokio::spawn(run_pump(response, tx, cancel, settings, label));
    (Body::from_stream(ReceiverStream::new(rx)), task)
}

async fn run_pump(
    mut response: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    cancel: CancellationToken,
    settings: StreamSettings,
    label: String,
) -> StreamReport {
    let mut bytes = 0u64;
    let mut pending: Option<Bytes> = None;
    let mut last_progress = Instant::now();
    let mut ticker = tokio::time::interval_at(last_progress + settings.check_interval, settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamOutcome::Cancelled,
            _ = tx.closed() => break StreamOutcome::ClientDisconnected,
            _ = deadline_reached(settings.deadline) => break StreamOutcome::DeadlineExceeded,
            _ = ticker.tick() => {
                let idle = last_progress.elapsed();
                if idle >= settings.stall_timeout {
                    break StreamOutcome::Stalled;
                }
                if idle >= settings.check_interval {
                    debug!(target: "mediagateway", "[Stream] {} idle for {}s, bytes: {}", label, idle.as_secs(), bytes);
                }
            }
            permit = tx.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(chunk) = pending.take() {
                        permit.send(Ok(chunk));
                    }
                    last_progress = Instant::now();
                }
                Err(_) => break StreamOutcome::ClientDisconnected,
            },
            chunk = response.chunk(), if pending.is_none() => match chunk {
                Ok(Some(chunk)) => {
                    bytes += chunk.len() as u64;
                    last_progress = Instant::now();
                    pending = Some(chunk);
                }
                Ok(None) => break StreamOutcome::Completed,
                Err(err) if is_reset(&err) => break StreamOutcome::UpstreamReset,
                Err(err) => {
                    warn!(target: "mediagateway", "[Stream] {} stream error: {}", label, err);
                    break StreamOutcome::UpstreamFailed;
                }
            },
        }
    };

    // Closing the upstream socket is the only cancel signal the protocol has.
    drop(response);
    cancel.cancel();

    match outcome {
        StreamOutcome::Completed => {
            info!(target: "mediagateway", "[Stream] {} completed, total bytes: {}", label, bytes)
        }
        StreamOutcome::ClientDisconnected => {
            info!(target: "mediagateway", "[Stream] {} client disconnected, bytes: {}", label, bytes)
        }
        StreamOutcome::UpstreamReset => {
            debug!(target: "mediagateway", "[Stream] {} connection reset during streaming (client likely paused/seeked), bytes: {}", label, bytes)
        }
        StreamOutcome::Stalled => {
            warn!(target: "mediagateway", "[Stream] {} stalled for {}s, closing, bytes: {}",
                label, settings.stall_timeout.as_secs(), bytes)
        }
        other => {
            warn!(target: "mediagateway", "[Stream] {} ended: {:?}, bytes: {}", label, other, bytes)
        }
    }

    // Anything short of completion must not look like a complete body to the client.
    if !matches!(outcome, StreamOutcome::Completed | StreamOutcome::ClientDisconnected) {
        let abort = io::Error::new(
            io::ErrorKind::Interrupted,
            format!("upstream stream ended: {:?}", outcome),
        );
        if tokio::time::timeout(ABORT_GRACE, tx.send(Err(abort))).await.is_err() {
            debug!(target: "mediagateway", "[Stream] {} client not reading, dropping abort", label);
        }
    }

    StreamReport { outcome, bytes }
}

/// Read a whole small body (a manifest) under the same cancellation, deadline and stall rules
/// the pump applies, refusing anything larger than `limit` bytes.
pub async fn collect(
    mut response: reqwest::Response,
    request: &StreamRequest,
    settings: StreamSettings,
    limit: usize,
) -> Result<Bytes, GatewayError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(GatewayError::BodyTooLarge { limit });
    }

    let mut body = BytesMut::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = deadline_reached(settings.deadline) => return Err(request.budget_exceeded()),
            next = tokio::time::timeout(settings.stall_timeout, response.chunk()) => match next {
                Ok(chunk) => chunk?,
                Err(_) => return Err(GatewayError::Timeout(settings.stall_timeout)),
            },
        };

        match chunk {
            Some(chunk) if body.len() + chunk.len() > limit => {
                return Err(GatewayError::BodyTooLarge { limit });
            }
            Some(chunk) => body.extend_from_slice(&chunk),
            None => return Ok(body.freeze()),
        }
    }
}

/// How the client-visible status and range headers are derived from the upstream answer.
#[derive(Debug, Clone, Copy)]
pub enum Framing {
    /// Planned against probed metadata.
    Planned(RangePlan),
    /// No metadata: mirror the upstream answer, 206 only if the client asked for a range.
    Passthrough { client_range: bool },
}

fn copy_header(from: &HeaderMap, to: &mut HeaderMap, name: header::HeaderName) {
    if let Some(value) = from.get(&name) {
        to.insert(name, value.clone());
    }
}

/// Status and headers for the client, given what upstream answered.
pub fn response_head(
    upstream: &HeaderMap,
    upstream_status: StatusCode,
    framing: Framing,
    default_content_type: &str,
) -> (StatusCode, HeaderMap) {
    let mut headers = cors_headers();

    let content_type = upstream
        .get(header::CONTENT_TYPE)
        .cloned()
        .or_else(|| HeaderValue::from_str(default_content_type).ok())
        .unwrap_or_else(|| HeaderValue::from_static("video/mp4"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::ACCEPT_RANGES,
        upstream
            .get(header::ACCEPT_RANGES)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("bytes")),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(PROGRESSIVE_CACHE_CONTROL));
    copy_header(upstream, &mut headers, header::LAST_MODIFIED);
    copy_header(upstream, &mut headers, header::ETAG);

    let partial_upstream = upstream_status == StatusCode::PARTIAL_CONTENT;

    let status = match framing {
        Framing::Planned(plan) if partial_upstream => {
            let window = upstream
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(RangeWindow::from_content_range)
                .or(plan.window);

            match window {
                Some(window) if plan.partial || !window.covers_whole() => {
                    if let Ok(value) = HeaderValue::from_str(&window.content_range()) {
                        headers.insert(header::CONTENT_RANGE, value);
                    }
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
                    StatusCode::PARTIAL_CONTENT
                }
                Some(window) => {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.total));
                    StatusCode::OK
                }
                None => {
                    copy_header(upstream, &mut headers, header::CONTENT_RANGE);
                    copy_header(upstream, &mut headers, header::CONTENT_LENGTH);
                    StatusCode::PARTIAL_CONTENT
                }
            }
        }
        Framing::Planned(_) => {
            copy_header(upstream, &mut headers, header::CONTENT_LENGTH);
            StatusCode::OK
        }
        Framing::Passthrough { client_range } => {
            copy_header(upstream, &mut headers, header::CONTENT_LENGTH);
            copy_header(upstream, &mut headers, header::CONTENT_RANGE);
            if client_range && partial_upstream {
                StatusCode::PARTIAL_CONTENT
            } else {
                headers.remove(header::CONTENT_RANGE);
                StatusCode::OK
            }
        }
    };

    (status, headers)
}

/// Write the head exactly once and start pumping the body.
pub fn deliver(
    opened: Opened,
    framing: Framing,
    request: &StreamRequest,
    config: &Config,
    default_content_type: &str,
) -> Result<Response, GatewayError> {
    let (status, headers) = response_head(
        opened.response.headers(),
        opened.response.status(),
        framing,
        default_content_type,
    );

    info!(target: "mediagateway", "[Attempt {}] Streaming started: {} {}, Content-Length: {}",
        opened.attempts, status.as_u16(), opened.final_url,
        headers.get(header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).unwrap_or("unknown"));

    let (body, _report) = pump(
        opened.response,
        request.cancel.clone(),
        request.settings(config),
        opened.final_url.path().to_owned(),
    );

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
