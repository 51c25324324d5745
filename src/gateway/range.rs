//! Byte-range planning.
//!
//! Every upstream call is kept to at most one chunk so a single client request never holds an
//! upstream connection open for the whole resource.

use super::error::GatewayError;
use super::probe::ProbeResult;

/// A client `Range: bytes=...` request before it is resolved against a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end` or `bytes=start-`
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`
    Suffix(u64),
}

impl ByteRange {
    /// Parse a single-range `Range` header. Anything else (multiple ranges, other units,
    /// garbage) is `None` and the header gets ignored.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => end.parse().ok().map(ByteRange::Suffix),
            (false, true) => start.parse().ok().map(|start| ByteRange::From { start, end: None }),
            (false, false) => {
                let start: u64 = start.parse().ok()?;
                let end: u64 = end.parse().ok()?;
                (start <= end).then_some(ByteRange::From {
                    start,
                    end: Some(end),
                })
            }
            (true, true) => None,
        }
    }

    /// Concrete `(start, end)` within a `total` byte resource, `None` when unsatisfiable.
    pub fn resolve(&self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        match *self {
            ByteRange::From { start, end } => {
                if start >= total {
                    return None;
                }
                let end = end.map_or(total - 1, |end| end.min(total - 1));
                Some((start, end))
            }
            ByteRange::Suffix(0) => None,
            ByteRange::Suffix(len) => Some((total.saturating_sub(len), total - 1)),
        }
    }
}

/// `0 <= start <= end < total`, and `end - start + 1 <= max_chunk_size` for planned windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl RangeWindow {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn covers_whole(&self) -> bool {
        self.start == 0 && self.end + 1 == self.total
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }

    /// Parse an upstream `Content-Range: bytes start-end/total` (total must be known).
    pub fn from_content_range(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        let total: u64 = total.trim().parse().ok()?;
        (start <= end && end < total).then_some(RangeWindow { start, end, total })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    /// Window to request upstream; `None` means the whole resource without a `Range` header.
    pub window: Option<RangeWindow>,
    /// Whether the client should see `206 Partial Content`.
    pub partial: bool,
}

impl RangePlan {
    pub fn upstream_range(&self) -> Option<String> {
        self.window.map(|w| w.range_header())
    }
}

pub fn plan(
    client: Option<ByteRange>,
    probe: &ProbeResult,
    max_chunk_size: u64,
) -> Result<RangePlan, GatewayError> {
    let total = probe.content_length;

    if !probe.accepts_ranges || total == 0 {
        // Non-seekable for this request: one full-body attempt, plain 200.
        return Ok(RangePlan {
            window: None,
            partial: false,
        });
    }

    let (start, requested_end) = match client {
        Some(range) => range
            .resolve(total)
            .ok_or(GatewayError::RangeNotSatisfiable { total })?,
        None => (0, total - 1),
    };

    let chunk_end = start.saturating_add(max_chunk_size.max(1) - 1);
    let window = RangeWindow {
        start,
        end: requested_end.min(chunk_end),
        total,
    };

    Ok(RangePlan {
        window: Some(window),
        partial: client.is_some() || !window.covers_whole(),
    })
}
