//! HTTP adapter
//!
//! Thin boundary over the transport: one shared `reqwest::Client`, HEAD
//! probing for content length and range support, ranged GETs, and header
//! parsing helpers. Every send observes the caller's cancellation token and
//! optional per-request timeout.

use std::time::Duration;

use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;

/// Default User-Agent sent when the caller does not override it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36";

lazy_static! {
    /// Process-wide HTTP client shared by every request.
    pub(crate) static ref HTTP_CLIENT: Client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .tcp_nodelay(true)
        .build()
        .unwrap_or_default();
}

/// Result of a HEAD probe against a download URL.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Total size advertised by the server, if any.
    pub content_length: Option<u64>,
    /// Whether the server advertises byte-range support.
    pub supports_ranges: bool,
    /// Filename suggested via Content-Disposition.
    pub file_name: Option<String>,
    /// Content-Type header value.
    pub content_type: Option<String>,
}

/// Issues a HEAD request and extracts size, range support and the suggested
/// filename.
pub(crate) async fn probe(
    url: &str,
    user_agent: &str,
    headers: &HeaderMap,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<Probe, EngineError> {
    let response = send(Method::HEAD, url, user_agent, headers, None, timeout, token).await?;
    if !response.status().is_success() {
        return Err(EngineError::HttpStatus(response.status()));
    }

    let supports_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .map(|v| v.to_str().unwrap_or("") == "bytes")
        .unwrap_or(false);

    Ok(Probe {
        content_length: content_length_of(&response),
        supports_ranges,
        file_name: filename_from_headers(response.headers()),
        content_type: response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    })
}

/// Probes `url` with the default User-Agent and a 30 s limit. Convenience
/// entry point for callers outside the engine.
pub async fn probe_url(url: &str) -> Result<Probe, EngineError> {
    probe(
        url,
        DEFAULT_USER_AGENT,
        &HeaderMap::new(),
        Some(Duration::from_secs(30)),
        &CancellationToken::new(),
    )
    .await
}

/// Issues a bare HEAD request, returning the raw response.
pub(crate) async fn head(
    url: &str,
    user_agent: &str,
    headers: &HeaderMap,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<Response, EngineError> {
    send(Method::HEAD, url, user_agent, headers, None, timeout, token).await
}

/// Issues a GET, optionally with a `Range: bytes=start-[end]` header.
pub(crate) async fn get(
    url: &str,
    range: Option<(u64, Option<u64>)>,
    user_agent: &str,
    headers: &HeaderMap,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<Response, EngineError> {
    send(Method::GET, url, user_agent, headers, range, timeout, token).await
}

async fn send(
    method: Method,
    url: &str,
    user_agent: &str,
    headers: &HeaderMap,
    range: Option<(u64, Option<u64>)>,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<Response, EngineError> {
    let mut builder = HTTP_CLIENT
        .request(method, url)
        .header(USER_AGENT, user_agent)
        .headers(headers.clone());

    if let Some((start, end)) = range {
        let value = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        builder = builder.header(RANGE, value);
    }

    let send = builder.send();
    match timeout {
        Some(limit) => tokio::select! {
            result = send => Ok(result?),
            _ = token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(limit) => Err(EngineError::Timeout),
        },
        None => tokio::select! {
            result = send => Ok(result?),
            _ = token.cancelled() => Err(EngineError::Cancelled),
        },
    }
}

/// Total length advertised by a response: Content-Range total on a 206,
/// Content-Length otherwise.
pub(crate) fn content_length_of(response: &Response) -> Option<u64> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        // Content-Range: bytes 0-1023/146515
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| {
                let total = &s[s.rfind('/')? + 1..];
                total.parse::<u64>().ok()
            })
    } else {
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
    }
}

/// Extracts a filename from a Content-Disposition header, preferring the
/// RFC 6266 `filename*=` form. Only the final path component survives, so a
/// hostile header cannot traverse directories.
pub(crate) fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("content-disposition")?.to_str().ok()?;

    let extracted = if let Some(pos) = value.find("filename*=") {
        let rest = &value[pos + 10..];
        // Format: charset'lang'name (e.g. UTF-8''report%20final.pdf)
        rest.split(';')
            .next()
            .and_then(|part| part.split("''").nth(1))
            .map(|s| urlencoding::decode(s).unwrap_or_else(|_| s.into()).to_string())
    } else if let Some(pos) = value.find("filename=") {
        let rest = &value[pos + 9..];
        rest.split(';')
            .next()
            .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };

    extracted
        .map(|name| {
            std::path::Path::new(&name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn disposition(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-disposition",
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_filename_plain() {
        let headers = disposition("attachment; filename=\"archive.zip\"");
        assert_eq!(filename_from_headers(&headers).as_deref(), Some("archive.zip"));
    }

    #[test]
    fn test_filename_rfc6266() {
        let headers = disposition("attachment; filename*=UTF-8''report%20final.pdf");
        assert_eq!(
            filename_from_headers(&headers).as_deref(),
            Some("report final.pdf")
        );
    }

    #[test]
    fn test_filename_strips_paths() {
        let headers = disposition("attachment; filename=\"../../etc/passwd\"");
        assert_eq!(filename_from_headers(&headers).as_deref(), Some("passwd"));
    }

    #[test]
    fn test_filename_absent() {
        let headers = HeaderMap::new();
        assert_eq!(filename_from_headers(&headers), None);
    }
}
