//! One logical HTTP exchange: request, bounded redirects, response classification.
//!
//! Redirects are followed by hand rather than by the client so the hop count can be
//! reported as [`StatusCode::TooManyRedirects`] and permanent moves can be surfaced to
//! the caller.

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Response, StatusCode as HttpStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::StopRequest;
use crate::status::StatusCode;

pub struct Connection {
    client: Client,
    max_redirects: u32,
}

impl Connection {
    pub fn new(config: &EngineConfig) -> Result<Self, StopRequest> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(config.headers.clone())
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_deflate();

        if !config.connect_timeout.is_zero() {
            builder = builder.connect_timeout(config.connect_timeout);
        }

        if !config.read_timeout.is_zero() {
            builder = builder.read_timeout(config.read_timeout);
        }

        if let Some(proxy_config) = &config.proxy {
            let proxy = proxy_config
                .build()
                .map_err(|e| StopRequest::with_cause(StatusCode::UnknownError, e))?;
            builder = builder.proxy(proxy);
            debug!(proxy_url = %proxy_config.url, "Using configured proxy");
        }

        let client = builder.build().map_err(|e| {
            StopRequest::with_message(StatusCode::UnknownError, "Unable to create TLS context")
                .caused_by(e)
        })?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
        })
    }

    /// Parses `url`, accepting only http and https.
    pub fn parse_url(url: &str) -> Result<Url, StopRequest> {
        let parsed = Url::parse(url).map_err(|e| {
            StopRequest::with_message(StatusCode::BadRequest, format!("Invalid URL {url}: {e}"))
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(StopRequest::with_message(
                StatusCode::BadRequest,
                format!("Unsupported URL scheme: {scheme}"),
            )),
        }
    }

    /// Sends a GET for `url` with `headers`, following up to `max_redirects` hops.
    pub async fn execute(
        &self,
        url: &str,
        headers: HeaderMap,
        token: &CancellationToken,
    ) -> Result<Exchange, StopRequest> {
        let mut current = Self::parse_url(url)?;
        let ranged = headers.contains_key(header::RANGE);
        let mut permanent_url = None;
        let mut chain_permanent = true;
        let mut hops = 0u32;

        loop {
            let response = self.send(&current, &headers, token).await?;
            let status = response.status();

            if is_redirect(status) {
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    return Err(StopRequest::unhandled_http(
                        status.as_u16(),
                        status.canonical_reason(),
                    ));
                };

                if hops >= self.max_redirects {
                    return Err(StopRequest::with_message(
                        StatusCode::TooManyRedirects,
                        format!("Too many redirects (limit {})", self.max_redirects),
                    ));
                }
                hops += 1;

                let next = current.join(location).map_err(|e| {
                    StopRequest::with_message(
                        StatusCode::BadRequest,
                        format!("Invalid redirect location {location}: {e}"),
                    )
                })?;
                if !matches!(next.scheme(), "http" | "https") {
                    return Err(StopRequest::with_message(
                        StatusCode::BadRequest,
                        format!("Unsupported redirect scheme: {}", next.scheme()),
                    ));
                }

                chain_permanent &= matches!(
                    status,
                    HttpStatus::MOVED_PERMANENTLY | HttpStatus::PERMANENT_REDIRECT
                );
                if chain_permanent {
                    permanent_url = Some(next.clone());
                }

                debug!(from = %current, to = %next, status = status.as_u16(), "Following redirect");
                current = next;
                continue;
            }

            classify(status, ranged)?;
            return Ok(Exchange {
                url: current,
                permanent_url,
                response,
            });
        }
    }

    async fn send(
        &self,
        url: &Url,
        headers: &HeaderMap,
        token: &CancellationToken,
    ) -> Result<Response, StopRequest> {
        let request = self.client.get(url.clone()).headers(headers.clone());
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(StopRequest::cancelled()),
            result = request.send() => result.map_err(map_transport_error),
        }
    }
}

fn is_redirect(status: HttpStatus) -> bool {
    matches!(
        status,
        HttpStatus::MOVED_PERMANENTLY
            | HttpStatus::FOUND
            | HttpStatus::SEE_OTHER
            | HttpStatus::TEMPORARY_REDIRECT
            | HttpStatus::PERMANENT_REDIRECT
    )
}

fn classify(status: HttpStatus, ranged: bool) -> Result<(), StopRequest> {
    match status {
        HttpStatus::OK => Ok(()),
        HttpStatus::PARTIAL_CONTENT if ranged => Ok(()),
        HttpStatus::PARTIAL_CONTENT => Err(StopRequest::with_message(
            StatusCode::CannotResume,
            "Received partial content for a full request",
        )),
        HttpStatus::PRECONDITION_FAILED => {
            Err(StopRequest::with_message(StatusCode::CannotResume, "Precondition failed"))
        }
        HttpStatus::INTERNAL_SERVER_ERROR => Err(server_error(StatusCode::InternalServerError, status)),
        HttpStatus::SERVICE_UNAVAILABLE => Err(server_error(StatusCode::ServiceUnavailable, status)),
        other => Err(StopRequest::unhandled_http(other.as_u16(), other.canonical_reason())),
    }
}

fn server_error(code: StatusCode, status: HttpStatus) -> StopRequest {
    warn!(status = status.as_u16(), "Server error");
    StopRequest::with_message(
        code,
        format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        ),
    )
}

pub(crate) fn map_transport_error(error: reqwest::Error) -> StopRequest {
    let status = if error.is_builder() {
        StatusCode::BadRequest
    } else if error.is_redirect() {
        StatusCode::TooManyRedirects
    } else {
        StatusCode::HttpDataError
    };
    StopRequest::with_cause(status, error)
}

/// Parses the start of `bytes <first>-<last>/<total>`.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, _total) = range.split_once('/')?;
    let (first, last) = span.split_once('-')?;
    let first = first.trim().parse::<u64>().ok()?;
    let last = last.trim().parse::<u64>().ok()?;
    (first <= last).then_some(first)
}

/// A classified, successful response.
#[derive(Debug)]
pub struct Exchange {
    /// Effective URL after redirects.
    pub url: Url,
    /// Set when every hop was a permanent redirect.
    pub permanent_url: Option<Url>,
    response: Response,
}

impl Exchange {
    pub fn status(&self) -> HttpStatus {
        self.response.status()
    }

    pub fn is_partial(&self) -> bool {
        self.response.status() == HttpStatus::PARTIAL_CONTENT
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.response.headers().contains_key(name)
    }

    /// `Content-Length` as sent, -1 when absent or unparseable.
    pub fn content_length(&self) -> i64 {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|len| *len >= 0)
            .unwrap_or(-1)
    }

    /// First byte position announced by `Content-Range`.
    pub fn content_range_start(&self) -> Option<u64> {
        self.header(header::CONTENT_RANGE.as_str())
            .and_then(parse_content_range_start)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        self.response.bytes_stream()
    }
}
