//! Minimal REST client for the Box API
//!
//! Responsible for authentication and for turning transport failures and
//! non-2xx responses into [`rfs_core::Error`]s the retry classification
//! understands. Nothing here retries; that is the pacer's job.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response};
use rfs_core::{Error, HttpError, Result};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::api;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Which Box host a request goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Api,
    Upload,
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    root_url: Url,
    upload_url: Url,
    token: String,
}

impl RestClient {
    pub fn new(root_url: &str, upload_url: &str, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            root_url: parse_base(root_url)?,
            upload_url: parse_base(upload_url)?,
            token: token.into(),
        })
    }

    /// Start an authenticated request to `path` on `host`
    pub fn request(&self, method: Method, host: Host, path: &str) -> Result<RequestBuilder> {
        let url = self.endpoint(host, path)?;
        Ok(self.http.request(method, url).bearer_auth(&self.token))
    }

    /// Send a request, failing on non-2xx responses
    pub async fn call(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(decode_error(response).await)
        }
    }

    /// Send a request and decode a JSON response body
    pub async fn call_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.call(request).await?;
        response.json::<T>().await.map_err(transport_error)
    }

    fn endpoint(&self, host: Host, path: &str) -> Result<Url> {
        let base = match host {
            Host::Api => &self.root_url,
            Host::Upload => &self.upload_url,
        };
        // Box paths are relative to a versioned base, e.g. /2.0/folders
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidPath(format!("{path}: {e}")))
    }
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("root_url", &self.root_url.as_str())
            .field("upload_url", &self.upload_url.as_str())
            .finish_non_exhaustive()
    }
}

fn parse_base(url: &str) -> Result<Url> {
    let with_slash = if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    };
    Url::parse(&with_slash).map_err(|e| Error::Config(format!("invalid url {url:?}: {e}")))
}

/// Classify a reqwest failure so retryable transport errors are recognised
pub(crate) fn transport_error(err: reqwest::Error) -> Error {
    if let Some(fatal) = fatal_cause(&err) {
        return fatal;
    }
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else if err.is_connect() {
        io::ErrorKind::ConnectionRefused
    } else if err.is_request() {
        io::ErrorKind::ConnectionReset
    } else if err.is_body() || err.is_decode() {
        if has_cause::<serde_json::Error>(&err) {
            return Error::General(format!("decoding response: {err}"));
        }
        // A body cut short by the server surfaces here too
        io_cause_kind(&err).unwrap_or(io::ErrorKind::UnexpectedEof)
    } else {
        return Error::Network(err.to_string());
    };
    Error::Io(io::Error::new(kind, err))
}

fn has_cause<E: StdError + 'static>(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<E>() {
            return true;
        }
        source = cause.source();
    }
    false
}

fn io_cause_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() != io::ErrorKind::Other {
                return Some(io_err.kind());
            }
        }
        source = cause.source();
    }
    None
}

// A request body read through the accounting layer may have been stopped
// by the transfer limit or a cancel, which must not look retryable
fn fatal_cause(err: &reqwest::Error) -> Option<Error> {
    let mut source = err.source();
    while let Some(cause) = source {
        let ours = cause
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
            .and_then(|inner| inner.downcast_ref::<Error>())
            .or_else(|| cause.downcast_ref::<Error>());
        match ours.map(Error::root) {
            Some(Error::MaxTransferLimitReached) => return Some(Error::MaxTransferLimitReached),
            Some(Error::Cancelled) => return Some(Error::Cancelled),
            _ => {}
        }
        source = cause.source();
    }
    None
}

/// Decode a non-2xx response into an [`HttpError`]
pub(crate) async fn decode_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    let decoded = match serde_json::from_str::<api::Error>(&body) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(status, error = %e, "Couldn't decode error response");
            api::Error::default()
        }
    };

    let message = if decoded.message.is_empty() {
        body
    } else {
        decoded.message.clone()
    };
    let mut err = HttpError::new(status, message);
    if !decoded.code.is_empty() {
        err = err.with_code(decoded.code);
    }
    err.auth_expired = status == 401 && token_expired(&headers);
    err.retry_after = retry_after(&headers);
    Error::Http(err)
}

// Box flags an expired bearer token in the WWW-Authenticate challenge
fn token_expired(headers: &HeaderMap) -> bool {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("expired_token"))
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
