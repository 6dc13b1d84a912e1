use std::io;

use bytes::Bytes;

use crate::request::Request;
use crate::response::Status;

/// Errors produced by the HTTP client.
///
/// Almost every failure is associated with the request that was in flight
/// when it happened and is reported as [`Error::Request`]. The one failure
/// that can occur before a request exists is [`Error::InvalidUrl`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// URL could not be interpreted; no request was ever constructed.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL text.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A failure while executing a request.
    ///
    /// Carries a snapshot of the originating request (with its body
    /// replaced by an empty one) alongside the failure class.
    #[error("{kind}")]
    Request {
        /// Snapshot of the request that was in flight.
        request: Box<Request>,
        /// What went wrong.
        kind: ErrorKind,
    },
}

impl Error {
    /// The failure class, when this error carries a request context.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            Error::InvalidUrl { .. } => None,
            Error::Request { kind, .. } => Some(kind),
        }
    }
}

/// Failure classes for an in-flight request.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// Non-2xx status observed by an opt-in response check. Never raised
    /// by the core itself.
    #[error("status code {}", status.code)]
    StatusCode {
        /// The offending status.
        status: Status,
        /// Up to 1 KiB of the response body, for diagnostics.
        body_prefix: Bytes,
    },

    /// A redirect chain exceeded the request's redirect budget.
    #[error("too many redirects")]
    TooManyRedirects,

    /// A status or header line exceeded 4096 bytes before its line feed.
    #[error("response headers too long")]
    OverlongHeaders,

    /// Status and headers were not received within the response deadline.
    #[error("response timeout")]
    ResponseTimeout,

    /// A new connection could not be established within the dial deadline.
    #[error("connection timeout")]
    ConnectionTimeout,

    /// Dialing a new connection failed.
    #[error("connection failure: {0}")]
    ConnectionFailure(#[source] io::Error),

    /// The received status line did not parse.
    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(Bytes),

    /// A received header line did not parse.
    #[error("invalid header: {0:?}")]
    InvalidHeader(Bytes),

    /// A user-supplied header contains CR or LF and cannot be sent.
    #[error("invalid request header: {0:?}")]
    InvalidRequestHeader(String),

    /// A transport-level failure with no more specific classification.
    #[error("internal error: {0}")]
    Internal(#[source] io::Error),

    /// The proxy refused a CONNECT tunnel.
    #[error("proxy CONNECT to {host}:{port} returned {status}")]
    ProxyConnect {
        /// Tunnel destination host.
        host: String,
        /// Tunnel destination port.
        port: u16,
        /// The proxy's status code.
        status: u16,
    },

    /// The socket was closed before any response byte arrived. On a reused
    /// connection this usually means the server dropped an idle connection,
    /// and the request is eligible for one transparent retry.
    #[error("no response data received")]
    NoResponseDataReceived,

    /// A secure request was issued on a manager with no TLS dialer.
    #[error("TLS not supported by this manager")]
    TlsNotSupported,

    /// A fixed-length streamed body produced the wrong number of bytes.
    #[error("request body stream declared {expected} bytes but produced {actual}")]
    WrongRequestBodyStreamSize {
        /// Declared Content-Length.
        expected: u64,
        /// Bytes the popper actually yielded.
        actual: u64,
    },

    /// The peer closed the connection before Content-Length bytes arrived.
    #[error("response body too short: expected {expected} bytes, got {actual}")]
    ResponseBodyTooShort {
        /// Declared Content-Length.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// Malformed chunked transfer-encoding framing.
    #[error("invalid chunk headers")]
    InvalidChunkHeaders,

    /// The connection reached EOF in the middle of a header block.
    #[error("incomplete headers")]
    IncompleteHeaders,

    /// The request names an empty or unusable destination host.
    #[error("invalid destination host: {0:?}")]
    InvalidDestinationHost(String),

    /// The streaming inflater rejected the compressed response body.
    #[error("decompression error: {0}")]
    Zlib(#[source] io::Error),

    /// A proxy environment variable was set but could not be parsed.
    #[error("invalid proxy environment variable {name}={value:?}")]
    InvalidProxyEnvironmentVariable {
        /// Variable name, e.g. `HTTPS_PROXY`.
        name: String,
        /// Its unparsable value.
        value: String,
    },

    /// Operation on a connection that has already been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Platform proxy discovery produced unusable settings.
    #[error("invalid proxy settings: {0}")]
    InvalidProxySettings(String),

    /// Checkout attempted on a manager whose pool has been shut down.
    #[error("manager closed")]
    ManagerClosed,
}

impl ErrorKind {
    /// Attach a request context, producing the public [`Error`].
    ///
    /// The snapshot carries an empty body: bodies may hold live streaming
    /// state that has no business living inside an error value.
    pub(crate) fn with_request(self, request: &Request) -> Error {
        Error::Request {
            request: Box::new(request.body_stripped()),
            kind: self,
        }
    }
}

/// Default predicate for the single transparent retry on a reused
/// connection: true for the failure classes that typically mean the server
/// dropped a kept-alive connection between requests.
pub fn default_retryable(kind: &ErrorKind) -> bool {
    match kind {
        ErrorKind::NoResponseDataReceived
        | ErrorKind::IncompleteHeaders
        | ErrorKind::ConnectionClosed => true,
        ErrorKind::Internal(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(default_retryable(&ErrorKind::NoResponseDataReceived));
        assert!(default_retryable(&ErrorKind::IncompleteHeaders));
        assert!(default_retryable(&ErrorKind::Internal(io::Error::other(
            "reset"
        ))));
        assert!(!default_retryable(&ErrorKind::ResponseTimeout));
        assert!(!default_retryable(&ErrorKind::InvalidChunkHeaders));
    }

    #[test]
    fn display_carries_payload() {
        let kind = ErrorKind::ResponseBodyTooShort {
            expected: 10,
            actual: 2,
        };
        assert_eq!(
            kind.to_string(),
            "response body too short: expected 10 bytes, got 2"
        );
    }
}
