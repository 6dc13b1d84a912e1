//! Response record and protocol scalars.

use std::fmt;

use crate::cookie::CookieJar;
use crate::error::Error;
use crate::headers::Headers;
use crate::request::Request;
use crate::streaming::ResponseClose;

/// HTTP protocol version, e.g. `HTTP/1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl HttpVersion {
    /// `HTTP/1.0`
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    /// `HTTP/1.1`
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Status code plus reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Numeric code, e.g. 200.
    pub code: u16,
    /// Reason phrase as received; may be empty.
    pub reason: String,
}

impl Status {
    /// 1xx.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

/// A received response.
///
/// The body is parametric: the manager produces `Response<BodyReader>`,
/// and [`map_body`](Response::map_body) lets response modifiers swap in
/// anything else. Exactly one of two things must happen to every
/// response: its body is read to EOF, or [`close`](Response::close) is
/// invoked. Either settles the underlying connection (back to the idle
/// pool, or torn down); after `close` the body is no longer readable.
pub struct Response<B> {
    /// Status line contents.
    pub status: Status,
    /// Protocol version the server answered with.
    pub version: HttpVersion,
    /// Response headers in received order.
    pub headers: Headers,
    /// The response body.
    pub body: B,
    /// Cookie jar snapshot carried from the request.
    pub cookie_jar: Option<CookieJar>,
    /// Handle that settles the connection without draining the body.
    pub closer: ResponseClose,
    /// Snapshot of the originating request, body replaced by empty.
    pub request: Box<Request>,
}

impl<B> Response<B> {
    /// Replace the body, keeping everything else.
    pub fn map_body<T>(self, f: impl FnOnce(B) -> T) -> Response<T> {
        Response {
            status: self.status,
            version: self.version,
            headers: self.headers,
            body: f(self.body),
            cookie_jar: self.cookie_jar,
            closer: self.closer,
            request: self.request,
        }
    }

    /// Settle the connection without reading the rest of the body.
    /// Idempotent; also harmless after the body was fully drained.
    pub fn close(&self) -> Result<(), Error> {
        self.closer
            .close()
            .map_err(|kind| kind.with_request(&self.request))
    }
}

impl<B> fmt::Debug for Response<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        let continue_ = Status {
            code: 100,
            reason: "Continue".into(),
        };
        let ok = Status {
            code: 200,
            reason: "OK".into(),
        };
        let not_found = Status {
            code: 404,
            reason: "Not Found".into(),
        };
        assert!(continue_.is_informational());
        assert!(!continue_.is_success());
        assert!(ok.is_success());
        assert!(!not_found.is_success());
    }

    #[test]
    fn display_forms() {
        assert_eq!(HttpVersion::HTTP_11.to_string(), "HTTP/1.1");
        let s = Status {
            code: 204,
            reason: String::new(),
        };
        assert_eq!(s.to_string(), "204");
        let s = Status {
            code: 200,
            reason: "OK".into(),
        };
        assert_eq!(s.to_string(), "200 OK");
    }
}
