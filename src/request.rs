//! Request descriptor.
//!
//! A [`Request`] is a plain record: the manager reads it, never mutates
//! it. The functional fields (predicates, policies, the trace observer)
//! are shared closures so a request can be cloned freely for retries and
//! error snapshots.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use crate::body::RequestBody;
use crate::cookie::CookieJar;
use crate::error::ErrorKind;
use crate::headers::Headers;
use crate::manager::Manager;
use crate::response::{HttpVersion, Response};
use crate::streaming::BodyReader;
use crate::trace::{NoopTrace, RequestTrace};

/// Decides whether a response body with this MIME type is decompressed.
pub type DecompressPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Names headers that are dropped when a redirect changes hosts.
pub type HeaderPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Decides what happens to an error raised while writing the request
/// body. Returning `Ok(())` swallows it so the response can still be
/// read.
pub type BodyErrorPolicy = Arc<dyn Fn(ErrorKind) -> Result<(), ErrorKind> + Send + Sync>;

/// Inspects the response before it is handed to the caller.
pub type ResponseCheck = Arc<dyn Fn(&mut Response<BodyReader>) -> Result<(), ErrorKind> + Send + Sync>;

/// An HTTP proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Full `Proxy-Authorization` value, e.g. `Basic dXNlcjpwdw==`.
    pub auth: Option<Bytes>,
}

/// Build a `Basic` credential for [`Proxy::auth`].
pub fn basic_proxy_auth(user: &str, password: &str) -> Bytes {
    let token = BASE64.encode(format!("{user}:{password}"));
    Bytes::from(format!("Basic {token}"))
}

/// How a secure request traverses its proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxySecureMode {
    /// CONNECT tunnel, then TLS to the origin.
    #[default]
    Tunnel,
    /// TLS to the proxy itself, absolute-form request target.
    Direct,
}

/// Per-request response deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutSetting {
    /// Use the manager's default.
    #[default]
    Default,
    /// No deadline.
    None,
    /// This deadline.
    After(Duration),
}

/// An immutable request descriptor.
#[derive(Clone)]
pub struct Request {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// Whether to speak TLS.
    pub secure: bool,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Path component, beginning with `/`.
    pub path: String,
    /// Query string without the `?`; empty means none.
    pub query_string: String,
    /// Headers in the order they go on the wire.
    pub headers: Headers,
    /// The request body.
    pub body: RequestBody,
    /// Proxy to route through, if any.
    pub proxy: Option<Proxy>,
    /// Pre-resolved destination address; skips DNS when present.
    pub host_address: Option<IpAddr>,
    /// Disable transparent response decoding entirely.
    pub raw_body: bool,
    /// MIME-type gate for transparent decompression.
    pub decompress: DecompressPredicate,
    /// How many redirects a follow-redirects helper may take.
    pub redirect_count: u32,
    /// Response inspection hook.
    pub check_response: ResponseCheck,
    /// Deadline for receiving status and headers.
    pub response_timeout: TimeoutSetting,
    /// Cookie jar snapshot to carry through the exchange.
    pub cookie_jar: Option<CookieJar>,
    /// Protocol version to speak.
    pub version: HttpVersion,
    /// Policy for errors raised while writing the body.
    pub on_request_body_error: BodyErrorPolicy,
    /// Execute on this manager instead of the caller's.
    pub manager: Option<Manager>,
    /// Headers dropped when a redirect changes hosts.
    pub strip_header_on_redirect: HeaderPredicate,
    /// How a secure request traverses its proxy.
    pub proxy_secure_mode: ProxySecureMode,
    /// Phase observer.
    pub trace: Arc<dyn RequestTrace>,
}

impl Request {
    /// A GET request for `host:port` with library defaults everywhere
    /// else: HTTP/1.1, insecure, empty body, transparent decompression
    /// on, ten-redirect budget, no proxy, no-op observers.
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            secure: false,
            host: host.into(),
            port,
            path: path.into(),
            query_string: String::new(),
            headers: Headers::new(),
            body: RequestBody::empty(),
            proxy: None,
            host_address: None,
            raw_body: false,
            decompress: Arc::new(|_mime: &str| true),
            redirect_count: 10,
            check_response: Arc::new(|_response: &mut Response<BodyReader>| Ok(())),
            response_timeout: TimeoutSetting::Default,
            cookie_jar: None,
            version: HttpVersion::HTTP_11,
            on_request_body_error: default_body_error_policy(),
            manager: None,
            strip_header_on_redirect: Arc::new(|name: &str| name.eq_ignore_ascii_case("authorization")),
            proxy_secure_mode: ProxySecureMode::Tunnel,
            trace: Arc::new(NoopTrace),
        }
    }

    /// Set the method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Speak TLS.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the query string (without the `?`).
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query_string = query.into();
        self
    }

    /// Route through a proxy.
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the response deadline.
    pub fn with_response_timeout(mut self, timeout: TimeoutSetting) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Install a phase observer.
    pub fn with_trace(mut self, trace: Arc<dyn RequestTrace>) -> Self {
        self.trace = trace;
        self
    }

    /// The request target as it appears on the wire for the common
    /// origin-form case: path plus optional query.
    pub(crate) fn target(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string)
        }
    }

    /// A copy of this request with the body replaced by the empty body,
    /// for error values and response snapshots.
    pub(crate) fn body_stripped(&self) -> Request {
        let mut snapshot = self.clone();
        snapshot.body = RequestBody::empty();
        snapshot
    }
}

/// The default body-write policy: transport failures are swallowed (the
/// server may already have answered and closed), everything else
/// propagates.
pub(crate) fn default_body_error_policy() -> BodyErrorPolicy {
    Arc::new(|kind| match kind {
        ErrorKind::Internal(_) | ErrorKind::ConnectionClosed => Ok(()),
        other => Err(other),
    })
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("secure", &self.secure)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("proxy", &self.proxy)
            .field("version", &self.version)
            .field("redirect_count", &self.redirect_count)
            .finish_non_exhaustive()
    }
}

/// Read a proxy for the given scheme from the process environment.
///
/// Checks the conventional variable pair (`HTTPS_PROXY`/`https_proxy`
/// for secure requests, `HTTP_PROXY`/`http_proxy` otherwise) and accepts
/// `[http://][user:password@]host[:port]`.
pub fn proxy_from_env(secure: bool) -> Result<Option<Proxy>, ErrorKind> {
    let names = if secure {
        ["HTTPS_PROXY", "https_proxy"]
    } else {
        ["HTTP_PROXY", "http_proxy"]
    };
    for name in names {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => return parse_proxy(name, &value).map(Some),
            _ => {}
        }
    }
    Ok(None)
}

fn parse_proxy(name: &str, value: &str) -> Result<Proxy, ErrorKind> {
    let invalid = || ErrorKind::InvalidProxyEnvironmentVariable {
        name: name.to_string(),
        value: value.to_string(),
    };

    let rest = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))
        .unwrap_or(value);
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let (userinfo, hostport) = match rest.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(userinfo), hostport),
        None => (None, rest),
    };

    let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
        // [v6-literal] with optional :port
        let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None if after.is_empty() => 80,
            None => return Err(invalid()),
        };
        (host, port)
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (hostport, 80),
        }
    };
    if host.is_empty() {
        return Err(invalid());
    }

    let auth = match userinfo {
        None => None,
        Some(userinfo) => {
            let (user, password) = userinfo.split_once(':').ok_or_else(invalid)?;
            Some(basic_proxy_auth(user, password))
        }
    };

    Ok(Proxy {
        host: host.to_string(),
        port,
        auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_includes_query() {
        let req = Request::new("example.com", 80, "/search").with_query("q=rust");
        assert_eq!(req.target(), "/search?q=rust");
        let req = Request::new("example.com", 80, "/plain");
        assert_eq!(req.target(), "/plain");
    }

    #[test]
    fn body_stripped_resets_only_the_body() {
        let req = Request::new("example.com", 80, "/")
            .with_method("POST")
            .with_body("payload");
        let snapshot = req.body_stripped();
        assert_eq!(snapshot.method, "POST");
        assert!(matches!(snapshot.body, RequestBody::Bytes(ref b) if b.is_empty()));
    }

    #[test]
    fn body_error_policy_swallows_transport_failures() {
        let policy = default_body_error_policy();
        assert!(policy(ErrorKind::Internal(std::io::Error::other("reset"))).is_ok());
        assert!(policy(ErrorKind::ConnectionClosed).is_ok());
        assert!(
            policy(ErrorKind::WrongRequestBodyStreamSize {
                expected: 5,
                actual: 3
            })
            .is_err()
        );
    }

    #[test]
    fn proxy_parse_plain_host_port() {
        let p = parse_proxy("HTTP_PROXY", "proxy.local:3128").unwrap();
        assert_eq!(p.host, "proxy.local");
        assert_eq!(p.port, 3128);
        assert_eq!(p.auth, None);
    }

    #[test]
    fn proxy_parse_scheme_and_default_port() {
        let p = parse_proxy("HTTP_PROXY", "http://proxy.local/").unwrap();
        assert_eq!(p.host, "proxy.local");
        assert_eq!(p.port, 80);
    }

    #[test]
    fn proxy_parse_credentials() {
        let p = parse_proxy("HTTPS_PROXY", "http://user:pw@proxy.local:8080").unwrap();
        assert_eq!(p.port, 8080);
        assert_eq!(p.auth.unwrap(), basic_proxy_auth("user", "pw"));
    }

    #[test]
    fn proxy_parse_v6_literal() {
        let p = parse_proxy("HTTP_PROXY", "[::1]:8080").unwrap();
        assert_eq!(p.host, "::1");
        assert_eq!(p.port, 8080);
    }

    #[test]
    fn proxy_parse_rejects_garbage() {
        for bad in ["http://:3128", "proxy.local:notaport", "user@proxy.local"] {
            assert!(matches!(
                parse_proxy("HTTP_PROXY", bad),
                Err(ErrorKind::InvalidProxyEnvironmentVariable { .. })
            ));
        }
    }
}
