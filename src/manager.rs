//! Request execution.
//!
//! A [`Manager`] owns the idle-connection pool and the dialers, and
//! exposes one entry point: [`Manager::perform`]. One call is one
//! request-response exchange: resolve the proxy, check out or dial a
//! connection, run the CONNECT preface when tunnelling, write the head
//! and body, read status and headers (looping over 1xx), and hand back a
//! response whose [`BodyReader`] settles the connection when it is
//! drained or closed.
//!
//! Managers are cheap to clone and share; every clone uses the same
//! pool.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;

use crate::body::{BodyFraming, RequestBody};
use crate::connection::Connection;
use crate::dial::{DialContext, RawDial, TcpDialer, TlsDial, TlsDialer};
use crate::error::{Error, ErrorKind, default_retryable};
use crate::headers::{Headers, validate_header};
use crate::parse::{drop_till_blank_line, parse_status_line, read_header_block, read_line};
use crate::pool::{ConnKey, Pool};
use crate::request::{Proxy, ProxySecureMode, Request, TimeoutSetting, proxy_from_env};
use crate::response::{HttpVersion, Response, Status};
use crate::streaming::{BodyReader, ContentDecoder, Framing, make_body};
use crate::trace::GotConnectionInfo;

/// Rewrites every request before execution. Applied on retries too, so
/// it must be idempotent under repeated application.
pub type RequestModifier = Arc<dyn Fn(Request) -> Result<Request, ErrorKind> + Send + Sync>;

/// Rewrites every response before it reaches the caller.
pub type ResponseModifier =
    Arc<dyn Fn(Response<BodyReader>) -> Result<Response<BodyReader>, ErrorKind> + Send + Sync>;

/// Decides whether a failure on a reused connection earns one retry.
pub type RetryPredicate = Arc<dyn Fn(&ErrorKind) -> bool + Send + Sync>;

/// Manager-level proxy policy, applied per scheme.
#[derive(Clone)]
pub enum ProxyOverride {
    /// Use whatever proxy the request carries.
    FromRequest,
    /// Strip any proxy from the request.
    NoProxy,
    /// Route every request through this proxy.
    UseProxy(Proxy),
    /// Read the conventional environment variables at request time.
    FromEnv,
}

/// Pool sizes, deadlines, hooks. Plain public fields; `Default` carries
/// the library defaults.
#[derive(Clone)]
pub struct ManagerSettings {
    /// Idle connections kept per [`ConnKey`].
    pub conns_per_host: usize,
    /// Idle connections kept across all keys.
    pub max_idle_conns: usize,
    /// Idle connections older than this are reaped.
    pub idle_ttl: Duration,
    /// Default deadline from request write to headers read; a request's
    /// [`TimeoutSetting`] can override it.
    pub response_timeout: Option<Duration>,
    /// Deadline for establishing a new connection.
    pub connect_timeout: Option<Duration>,
    /// Retry policy for failures on reused connections.
    pub retryable_error: RetryPredicate,
    /// Request rewrite hook; must be idempotent.
    pub modify_request: RequestModifier,
    /// Response rewrite hook.
    pub modify_response: ResponseModifier,
    /// Proxy policy for insecure requests.
    pub proxy_insecure: ProxyOverride,
    /// Proxy policy for secure requests.
    pub proxy_secure: ProxyOverride,
    /// Enables TLS with the default dialer. Build the config (roots,
    /// ALPN) yourself and hand it over.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Replace the TCP dialer.
    pub raw_dial: Option<Arc<dyn RawDial>>,
    /// Replace the TLS dialer; takes precedence over `tls`.
    pub tls_dial: Option<Arc<dyn TlsDial>>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            conns_per_host: 10,
            max_idle_conns: 512,
            idle_ttl: Duration::from_secs(90),
            response_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(30)),
            retryable_error: Arc::new(default_retryable),
            modify_request: Arc::new(|request| Ok(request)),
            modify_response: Arc::new(|response| Ok(response)),
            proxy_insecure: ProxyOverride::FromRequest,
            proxy_secure: ProxyOverride::FromRequest,
            tls: None,
            raw_dial: None,
            tls_dial: None,
        }
    }
}

struct ManagerInner {
    pool: Pool,
    raw_dial: Arc<dyn RawDial>,
    tls_dial: Option<Arc<dyn TlsDial>>,
    response_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    retryable_error: RetryPredicate,
    modify_request: RequestModifier,
    modify_response: ResponseModifier,
    proxy_insecure: ProxyOverride,
    proxy_secure: ProxyOverride,
}

/// Executes requests over a shared pool of reusable connections.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new(ManagerSettings::default())
    }
}

impl Manager {
    /// Build a manager. Without a TLS configuration or dialer, secure
    /// requests fail with [`ErrorKind::TlsNotSupported`].
    pub fn new(settings: ManagerSettings) -> Self {
        let tls_dial = settings.tls_dial.or_else(|| {
            settings
                .tls
                .map(|config| Arc::new(TlsDialer::new(config)) as Arc<dyn TlsDial>)
        });
        Self {
            inner: Arc::new(ManagerInner {
                pool: Pool::new(
                    settings.conns_per_host,
                    settings.max_idle_conns,
                    settings.idle_ttl,
                ),
                raw_dial: settings
                    .raw_dial
                    .unwrap_or_else(|| Arc::new(TcpDialer)),
                tls_dial,
                response_timeout: settings.response_timeout,
                connect_timeout: settings.connect_timeout,
                retryable_error: settings.retryable_error,
                modify_request: settings.modify_request,
                modify_response: settings.modify_response,
                proxy_insecure: settings.proxy_insecure,
                proxy_secure: settings.proxy_secure,
            }),
        }
    }

    /// Execute one request and return the streaming response.
    pub fn perform(&self, request: Request) -> Result<Response<BodyReader>, Error> {
        let mut retried = false;
        loop {
            // re-applied on the retry attempt, hence the idempotence
            // requirement on the modifier
            let mut req = (self.inner.modify_request)(request.clone())
                .map_err(|kind| kind.with_request(&request))?;
            if req.host.is_empty() {
                return Err(ErrorKind::InvalidDestinationHost(String::new()).with_request(&req));
            }
            if let Err(kind) = self.resolve_proxy(&mut req) {
                return Err(kind.with_request(&req));
            }
            let key = conn_key(&req);
            let req = Arc::new(req);

            match self.attempt(&req, &key) {
                Ok(response) => {
                    let response = (self.inner.modify_response)(response)
                        .map_err(|kind| kind.with_request(&req))?;
                    let mut response = response;
                    (req.check_response)(&mut response)
                        .map_err(|kind| kind.with_request(&req))?;
                    return Ok(response);
                }
                Err((kind, reused)) => {
                    if reused && !retried && (self.inner.retryable_error)(&kind) {
                        debug!("retrying once on a fresh connection after: {kind}");
                        retried = true;
                        continue;
                    }
                    return Err(kind.with_request(&req));
                }
            }
        }
    }

    /// Close every idle connection and fail all further checkouts.
    /// In-flight responses keep their connections and close them on
    /// settle.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    /// Total idle connections currently pooled.
    pub fn idle_connection_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    fn resolve_proxy(&self, req: &mut Request) -> Result<(), ErrorKind> {
        let policy = if req.secure {
            &self.inner.proxy_secure
        } else {
            &self.inner.proxy_insecure
        };
        match policy {
            ProxyOverride::FromRequest => {}
            ProxyOverride::NoProxy => req.proxy = None,
            ProxyOverride::UseProxy(proxy) => req.proxy = Some(proxy.clone()),
            ProxyOverride::FromEnv => req.proxy = proxy_from_env(req.secure)?,
        }
        Ok(())
    }

    /// One try over one connection. The second tuple element reports
    /// whether that connection was reused, which gates the retry.
    fn attempt(
        &self,
        req: &Arc<Request>,
        key: &ConnKey,
    ) -> Result<Response<BodyReader>, (ErrorKind, bool)> {
        req.trace.get_connection();
        let checked_out = self.inner.pool.checkout(key).map_err(|kind| (kind, false))?;
        let (conn, reused, idle_for) = match checked_out {
            Some((conn, idle_for)) => (conn, true, Some(idle_for)),
            None => (self.dial(req, key).map_err(|kind| (kind, false))?, false, None),
        };
        req.trace.got_connection(GotConnectionInfo {
            conn_id: conn.id(),
            reused,
            idle_for,
        });
        self.exchange(req, key, conn).map_err(|kind| (kind, reused))
    }

    /// Dial a fresh connection for `key`, including the CONNECT preface
    /// and TLS upgrade for tunnelled keys.
    fn dial(&self, req: &Arc<Request>, key: &ConnKey) -> Result<Connection, ErrorKind> {
        match key {
            ConnKey::Raw {
                host_addr,
                host,
                port,
            } => self.inner.raw_dial.dial(&DialContext {
                host_addr: *host_addr,
                host,
                port: *port,
                timeout: self.inner.connect_timeout,
                trace: req.trace.as_ref(),
            }),
            ConnKey::Secure {
                host_addr,
                host,
                port,
            } => self.tls_dialer()?.dial(&DialContext {
                host_addr: *host_addr,
                host,
                port: *port,
                timeout: self.inner.connect_timeout,
                trace: req.trace.as_ref(),
            }),
            ConnKey::Proxy {
                proxy_host,
                proxy_port,
                proxy_auth,
                host,
                port,
            } => {
                let tls = self.tls_dialer()?;
                let mut conn = self.inner.raw_dial.dial(&DialContext {
                    host_addr: None,
                    host: proxy_host,
                    port: *proxy_port,
                    timeout: self.inner.connect_timeout,
                    trace: req.trace.as_ref(),
                })?;

                let mut preface = Vec::with_capacity(128);
                preface.extend_from_slice(
                    format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n").as_bytes(),
                );
                if let Some(auth) = proxy_auth {
                    preface.extend_from_slice(b"Proxy-Authorization: ");
                    preface.extend_from_slice(auth);
                    preface.extend_from_slice(b"\r\n");
                }
                preface.extend_from_slice(b"\r\n");
                conn.write(&preface)?;

                let line = read_line(&mut conn)?;
                let (_version, status) = parse_status_line(&line)?;
                drop_till_blank_line(&mut conn)?;
                if !status.is_success() {
                    debug!("proxy {proxy_host}:{proxy_port} refused CONNECT: {status}");
                    let _ = conn.close();
                    return Err(ErrorKind::ProxyConnect {
                        host: host.clone(),
                        port: *port,
                        status: status.code,
                    });
                }
                tls.upgrade(conn, host, req.trace.as_ref())
            }
        }
    }

    fn tls_dialer(&self) -> Result<&Arc<dyn TlsDial>, ErrorKind> {
        self.inner.tls_dial.as_ref().ok_or(ErrorKind::TlsNotSupported)
    }

    /// Write the request and read the response head over one connection.
    fn exchange(
        &self,
        req: &Arc<Request>,
        key: &ConnKey,
        mut conn: Connection,
    ) -> Result<Response<BodyReader>, ErrorKind> {
        let body = req.body.clone().resolve()?;
        let body_framing = body.framing();
        let deadline = self.response_deadline(req);

        let (head, fields) = build_head(req, body_framing)?;
        conn.write(&head)?;
        for (name, value) in &fields {
            req.trace.wrote_header_field(name, value);
        }
        req.trace.wrote_headers();

        let expects_continue = req.headers.has_token("expect", "100-continue");
        let mut pending_body = Some(&body);
        if expects_continue {
            req.trace.wait_100_continue();
        } else {
            self.send_body(req, &body, &mut conn)?;
            pending_body = None;
        }

        let (version, status, headers) =
            self.read_head(req, &mut conn, deadline, &mut pending_body)?;
        if deadline.is_some() {
            conn.set_read_timeout(None)?;
        }

        let server_keep_alive = if version >= HttpVersion::HTTP_11 {
            !headers.has_token("connection", "close")
        } else {
            headers.has_token("connection", "keep-alive")
        };
        let client_keep_alive = !req.headers.has_token("connection", "close");

        let framing = response_framing(&req.method, &status, &headers)?;
        let reusable =
            server_keep_alive && client_keep_alive && !matches!(framing, Framing::Eof);
        let reuse = reusable.then(|| (self.inner.pool.clone(), key.clone()));
        let content = content_decoder(req, &headers);

        let (reader, closer) = make_body(conn, framing, content, reuse, Arc::clone(req));
        Ok(Response {
            status,
            version,
            headers,
            body: reader,
            cookie_jar: req.cookie_jar.clone(),
            closer,
            request: Box::new(req.body_stripped()),
        })
    }

    fn response_deadline(&self, req: &Request) -> Option<Instant> {
        let timeout = match req.response_timeout {
            TimeoutSetting::Default => self.inner.response_timeout,
            TimeoutSetting::None => None,
            TimeoutSetting::After(d) => Some(d),
        };
        timeout.map(|d| Instant::now() + d)
    }

    /// Write the body, filtered through the request's error policy:
    /// a transport failure mid-body may hide a complete response that
    /// is still worth reading.
    fn send_body(
        &self,
        req: &Request,
        body: &RequestBody,
        conn: &mut Connection,
    ) -> Result<(), ErrorKind> {
        let result = match body.write_to(conn) {
            Err(kind) => (req.on_request_body_error)(kind),
            ok => ok,
        };
        req.trace.wrote_request(result.as_ref().err());
        result
    }

    /// Read status and headers, consuming 1xx interim responses until a
    /// final status arrives.
    fn read_head(
        &self,
        req: &Request,
        conn: &mut Connection,
        deadline: Option<Instant>,
        pending_body: &mut Option<&RequestBody>,
    ) -> Result<(HttpVersion, Status, Headers), ErrorKind> {
        let mut first_byte_seen = false;
        loop {
            apply_deadline(conn, deadline)?;
            if !first_byte_seen {
                let probe = conn.read().map_err(timeout_guard)?;
                if probe.is_empty() {
                    return Err(ErrorKind::NoResponseDataReceived);
                }
                req.trace.got_first_response_byte();
                first_byte_seen = true;
                conn.unread(probe)?;
            }
            let line = read_line(conn).map_err(timeout_guard)?;
            let (version, status) = parse_status_line(&line)?;
            apply_deadline(conn, deadline)?;
            let headers = read_header_block(conn).map_err(timeout_guard)?;

            if status.is_informational() {
                req.trace.got_1xx_response(status.code, &headers)?;
                if status.code == 100 {
                    req.trace.got_100_continue();
                    if let Some(body) = pending_body.take() {
                        self.send_body(req, body, conn)?;
                    }
                }
                continue;
            }
            return Ok((version, status, headers));
        }
    }
}

/// An opt-in [`check_response`](Request::check_response) hook that
/// fails any non-2xx response with [`ErrorKind::StatusCode`], capturing
/// up to 1 KiB of body for diagnostics. The core itself never judges
/// status codes.
pub fn error_status_checker() -> crate::request::ResponseCheck {
    Arc::new(|response: &mut Response<BodyReader>| {
        if response.status.is_success() {
            return Ok(());
        }
        // the prefix is best-effort; an unreadable body still reports
        // the status
        let body_prefix = response.body.read_some(1024).unwrap_or_default();
        Err(ErrorKind::StatusCode {
            status: response.status.clone(),
            body_prefix,
        })
    })
}

/// The pool slot a request maps to.
fn conn_key(req: &Request) -> ConnKey {
    match (&req.proxy, req.secure) {
        (None, false) => ConnKey::Raw {
            host_addr: req.host_address,
            host: req.host.clone(),
            port: req.port,
        },
        (None, true) => ConnKey::Secure {
            host_addr: req.host_address,
            host: req.host.clone(),
            port: req.port,
        },
        // insecure requests ride the proxy as a plain keep-alive peer
        (Some(proxy), false) => ConnKey::Raw {
            host_addr: None,
            host: proxy.host.clone(),
            port: proxy.port,
        },
        (Some(proxy), true) => match req.proxy_secure_mode {
            ProxySecureMode::Tunnel => ConnKey::Proxy {
                proxy_host: proxy.host.clone(),
                proxy_port: proxy.port,
                proxy_auth: proxy.auth.clone(),
                host: req.host.clone(),
                port: req.port,
            },
            ProxySecureMode::Direct => ConnKey::Secure {
                host_addr: None,
                host: proxy.host.clone(),
                port: proxy.port,
            },
        },
    }
}

/// `host` or `host:port`, with default ports left off.
fn host_header(req: &Request) -> String {
    let default_port = if req.secure { 443 } else { 80 };
    if req.port == default_port {
        req.host.clone()
    } else {
        format!("{}:{}", req.host, req.port)
    }
}

/// The request target for the request line: origin-form normally,
/// absolute-form when talking through a proxy without a tunnel.
fn request_target(req: &Request) -> String {
    match (&req.proxy, req.secure, req.proxy_secure_mode) {
        (Some(_), false, _) => format!("http://{}{}", host_header(req), req.target()),
        (Some(_), true, ProxySecureMode::Direct) => {
            format!("https://{}{}", host_header(req), req.target())
        }
        _ => req.target(),
    }
}

fn wants_explicit_length(method: &str) -> bool {
    !(method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD"))
}

/// Serialise the request line and header block, returning the bytes and
/// the fields in wire order for tracing.
///
/// `Content-Length`/`Transfer-Encoding` always come from the body
/// variant; user copies are dropped. A missing `Accept-Encoding` becomes
/// `gzip`, and a user-supplied empty value suppresses the header
/// entirely.
fn build_head(
    req: &Request,
    framing: BodyFraming,
) -> Result<(Vec<u8>, Vec<(String, String)>), ErrorKind> {
    for (name, value) in req.headers.iter() {
        validate_header(name, value)?;
    }

    let mut fields: Vec<(String, String)> = Vec::new();
    if !req.headers.contains("host") {
        fields.push(("Host".to_string(), host_header(req)));
    }
    match framing {
        BodyFraming::Length(n) => {
            if n > 0 || wants_explicit_length(&req.method) {
                fields.push(("Content-Length".to_string(), n.to_string()));
            }
        }
        BodyFraming::Chunked => {
            fields.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        }
    }
    if !req.headers.contains("accept-encoding") {
        fields.push(("Accept-Encoding".to_string(), "gzip".to_string()));
    }
    if let (Some(proxy), false) = (&req.proxy, req.secure)
        && let Some(auth) = &proxy.auth
        && !req.headers.contains("proxy-authorization")
    {
        fields.push((
            "Proxy-Authorization".to_string(),
            String::from_utf8_lossy(auth).into_owned(),
        ));
    }
    for (name, value) in req.headers.iter() {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("accept-encoding") && value.is_empty() {
            continue;
        }
        fields.push((name.to_string(), value.to_string()));
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(request_target(req).as_bytes());
    head.extend_from_slice(format!(" {}\r\n", req.version).as_bytes());
    for (name, value) in &fields {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    Ok((head, fields))
}

/// Pick the body framing from method, status, and headers.
/// `Transfer-Encoding: chunked` wins over `Content-Length`.
fn response_framing(method: &str, status: &Status, headers: &Headers) -> Result<Framing, ErrorKind> {
    if method.eq_ignore_ascii_case("HEAD") || status.code == 204 || status.code == 304 {
        return Ok(Framing::length(0));
    }
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(Framing::chunked());
    }
    if let Some(value) = headers.get("content-length") {
        let n = value.trim().parse::<u64>().map_err(|_| {
            ErrorKind::InvalidHeader(Bytes::from(format!("Content-Length: {value}")))
        })?;
        return Ok(Framing::length(n));
    }
    Ok(Framing::Eof)
}

/// Which decompression stage to install, honouring `raw_body` and the
/// request's MIME-type predicate.
fn content_decoder(req: &Request, headers: &Headers) -> ContentDecoder {
    if req.raw_body {
        return ContentDecoder::Identity;
    }
    let Some(encoding) = headers.get("content-encoding") else {
        return ContentDecoder::Identity;
    };
    let mime = headers
        .get("content-type")
        .and_then(|value| value.split(';').next())
        .unwrap_or("")
        .trim();
    if !(req.decompress)(mime) {
        return ContentDecoder::Identity;
    }
    if encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip") {
        ContentDecoder::Gzip
    } else if encoding.eq_ignore_ascii_case("deflate") {
        ContentDecoder::Deflate
    } else {
        ContentDecoder::Identity
    }
}

fn apply_deadline(conn: &mut Connection, deadline: Option<Instant>) -> Result<(), ErrorKind> {
    if let Some(deadline) = deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ErrorKind::ResponseTimeout);
        }
        conn.set_read_timeout(Some(remaining))?;
    }
    Ok(())
}

/// While the head is being read, a socket timeout is the response
/// deadline elapsing.
fn timeout_guard(kind: ErrorKind) -> ErrorKind {
    match kind {
        ErrorKind::Internal(e)
            if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
        {
            ErrorKind::ResponseTimeout
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_request() -> Request {
        Request::new("example.com", 80, "/index.html")
    }

    #[test]
    fn head_for_simple_get() {
        let (head, _) = build_head(&plain_request(), BodyFraming::Length(0)).unwrap();
        assert_eq!(
            head,
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept-Encoding: gzip\r\n\r\n"
        );
    }

    #[test]
    fn head_includes_non_default_port() {
        let req = Request::new("example.com", 8080, "/");
        let (head, _) = build_head(&req, BodyFraming::Length(0)).unwrap();
        assert!(head.starts_with(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n"));
    }

    #[test]
    fn head_for_post_carries_length() {
        let req = plain_request().with_method("POST").with_body("hello");
        let (head, _) = build_head(&req, BodyFraming::Length(5)).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
    }

    #[test]
    fn head_for_chunked_body() {
        let req = plain_request().with_method("POST");
        let (head, _) = build_head(&req, BodyFraming::Chunked).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn user_framing_headers_are_dropped() {
        let req = plain_request()
            .with_method("POST")
            .with_header("Content-Length", "999")
            .with_header("Transfer-Encoding", "chunked");
        let (head, _) = build_head(&req, BodyFraming::Length(2)).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.contains("Transfer-Encoding"));
    }

    #[test]
    fn user_host_wins() {
        let req = plain_request().with_header("Host", "other.example");
        let (head, _) = build_head(&req, BodyFraming::Length(0)).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Host: other.example\r\n"));
        assert!(!text.contains("Host: example.com"));
    }

    #[test]
    fn accept_encoding_default_and_suppression() {
        let (head, _) = build_head(&plain_request(), BodyFraming::Length(0)).unwrap();
        assert!(String::from_utf8(head).unwrap().contains("Accept-Encoding: gzip\r\n"));

        let req = plain_request().with_header("Accept-Encoding", "");
        let (head, _) = build_head(&req, BodyFraming::Length(0)).unwrap();
        assert!(!String::from_utf8(head).unwrap().contains("Accept-Encoding"));

        let req = plain_request().with_header("Accept-Encoding", "br");
        let (head, _) = build_head(&req, BodyFraming::Length(0)).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Accept-Encoding: br\r\n"));
        assert!(!text.contains("gzip"));
    }

    #[test]
    fn header_injection_is_rejected() {
        let req = plain_request().with_header("X-Evil", "a\r\nInjected: 1");
        assert!(matches!(
            build_head(&req, BodyFraming::Length(0)),
            Err(ErrorKind::InvalidRequestHeader(_))
        ));
    }

    #[test]
    fn insecure_proxy_uses_absolute_form() {
        let req = plain_request().with_proxy(Proxy {
            host: "proxy.local".to_string(),
            port: 3128,
            auth: None,
        });
        let (head, _) = build_head(&req, BodyFraming::Length(0)).unwrap();
        assert!(head.starts_with(b"GET http://example.com/index.html HTTP/1.1\r\n"));
    }

    #[test]
    fn keys_split_by_scheme_and_proxy() {
        let plain = plain_request();
        let secure = plain_request().with_secure(true);
        let proxy = Proxy {
            host: "proxy.local".to_string(),
            port: 3128,
            auth: None,
        };
        let tunneled = plain_request().with_secure(true).with_proxy(proxy.clone());
        let proxied_plain = plain_request().with_proxy(proxy.clone());

        assert!(matches!(conn_key(&plain), ConnKey::Raw { ref host, .. } if host == "example.com"));
        assert!(matches!(conn_key(&secure), ConnKey::Secure { .. }));
        assert!(matches!(
            conn_key(&tunneled),
            ConnKey::Proxy { ref proxy_host, ref host, .. }
                if proxy_host == "proxy.local" && host == "example.com"
        ));
        // the proxied insecure request pools under the proxy endpoint
        assert!(
            matches!(conn_key(&proxied_plain), ConnKey::Raw { ref host, port, .. } if host == "proxy.local" && port == 3128)
        );

        let mut direct = plain_request().with_secure(true).with_proxy(proxy);
        direct.proxy_secure_mode = ProxySecureMode::Direct;
        assert!(
            matches!(conn_key(&direct), ConnKey::Secure { ref host, .. } if host == "proxy.local")
        );
    }

    #[test]
    fn framing_prefers_chunked_over_length() {
        let ok = Status {
            code: 200,
            reason: "OK".into(),
        };
        let headers = Headers::from_pairs([
            ("Content-Length", "100"),
            ("Transfer-Encoding", "chunked"),
        ]);
        assert!(matches!(
            response_framing("GET", &ok, &headers).unwrap(),
            Framing::Chunked(_)
        ));
    }

    #[test]
    fn framing_for_head_and_no_content() {
        let ok = Status {
            code: 200,
            reason: "OK".into(),
        };
        let no_content = Status {
            code: 204,
            reason: "No Content".into(),
        };
        let headers = Headers::from_pairs([("Content-Length", "100")]);
        assert!(matches!(
            response_framing("HEAD", &ok, &headers).unwrap(),
            Framing::Length { remaining: 0, .. }
        ));
        assert!(matches!(
            response_framing("GET", &no_content, &headers).unwrap(),
            Framing::Length { remaining: 0, .. }
        ));
    }

    #[test]
    fn framing_bad_content_length_is_invalid_header() {
        let ok = Status {
            code: 200,
            reason: "OK".into(),
        };
        let headers = Headers::from_pairs([("Content-Length", "banana")]);
        assert!(matches!(
            response_framing("GET", &ok, &headers),
            Err(ErrorKind::InvalidHeader(_))
        ));
    }

    #[test]
    fn framing_without_hints_reads_to_eof() {
        let ok = Status {
            code: 200,
            reason: "OK".into(),
        };
        assert!(matches!(
            response_framing("GET", &ok, &Headers::new()).unwrap(),
            Framing::Eof
        ));
    }

    #[test]
    fn decoder_selection_honours_gates() {
        let gzip_headers = Headers::from_pairs([
            ("Content-Encoding", "gzip"),
            ("Content-Type", "text/html; charset=utf-8"),
        ]);
        let req = plain_request();
        assert_eq!(content_decoder(&req, &gzip_headers), ContentDecoder::Gzip);

        let mut raw = plain_request();
        raw.raw_body = true;
        assert_eq!(content_decoder(&raw, &gzip_headers), ContentDecoder::Identity);

        let mut picky = plain_request();
        picky.decompress = Arc::new(|mime: &str| mime == "application/json");
        assert_eq!(content_decoder(&picky, &gzip_headers), ContentDecoder::Identity);

        let deflate_headers = Headers::from_pairs([("Content-Encoding", "deflate")]);
        assert_eq!(
            content_decoder(&req, &deflate_headers),
            ContentDecoder::Deflate
        );

        let unknown = Headers::from_pairs([("Content-Encoding", "br")]);
        assert_eq!(content_decoder(&req, &unknown), ContentDecoder::Identity);
    }

    #[test]
    fn timeout_guard_maps_socket_timeouts() {
        let timed_out = ErrorKind::Internal(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout_guard(timed_out), ErrorKind::ResponseTimeout));
        let other = ErrorKind::Internal(io::Error::other("reset"));
        assert!(matches!(timeout_guard(other), ErrorKind::Internal(_)));
    }
}
