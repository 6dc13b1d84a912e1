//! Per-request observation hooks.
//!
//! A [`RequestTrace`] observes the phases of a request without being able
//! to change them. Every method has a no-op default, so an observer
//! implements only what it cares about and the default observer costs
//! nothing. The one exception is [`got_1xx_response`], which may abort
//! the request by returning an error.
//!
//! For a single request the callbacks fire in a fixed order and are never
//! interleaved; across requests nothing is promised.
//!
//! [`got_1xx_response`]: RequestTrace::got_1xx_response

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::headers::Headers;

/// What the manager hands to [`RequestTrace::got_connection`].
#[derive(Debug, Clone, Copy)]
pub struct GotConnectionInfo {
    /// Stable identity of the connection ([`Connection::id`]).
    ///
    /// [`Connection::id`]: crate::connection::Connection::id
    pub conn_id: u64,
    /// Whether the connection came from the idle pool.
    pub reused: bool,
    /// How long it sat idle, when `reused` is true.
    pub idle_for: Option<Duration>,
}

/// Observer for the phases of a single request.
pub trait RequestTrace: Send + Sync {
    /// A connection is about to be checked out or dialed.
    fn get_connection(&self) {}

    /// A connection was obtained.
    fn got_connection(&self, info: GotConnectionInfo) {
        let _ = info;
    }

    /// The connection went back to the idle pool after this request.
    fn put_idle_connection(&self) {}

    /// The first byte of the response arrived.
    fn got_first_response_byte(&self) {}

    /// A `100 Continue` interim response arrived.
    fn got_100_continue(&self) {}

    /// Any 1xx interim response arrived (including 100). Returning an
    /// error aborts the request.
    fn got_1xx_response(&self, code: u16, headers: &Headers) -> Result<(), ErrorKind> {
        let _ = (code, headers);
        Ok(())
    }

    /// Host name resolution is starting.
    fn dns_start(&self, host: &str) {
        let _ = host;
    }

    /// Host name resolution finished.
    fn dns_done(&self, addrs: &[SocketAddr], error: Option<&std::io::Error>) {
        let _ = (addrs, error);
    }

    /// A TCP connect attempt is starting.
    fn connect_start(&self, addr: SocketAddr) {
        let _ = addr;
    }

    /// The TCP connect attempt finished.
    fn connect_done(&self, addr: SocketAddr, error: Option<&std::io::Error>) {
        let _ = (addr, error);
    }

    /// The TLS handshake is starting.
    fn tls_handshake_start(&self) {}

    /// The TLS handshake finished.
    fn tls_handshake_done(&self, error: Option<&std::io::Error>) {
        let _ = error;
    }

    /// One request header field was serialised.
    fn wrote_header_field(&self, name: &str, value: &str) {
        let _ = (name, value);
    }

    /// The whole request header block was serialised.
    fn wrote_headers(&self) {}

    /// The client is pausing before the body, waiting for `100 Continue`.
    fn wait_100_continue(&self) {}

    /// The request (headers and body) is fully written.
    fn wrote_request(&self, error: Option<&ErrorKind>) {
        let _ = error;
    }
}

/// The observer that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrace;

impl RequestTrace for NoopTrace {}
