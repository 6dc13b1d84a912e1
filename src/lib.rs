//! Blocking HTTP/1.x client core.
//!
//! Provides the machinery under an HTTP client: connections with
//! pushback and idempotent close, a keyed pool that reuses idle
//! connections across requests, streaming request and response bodies
//! (chunked transfer-encoding, transparent gzip/deflate decoding), HTTP
//! CONNECT tunnelling, and a structured error taxonomy that carries the
//! in-flight request.
//!
//! Deliberately out of scope: URL parsing, redirect following, cookie
//! emission/absorption policy, and convenience wrappers. Those live a
//! layer up and consume this crate through [`Manager::perform`].
//!
//! # Architecture
//!
//! One [`Manager`] holds the idle-connection pool and the dialers. Each
//! [`Manager::perform`] call runs one request-response exchange on one
//! [`Connection`]; the returned [`Response`] streams its body through a
//! [`BodyReader`], and draining or closing that body decides whether the
//! connection goes back into the pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use wireline_http::{Manager, Request};
//!
//! let manager = Manager::default();
//! let request = Request::new("example.com", 80, "/");
//! let mut response = manager.perform(request)?;
//!
//! assert_eq!(response.status.code, 200);
//! let body = response.body.read_to_end()?;
//! # Ok::<(), wireline_http::Error>(())
//! ```
//!
//! # Concurrency
//!
//! I/O is blocking; run one request per thread. The manager and its
//! pool are `Clone + Send + Sync` and meant to be shared: reusing one
//! manager across threads is what makes connection reuse work.

pub mod body;
pub mod connection;
pub mod cookie;
pub mod dial;
pub mod error;
pub mod headers;
pub mod manager;
mod parse;
pub mod pool;
pub mod request;
pub mod response;
pub mod streaming;
pub mod trace;

pub use body::{ByteRope, GivesPopper, NeedsPopper, Popper, RequestBody};
pub use connection::{Connection, Transport};
pub use cookie::{Cookie, CookieJar};
pub use dial::{DialContext, RawDial, TcpDialer, TlsDial, TlsDialer};
pub use error::{Error, ErrorKind};
pub use headers::Headers;
pub use manager::{Manager, ManagerSettings, ProxyOverride, error_status_checker};
pub use pool::ConnKey;
pub use request::{Proxy, ProxySecureMode, Request, TimeoutSetting, basic_proxy_auth};
pub use response::{HttpVersion, Response, Status};
pub use streaming::{BodyReader, ResponseClose};
pub use trace::{GotConnectionInfo, NoopTrace, RequestTrace};
