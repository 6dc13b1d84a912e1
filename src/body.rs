//! Request body model.
//!
//! A body is either fully buffered ([`RequestBody::Bytes`],
//! [`RequestBody::Builder`]), produced incrementally with a known length
//! ([`RequestBody::Stream`]), produced incrementally with unknown length
//! and sent chunked ([`RequestBody::ChunkedStream`]), or deferred until
//! send time ([`RequestBody::Deferred`]).
//!
//! Incremental bodies use a scoped-acquisition pattern: a [`GivesPopper`]
//! factory is handed a consumer, acquires whatever resources the stream
//! needs, lends the consumer a [`Popper`] (pull one chunk; empty = EOF),
//! and releases the resources on every exit path. A factory must
//! tolerate being invoked more than once: a request may be retried on a
//! fresh connection or replayed on redirect.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::ErrorKind;

/// Pull the next chunk of a streamed body. Empty means EOF.
pub type Popper<'a> = &'a mut dyn FnMut() -> io::Result<Bytes>;

/// Receives a popper for the duration of one send.
pub type NeedsPopper<'a> = &'a mut dyn FnMut(Popper<'_>) -> Result<(), ErrorKind>;

/// Scoped-acquisition factory for a streamed body.
pub type GivesPopper = Arc<dyn Fn(NeedsPopper<'_>) -> Result<(), ErrorKind> + Send + Sync>;

/// Effectful producer of a body, evaluated at send time.
pub type DeferredBody = Arc<dyn Fn() -> Result<RequestBody, ErrorKind> + Send + Sync>;

/// A deferred-concatenation byte builder: an ordered list of segments
/// with a precomputed total length. Appending never copies.
#[derive(Debug, Clone, Default)]
pub struct ByteRope {
    segments: Vec<Bytes>,
    len: u64,
}

impl ByteRope {
    /// An empty rope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment. Empty segments are dropped.
    pub fn push(&mut self, segment: impl Into<Bytes>) {
        let segment = segment.into();
        if !segment.is_empty() {
            self.len += segment.len() as u64;
            self.segments.push(segment);
        }
    }

    /// Append all of `other` after this rope's segments.
    pub fn append(&mut self, other: ByteRope) {
        self.len += other.len;
        self.segments.extend(other.segments);
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the rope holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segments in send order.
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Materialise into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len as usize);
        for segment in &self.segments {
            buf.extend_from_slice(segment);
        }
        buf.freeze()
    }
}

impl From<Bytes> for ByteRope {
    fn from(b: Bytes) -> Self {
        let mut rope = ByteRope::new();
        rope.push(b);
        rope
    }
}

/// How a body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// `Content-Length: n`.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// A request body.
#[derive(Clone)]
pub enum RequestBody {
    /// Fully buffered bytes.
    Bytes(Bytes),
    /// Lazily concatenated segments with known total length.
    Builder(u64, ByteRope),
    /// Produced incrementally; the total must equal the declared length.
    Stream(u64, GivesPopper),
    /// Produced incrementally with unknown length; sent chunked.
    ChunkedStream(GivesPopper),
    /// Resolved to one of the other variants at send time.
    Deferred(DeferredBody),
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Bytes(Bytes::new())
    }
}

impl RequestBody {
    /// The empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fixed-length streamed body.
    pub fn stream(
        len: u64,
        factory: impl Fn(NeedsPopper<'_>) -> Result<(), ErrorKind> + Send + Sync + 'static,
    ) -> Self {
        RequestBody::Stream(len, Arc::new(factory))
    }

    /// An unknown-length streamed body, sent chunked.
    pub fn chunked(
        factory: impl Fn(NeedsPopper<'_>) -> Result<(), ErrorKind> + Send + Sync + 'static,
    ) -> Self {
        RequestBody::ChunkedStream(Arc::new(factory))
    }

    /// A body produced by an effect at send time.
    pub fn deferred(
        producer: impl Fn() -> Result<RequestBody, ErrorKind> + Send + Sync + 'static,
    ) -> Self {
        RequestBody::Deferred(Arc::new(producer))
    }

    /// Run deferred producers until a concrete variant remains.
    pub(crate) fn resolve(self) -> Result<RequestBody, ErrorKind> {
        let mut body = self;
        loop {
            match body {
                RequestBody::Deferred(producer) => body = producer()?,
                concrete => return Ok(concrete),
            }
        }
    }

    /// Which framing headers this body requires. Callers resolve
    /// deferred bodies first.
    pub(crate) fn framing(&self) -> BodyFraming {
        match self {
            RequestBody::Bytes(b) => BodyFraming::Length(b.len() as u64),
            RequestBody::Builder(len, _) => BodyFraming::Length(*len),
            RequestBody::Stream(len, _) => BodyFraming::Length(*len),
            RequestBody::ChunkedStream(_) => BodyFraming::Chunked,
            RequestBody::Deferred(_) => unreachable!("deferred bodies are resolved before framing"),
        }
    }

    /// Write the body bytes (chunk-framed where required) to the wire.
    pub(crate) fn write_to(&self, conn: &mut Connection) -> Result<(), ErrorKind> {
        match self {
            RequestBody::Bytes(b) => {
                if b.is_empty() {
                    Ok(())
                } else {
                    conn.write(b)
                }
            }
            RequestBody::Builder(_, rope) => {
                for segment in rope.segments() {
                    conn.write(segment)?;
                }
                Ok(())
            }
            RequestBody::Stream(len, factory) => {
                let expected = *len;
                factory(&mut |popper: Popper<'_>| {
                    let mut sent: u64 = 0;
                    loop {
                        let chunk = popper().map_err(ErrorKind::Internal)?;
                        if chunk.is_empty() {
                            break;
                        }
                        sent += chunk.len() as u64;
                        conn.write(&chunk)?;
                    }
                    if sent != expected {
                        return Err(ErrorKind::WrongRequestBodyStreamSize {
                            expected,
                            actual: sent,
                        });
                    }
                    Ok(())
                })
            }
            RequestBody::ChunkedStream(factory) => factory(&mut |popper: Popper<'_>| {
                loop {
                    let chunk = popper().map_err(ErrorKind::Internal)?;
                    if chunk.is_empty() {
                        break;
                    }
                    conn.write(format!("{:x}\r\n", chunk.len()).as_bytes())?;
                    conn.write(&chunk)?;
                    conn.write(b"\r\n")?;
                }
                conn.write(b"0\r\n\r\n")
            }),
            RequestBody::Deferred(producer) => producer()?.write_to(conn),
        }
    }

    /// Monoidal concatenation: the combined body sends the bytes of
    /// `self` followed by the bytes of `other`.
    ///
    /// Two buffered bodies combine into a [`RequestBody::Builder`]; a
    /// buffered body joining a stream becomes a one-shot stream; two
    /// fixed-length streams chain into one of summed length; if either
    /// side has unknown length the result is chunked.
    ///
    /// # Panics
    ///
    /// Panics if either side is [`RequestBody::Deferred`]: a deferred
    /// body is an effect, and combining effects here would hide when
    /// they run.
    pub fn concat(self, other: RequestBody) -> RequestBody {
        use RequestBody::*;
        if matches!(self, Deferred(_)) || matches!(other, Deferred(_)) {
            panic!("deferred request bodies cannot be combined");
        }
        match (self, other) {
            (a, b) if buffered(&a) && buffered(&b) => {
                let mut rope = into_rope(a);
                rope.append(into_rope(b));
                Builder(rope.len(), rope)
            }
            (Stream(n1, g1), Stream(n2, g2)) => Stream(n1 + n2, chain_poppers(g1, g2)),
            (a, Stream(n2, g2)) if buffered(&a) => {
                let rope = into_rope(a);
                Stream(rope.len() + n2, chain_poppers(rope_popper(rope), g2))
            }
            (Stream(n1, g1), b) if buffered(&b) => {
                let rope = into_rope(b);
                Stream(n1 + rope.len(), chain_poppers(g1, rope_popper(rope)))
            }
            (a, b) => ChunkedStream(chain_poppers(into_popper(a), into_popper(b))),
        }
    }
}

fn buffered(body: &RequestBody) -> bool {
    matches!(body, RequestBody::Bytes(_) | RequestBody::Builder(..))
}

fn into_rope(body: RequestBody) -> ByteRope {
    match body {
        RequestBody::Bytes(b) => ByteRope::from(b),
        RequestBody::Builder(_, rope) => rope,
        _ => unreachable!("into_rope on unbuffered body"),
    }
}

fn into_popper(body: RequestBody) -> GivesPopper {
    match body {
        RequestBody::Stream(_, factory) | RequestBody::ChunkedStream(factory) => factory,
        buffered => rope_popper(into_rope(buffered)),
    }
}

/// One-shot popper over a rope's segments. Each factory invocation
/// starts over from the first segment.
fn rope_popper(rope: ByteRope) -> GivesPopper {
    Arc::new(move |consumer: NeedsPopper<'_>| {
        let mut queue: VecDeque<Bytes> = rope.segments().iter().cloned().collect();
        let mut popper = move || -> io::Result<Bytes> { Ok(queue.pop_front().unwrap_or_default()) };
        consumer(&mut popper)
    })
}

/// Factory that drains `first` to EOF, then `second`.
fn chain_poppers(first: GivesPopper, second: GivesPopper) -> GivesPopper {
    Arc::new(move |consumer: NeedsPopper<'_>| {
        first(&mut |p1: Popper<'_>| {
            second(&mut |p2: Popper<'_>| {
                let mut first_done = false;
                let mut chained = || -> io::Result<Bytes> {
                    if !first_done {
                        let chunk = p1()?;
                        if !chunk.is_empty() {
                            return Ok(chunk);
                        }
                        first_done = true;
                    }
                    p2()
                };
                consumer(&mut chained)
            })
        })
    })
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(b) => write!(f, "RequestBody::Bytes({} bytes)", b.len()),
            RequestBody::Builder(len, _) => write!(f, "RequestBody::Builder({len} bytes)"),
            RequestBody::Stream(len, _) => write!(f, "RequestBody::Stream({len} bytes)"),
            RequestBody::ChunkedStream(_) => write!(f, "RequestBody::ChunkedStream"),
            RequestBody::Deferred(_) => write!(f, "RequestBody::Deferred"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for RequestBody {
    fn from(s: &[u8]) -> Self {
        RequestBody::Bytes(Bytes::copy_from_slice(s))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::from(s.as_bytes())
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<ByteRope> for RequestBody {
    fn from(rope: ByteRope) -> Self {
        RequestBody::Builder(rope.len(), rope)
    }
}
