//! Streaming response bodies.
//!
//! A [`BodyReader`] yields decoded body chunks one pull at a time; an
//! empty chunk is the EOF signal, and reads past EOF stay empty. Under
//! it sits a two-stage pipeline: a framing stage that understands
//! `Content-Length`, chunked transfer-encoding, and read-until-EOF, and
//! an optional decompression stage (gzip or zlib-wrapped deflate).
//!
//! The reader and the response's [`ResponseClose`] handle share one
//! state cell. Whichever fires first settles the connection exactly
//! once: a fully drained body on a keep-alive exchange goes back to the
//! idle pool, anything else tears the connection down.

use std::io;
use std::mem;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use log::trace;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind};
use crate::parse::read_line;
use crate::pool::{ConnKey, Pool};
use crate::request::Request;

/// How many decoded bytes one decompressed pull asks for.
const DECODE_CHUNK: usize = 16 * 1024;

/// Body framing state machine.
pub(crate) enum Framing {
    /// `Content-Length: total`; `remaining` counts down to zero.
    Length { total: u64, remaining: u64 },
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkPhase),
    /// Neither: the body runs to connection EOF.
    Eof,
    /// Fully delivered; every further pull is empty.
    Done,
}

pub(crate) enum ChunkPhase {
    /// Expecting a `<hex>[;ext]` size line.
    Header,
    /// Inside a chunk's data bytes.
    Data { remaining: u64 },
    /// Expecting the CRLF that closes a chunk's data.
    Separator,
}

impl Framing {
    pub(crate) fn length(total: u64) -> Self {
        Framing::Length {
            total,
            remaining: total,
        }
    }

    pub(crate) fn chunked() -> Self {
        Framing::Chunked(ChunkPhase::Header)
    }

    fn is_done(&self) -> bool {
        matches!(self, Framing::Done)
    }

    /// Pull the next framed chunk. Empty means the body is complete.
    fn next(&mut self, conn: &mut Connection) -> Result<Bytes, ErrorKind> {
        loop {
            match self {
                Framing::Done => return Ok(Bytes::new()),
                Framing::Length { total, remaining } => {
                    if *remaining == 0 {
                        *self = Framing::Done;
                        continue;
                    }
                    let mut chunk = conn.read()?;
                    if chunk.is_empty() {
                        return Err(ErrorKind::ResponseBodyTooShort {
                            expected: *total,
                            actual: *total - *remaining,
                        });
                    }
                    if chunk.len() as u64 >= *remaining {
                        let rest = chunk.split_off(*remaining as usize);
                        conn.unread(rest)?;
                        *self = Framing::Done;
                    } else {
                        *remaining -= chunk.len() as u64;
                    }
                    return Ok(chunk);
                }
                Framing::Chunked(phase) => match phase {
                    ChunkPhase::Header => {
                        let size = read_chunk_size(conn)?;
                        if size == 0 {
                            consume_trailers(conn)?;
                            *self = Framing::Done;
                            return Ok(Bytes::new());
                        }
                        *phase = ChunkPhase::Data { remaining: size };
                    }
                    ChunkPhase::Data { remaining } => {
                        let mut chunk = conn.read()?;
                        if chunk.is_empty() {
                            return Err(ErrorKind::InvalidChunkHeaders);
                        }
                        if chunk.len() as u64 >= *remaining {
                            let rest = chunk.split_off(*remaining as usize);
                            conn.unread(rest)?;
                            *phase = ChunkPhase::Separator;
                        } else {
                            *remaining -= chunk.len() as u64;
                        }
                        return Ok(chunk);
                    }
                    ChunkPhase::Separator => {
                        consume_chunk_separator(conn)?;
                        *phase = ChunkPhase::Header;
                    }
                },
                Framing::Eof => {
                    let chunk = conn.read()?;
                    if chunk.is_empty() {
                        *self = Framing::Done;
                    }
                    return Ok(chunk);
                }
            }
        }
    }
}

/// Parse a `<hex>[;extensions]` chunk-size line.
fn read_chunk_size(conn: &mut Connection) -> Result<u64, ErrorKind> {
    let line = read_line(conn).map_err(framing_error)?;
    let text = std::str::from_utf8(&line).map_err(|_| ErrorKind::InvalidChunkHeaders)?;
    let hex = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(hex, 16).map_err(|_| ErrorKind::InvalidChunkHeaders)
}

/// The CRLF that closes a chunk's data bytes.
fn consume_chunk_separator(conn: &mut Connection) -> Result<(), ErrorKind> {
    let line = read_line(conn).map_err(framing_error)?;
    if line.is_empty() {
        Ok(())
    } else {
        Err(ErrorKind::InvalidChunkHeaders)
    }
}

/// Trailer lines after the zero chunk, up to and including the blank.
fn consume_trailers(conn: &mut Connection) -> Result<(), ErrorKind> {
    loop {
        if read_line(conn).map_err(framing_error)?.is_empty() {
            return Ok(());
        }
    }
}

fn framing_error(kind: ErrorKind) -> ErrorKind {
    match kind {
        ErrorKind::IncompleteHeaders | ErrorKind::OverlongHeaders => ErrorKind::InvalidChunkHeaders,
        other => other,
    }
}

/// Framed body bytes as an `io::Read`, for the decompressors. Framing
/// errors tunnel through `io::Error` and are unwrapped on the far side.
struct FramedSource {
    framing: Framing,
    conn: Connection,
    leftover: Bytes,
}

impl FramedSource {
    fn next_chunk(&mut self) -> Result<Bytes, ErrorKind> {
        if !self.leftover.is_empty() {
            return Ok(mem::take(&mut self.leftover));
        }
        self.framing.next(&mut self.conn)
    }
}

impl io::Read for FramedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            self.leftover = self
                .framing
                .next(&mut self.conn)
                .map_err(io::Error::other)?;
            if self.leftover.is_empty() {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.leftover.len());
        let head = self.leftover.split_to(n);
        buf[..n].copy_from_slice(&head);
        Ok(n)
    }
}

/// Which decompression the manager selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentDecoder {
    Identity,
    Gzip,
    Deflate,
}

enum Decoder {
    Plain(FramedSource),
    Gzip(MultiGzDecoder<FramedSource>),
    Deflate(ZlibDecoder<FramedSource>),
}

impl Decoder {
    fn new(source: FramedSource, content: ContentDecoder) -> Self {
        match content {
            ContentDecoder::Identity => Decoder::Plain(source),
            ContentDecoder::Gzip => Decoder::Gzip(MultiGzDecoder::new(source)),
            ContentDecoder::Deflate => Decoder::Deflate(ZlibDecoder::new(source)),
        }
    }

    fn next_chunk(&mut self) -> Result<Bytes, ErrorKind> {
        match self {
            Decoder::Plain(source) => source.next_chunk(),
            Decoder::Gzip(decoder) => read_decoded(decoder),
            Decoder::Deflate(decoder) => read_decoded(decoder),
        }
    }

    fn into_source(self) -> FramedSource {
        match self {
            Decoder::Plain(source) => source,
            Decoder::Gzip(decoder) => decoder.into_inner(),
            Decoder::Deflate(decoder) => decoder.into_inner(),
        }
    }
}

fn read_decoded<R: io::Read>(decoder: &mut R) -> Result<Bytes, ErrorKind> {
    let mut buf = BytesMut::zeroed(DECODE_CHUNK);
    match decoder.read(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Ok(buf.freeze())
        }
        // a framing error that tunnelled through, or a real inflater error
        Err(e) => Err(e.downcast::<ErrorKind>().unwrap_or_else(ErrorKind::Zlib)),
    }
}

/// Where a drained connection goes next.
struct ReuseHandle {
    pool: Pool,
    key: ConnKey,
}

enum Stage {
    Active(Decoder),
    Finished,
    Closed,
}

struct BodyShared {
    stage: Stage,
    reuse: Option<ReuseHandle>,
    request: Arc<Request>,
}

impl BodyShared {
    /// Move out of `Active`, returning the connection to the pool when
    /// the body was fully delivered on a keep-alive exchange.
    fn settle(&mut self, next: Stage) {
        let stage = mem::replace(&mut self.stage, next);
        let Stage::Active(decoder) = stage else {
            return;
        };
        let source = decoder.into_source();
        let fully_drained = source.framing.is_done() && source.leftover.is_empty();
        let mut conn = source.conn;
        if fully_drained && let Some(handle) = self.reuse.take() {
            trace!("body drained, returning connection {}", conn.id());
            if handle.pool.put(handle.key, conn) {
                self.request.trace.put_idle_connection();
            }
            return;
        }
        let _ = conn.close();
    }
}

/// Pull-based reader for the decoded response body.
pub struct BodyReader {
    shared: Arc<Mutex<BodyShared>>,
}

impl BodyReader {
    /// The next decoded chunk. Empty means EOF; reads past EOF stay
    /// empty. Reading after [`ResponseClose::close`] fails with
    /// [`ErrorKind::ConnectionClosed`].
    pub fn read_chunk(&mut self) -> Result<Bytes, Error> {
        let mut guard = self.shared.lock().unwrap();
        let pulled = match &mut guard.stage {
            Stage::Closed => Err(ErrorKind::ConnectionClosed),
            Stage::Finished => return Ok(Bytes::new()),
            Stage::Active(decoder) => decoder.next_chunk(),
        };
        match pulled {
            Ok(chunk) if chunk.is_empty() => {
                guard.settle(Stage::Finished);
                Ok(chunk)
            }
            Ok(chunk) => Ok(chunk),
            Err(kind) => {
                // the stream is poisoned; the connection cannot be reused
                guard.reuse = None;
                guard.settle(Stage::Closed);
                let request = Arc::clone(&guard.request);
                Err(kind.with_request(&request))
            }
        }
    }

    /// Drain the remaining body into one buffer.
    pub fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        loop {
            let chunk = self.read_chunk()?;
            if chunk.is_empty() {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Drain at most `limit` bytes; stops early at EOF.
    pub fn read_some(&mut self, limit: usize) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while out.len() < limit {
            let chunk = self.read_chunk()?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out.truncate(limit);
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.shared.lock().unwrap();
        let stage = match guard.stage {
            Stage::Active(_) => "active",
            Stage::Finished => "finished",
            Stage::Closed => "closed",
        };
        f.debug_struct("BodyReader").field("stage", &stage).finish()
    }
}

/// Settles the connection without draining the body. Idempotent, and
/// harmless after the body was read to EOF.
#[derive(Clone)]
pub struct ResponseClose {
    shared: Arc<Mutex<BodyShared>>,
}

impl ResponseClose {
    /// Close out the response. If the body was not fully drained the
    /// connection is destroyed rather than reused, and later reads fail.
    pub fn close(&self) -> Result<(), ErrorKind> {
        let mut guard = self.shared.lock().unwrap();
        if matches!(guard.stage, Stage::Active(_)) {
            // an undrained body may still have bytes in flight
            guard.reuse = None;
            guard.settle(Stage::Closed);
        }
        Ok(())
    }
}

/// Assemble the reader/closer pair over a connection whose head has
/// been consumed. `reuse` carries the pool slot to return to when the
/// server allowed keep-alive; `None` forces a close at settle time.
pub(crate) fn make_body(
    conn: Connection,
    framing: Framing,
    content: ContentDecoder,
    reuse: Option<(Pool, ConnKey)>,
    request: Arc<Request>,
) -> (BodyReader, ResponseClose) {
    let already_empty = match &framing {
        Framing::Length { remaining, .. } => *remaining == 0,
        Framing::Done => true,
        _ => false,
    };
    let source = FramedSource {
        framing: if already_empty { Framing::Done } else { framing },
        conn,
        leftover: Bytes::new(),
    };
    let mut shared = BodyShared {
        stage: Stage::Active(Decoder::new(source, content)),
        reuse: reuse.map(|(pool, key)| ReuseHandle { pool, key }),
        request,
    };
    if already_empty {
        // nothing to read; the connection's fate is decided now
        shared.settle(Stage::Finished);
    }
    let shared = Arc::new(Mutex::new(shared));
    (
        BodyReader {
            shared: Arc::clone(&shared),
        },
        ResponseClose { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::scripted;
    use crate::pool::ConnKey;
    use std::io::Write;
    use std::time::Duration;

    fn drain(framing: &mut Framing, conn: &mut Connection) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = framing.next(conn).unwrap();
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    #[test]
    fn length_framing_counts_down() {
        let (mut conn, _) = scripted(vec![b"hel", b"lo", b"extra"]);
        let mut framing = Framing::length(5);
        assert_eq!(drain(&mut framing, &mut conn), b"hello");
        // bytes past the frame stay on the connection
        assert_eq!(conn.read().unwrap(), "extra");
    }

    #[test]
    fn length_framing_pushes_back_overshoot() {
        let (mut conn, _) = scripted(vec![b"helloWORLD"]);
        let mut framing = Framing::length(5);
        assert_eq!(drain(&mut framing, &mut conn), b"hello");
        assert_eq!(conn.read().unwrap(), "WORLD");
    }

    #[test]
    fn length_framing_reports_truncation() {
        let (mut conn, _) = scripted(vec![b"hi"]);
        let mut framing = Framing::length(10);
        assert_eq!(framing.next(&mut conn).unwrap(), "hi");
        assert!(matches!(
            framing.next(&mut conn),
            Err(ErrorKind::ResponseBodyTooShort {
                expected: 10,
                actual: 2
            })
        ));
    }

    #[test]
    fn chunked_round_trips_request_framing() {
        // frame bytes with the request-body chunk encoder, then decode
        let body = crate::body::RequestBody::chunked(|consumer: crate::body::NeedsPopper<'_>| {
            let mut chunks: std::collections::VecDeque<&[u8]> =
                [&b"hello "[..], b"chunked", b" world"].into_iter().collect();
            let mut popper = move || -> std::io::Result<Bytes> {
                Ok(chunks.pop_front().map(Bytes::from_static).unwrap_or_default())
            };
            consumer(&mut popper)
        });
        let (mut sink, state) = scripted(vec![]);
        body.write_to(&mut sink).unwrap();
        let encoded = state.lock().unwrap().written.clone();

        let (mut conn, _) = scripted(vec![&encoded]);
        let mut framing = Framing::chunked();
        assert_eq!(drain(&mut framing, &mut conn), b"hello chunked world");
        assert!(framing.is_done());
    }

    #[test]
    fn chunked_accepts_extensions_and_trailers() {
        let wire = b"5;name=value\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\nrest";
        let (mut conn, _) = scripted(vec![wire]);
        let mut framing = Framing::chunked();
        assert_eq!(drain(&mut framing, &mut conn), b"hello");
        assert_eq!(conn.read().unwrap(), "rest");
    }

    #[test]
    fn chunked_rejects_bad_size_line() {
        let (mut conn, _) = scripted(vec![b"zz\r\nhello\r\n"]);
        let mut framing = Framing::chunked();
        assert!(matches!(
            framing.next(&mut conn),
            Err(ErrorKind::InvalidChunkHeaders)
        ));
    }

    #[test]
    fn chunked_rejects_missing_separator() {
        let (mut conn, _) = scripted(vec![b"5\r\nhelloXX\r\n0\r\n\r\n"]);
        let mut framing = Framing::chunked();
        assert_eq!(framing.next(&mut conn).unwrap(), "hello");
        assert!(matches!(
            framing.next(&mut conn),
            Err(ErrorKind::InvalidChunkHeaders)
        ));
    }

    #[test]
    fn eof_framing_reads_until_close() {
        let (mut conn, _) = scripted(vec![b"all", b"the", b"bytes"]);
        let mut framing = Framing::Eof;
        assert_eq!(drain(&mut framing, &mut conn), b"allthebytes");
        assert!(framing.is_done());
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn test_request() -> Arc<Request> {
        Arc::new(Request::new("example.com", 80, "/"))
    }

    fn reader_over(
        reads: Vec<&[u8]>,
        framing: Framing,
        content: ContentDecoder,
        reuse: Option<(Pool, ConnKey)>,
    ) -> (BodyReader, ResponseClose, std::sync::Arc<std::sync::Mutex<crate::connection::testing::MockState>>)
    {
        let (conn, state) = scripted(reads);
        let (reader, closer) = make_body(conn, framing, content, reuse, test_request());
        (reader, closer, state)
    }

    #[test]
    fn gzip_stage_decodes() {
        let compressed = gzip(b"decompress me");
        let (mut reader, _closer, _) = reader_over(
            vec![&compressed],
            Framing::length(compressed.len() as u64),
            ContentDecoder::Gzip,
            None,
        );
        assert_eq!(reader.read_to_end().unwrap(), "decompress me");
        assert!(reader.read_chunk().unwrap().is_empty());
    }

    #[test]
    fn gzip_stage_reports_garbage() {
        let (mut reader, _closer, _) = reader_over(
            vec![b"definitely not gzip"],
            Framing::length(19),
            ContentDecoder::Gzip,
            None,
        );
        let err = reader.read_chunk().unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::Zlib(_))));
    }

    fn pool_and_key() -> (Pool, ConnKey) {
        let pool = Pool::new(10, 512, Duration::from_secs(90));
        let key = ConnKey::Raw {
            host_addr: None,
            host: "example.com".to_string(),
            port: 80,
        };
        (pool, key)
    }

    #[test]
    fn drained_body_returns_connection_to_pool() {
        let (pool, key) = pool_and_key();
        let (mut reader, _closer, state) = reader_over(
            vec![b"hello"],
            Framing::length(5),
            ContentDecoder::Identity,
            Some((pool.clone(), key.clone())),
        );
        assert_eq!(reader.read_chunk().unwrap(), "hello");
        assert!(reader.read_chunk().unwrap().is_empty());
        assert_eq!(pool.idle_count_for(&key), 1);
        assert_eq!(state.lock().unwrap().shutdowns, 0);
    }

    #[test]
    fn close_before_drain_destroys_connection() {
        let (pool, key) = pool_and_key();
        let (mut reader, closer, state) = reader_over(
            vec![b"hello"],
            Framing::length(5),
            ContentDecoder::Identity,
            Some((pool.clone(), key.clone())),
        );
        closer.close().unwrap();
        closer.close().unwrap();
        assert_eq!(state.lock().unwrap().shutdowns, 1);
        assert_eq!(pool.idle_count(), 0);
        let err = reader.read_chunk().unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::ConnectionClosed)));
    }

    #[test]
    fn no_reuse_slot_closes_on_drain() {
        let (mut reader, _closer, state) = reader_over(
            vec![b"hello"],
            Framing::length(5),
            ContentDecoder::Identity,
            None,
        );
        assert_eq!(reader.read_to_end().unwrap(), "hello");
        assert_eq!(state.lock().unwrap().shutdowns, 1);
    }

    #[test]
    fn empty_body_settles_at_construction() {
        let (pool, key) = pool_and_key();
        let (mut reader, _closer, _state) = reader_over(
            vec![b"leftover for the next response"],
            Framing::length(0),
            ContentDecoder::Identity,
            Some((pool.clone(), key.clone())),
        );
        assert_eq!(pool.idle_count_for(&key), 1);
        assert!(reader.read_chunk().unwrap().is_empty());
    }

    #[test]
    fn read_some_respects_limit() {
        let (mut reader, _closer, _) = reader_over(
            vec![b"abcdefgh"],
            Framing::length(8),
            ContentDecoder::Identity,
            None,
        );
        assert_eq!(reader.read_some(3).unwrap(), "abc");
    }
}
