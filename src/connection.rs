//! Bidirectional byte stream with pushback and idempotent close.
//!
//! A [`Connection`] layers two things over a [`Transport`]: a LIFO
//! pushback buffer whose contents are served before the transport is
//! consulted again, and a closed flag that makes `close` idempotent and
//! every later operation fail. The transport seam is what lets the same
//! connection type carry plain TCP, TLS, and TLS-through-a-tunnel.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::ErrorKind;

/// How many bytes a single transport read asks for.
const READ_CHUNK: usize = 16 * 1024;

/// The raw byte-stream seam underneath a [`Connection`].
///
/// Implemented for `TcpStream`, for rustls streams, and for test mocks.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means EOF.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Tear down the stream. Called at most once per connection.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Bound how long a single `read` may block. `None` blocks forever.
    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // The peer may have torn the socket down first.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A byte stream with `read` / `unread` / `write` / `close` semantics.
pub struct Connection {
    transport: Box<dyn Transport>,
    // LIFO: the last pushed segment is the next one served.
    pushback: Vec<Bytes>,
    closed: bool,
    id: u64,
}

impl Connection {
    /// Wrap a transport. The connection starts open with empty pushback.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pushback: Vec::new(),
            closed: false,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Stable identity of this connection, for tracing and tests.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next segment of bytes. Serves the most recently unread segment
    /// first; otherwise performs exactly one transport read. An empty
    /// result means EOF.
    pub fn read(&mut self) -> Result<Bytes, ErrorKind> {
        if self.closed {
            return Err(ErrorKind::ConnectionClosed);
        }
        if let Some(chunk) = self.pushback.pop() {
            return Ok(chunk);
        }
        let mut buf = BytesMut::zeroed(READ_CHUNK);
        let n = self.transport.read(&mut buf).map_err(ErrorKind::Internal)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Push bytes back in front of the next read. Empty segments are
    /// dropped; non-empty segments come back in LIFO order.
    pub fn unread(&mut self, bytes: Bytes) -> Result<(), ErrorKind> {
        if self.closed {
            return Err(ErrorKind::ConnectionClosed);
        }
        if !bytes.is_empty() {
            self.pushback.push(bytes);
        }
        Ok(())
    }

    /// Send bytes. May block until the transport accepts them all.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        if self.closed {
            return Err(ErrorKind::ConnectionClosed);
        }
        self.transport.write_all(bytes).map_err(ErrorKind::Internal)
    }

    /// Close the connection. Idempotent: the transport is shut down
    /// exactly once, and every later `read`/`unread`/`write` fails with
    /// [`ErrorKind::ConnectionClosed`].
    pub fn close(&mut self) -> Result<(), ErrorKind> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pushback.clear();
        self.transport.shutdown().map_err(ErrorKind::Internal)
    }

    /// Bound how long a single read may block.
    pub fn set_read_timeout(&mut self, dur: Option<Duration>) -> Result<(), ErrorKind> {
        if self.closed {
            return Err(ErrorKind::ConnectionClosed);
        }
        self.transport
            .set_read_timeout(dur)
            .map_err(ErrorKind::Internal)
    }
}

impl Drop for Connection {
    // A connection whose last owner walks away still reaches the
    // transport teardown.
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.transport.shutdown();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("pushback_segments", &self.pushback.len())
            .finish()
    }
}

/// `io::Read`/`io::Write` view of a [`Connection`], used to run a TLS
/// session through an established CONNECT tunnel. Oversized reads land
/// back in the pushback buffer.
pub(crate) struct TunnelIo {
    pub(crate) conn: Connection,
}

impl io::Read for TunnelIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunk = self.conn.read().map_err(io::Error::other)?;
        if chunk.is_empty() {
            return Ok(0);
        }
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.conn.unread(rest).map_err(io::Error::other)?;
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl io::Write for TunnelIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    /// Scripted transport: serves canned read chunks, records writes and
    /// shutdown calls.
    pub(crate) struct MockTransport {
        reads: Vec<Bytes>,
        pub(crate) state: Arc<Mutex<MockState>>,
    }

    #[derive(Default)]
    pub(crate) struct MockState {
        pub(crate) written: Vec<u8>,
        pub(crate) shutdowns: usize,
    }

    impl MockTransport {
        /// `reads` are served front to back, then EOF forever.
        pub(crate) fn new(reads: Vec<&[u8]>) -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState::default()));
            let mut reads: Vec<Bytes> =
                reads.into_iter().map(Bytes::copy_from_slice).collect();
            reads.reverse();
            (
                Self {
                    reads,
                    state: Arc::clone(&state),
                },
                state,
            )
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop() {
                None => Ok(0),
                Some(chunk) => {
                    assert!(chunk.len() <= buf.len(), "mock chunk larger than read buffer");
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.state.lock().unwrap().written.extend_from_slice(buf);
            Ok(())
        }

        fn shutdown(&mut self) -> io::Result<()> {
            self.state.lock().unwrap().shutdowns += 1;
            Ok(())
        }

        fn set_read_timeout(&mut self, _dur: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    /// Connection over a scripted transport.
    pub(crate) fn scripted(reads: Vec<&[u8]>) -> (Connection, Arc<Mutex<MockState>>) {
        let (t, state) = MockTransport::new(reads);
        (Connection::new(Box::new(t)), state)
    }
}
