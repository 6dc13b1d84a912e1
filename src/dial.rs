//! Dialing new connections.
//!
//! The manager consumes dialers through two narrow traits: [`RawDial`]
//! for plain TCP and [`TlsDial`] for TLS, the latter both directly and
//! as an upgrade over an established CONNECT tunnel. TLS is rustls; the
//! user builds the `ClientConfig` (root certificates, ALPN) and hands it
//! over pre-built.

use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use crate::connection::{Connection, Transport, TunnelIo};
use crate::error::ErrorKind;
use crate::trace::RequestTrace;

/// What a dialer needs to know about the endpoint.
pub struct DialContext<'a> {
    /// Pre-resolved address; skips DNS when present.
    pub host_addr: Option<IpAddr>,
    /// Host name, for resolution and SNI.
    pub host: &'a str,
    /// Port.
    pub port: u16,
    /// Dial deadline.
    pub timeout: Option<Duration>,
    /// Observer for DNS/connect/handshake phases.
    pub trace: &'a dyn RequestTrace,
}

/// Produces plain TCP connections.
pub trait RawDial: Send + Sync {
    /// Establish a connection to the endpoint.
    fn dial(&self, ctx: &DialContext<'_>) -> Result<Connection, ErrorKind>;
}

/// Produces TLS connections, directly or over an existing tunnel.
pub trait TlsDial: Send + Sync {
    /// Establish a TLS connection to the endpoint.
    fn dial(&self, ctx: &DialContext<'_>) -> Result<Connection, ErrorKind>;

    /// Run a TLS handshake for `host` over an already-established
    /// connection (a CONNECT tunnel).
    fn upgrade(
        &self,
        conn: Connection,
        host: &str,
        trace: &dyn RequestTrace,
    ) -> Result<Connection, ErrorKind>;
}

/// The default TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    fn connect(&self, ctx: &DialContext<'_>) -> Result<TcpStream, ErrorKind> {
        let addrs: Vec<SocketAddr> = match ctx.host_addr {
            Some(ip) => vec![SocketAddr::new(ip, ctx.port)],
            None => {
                ctx.trace.dns_start(ctx.host);
                match (ctx.host, ctx.port).to_socket_addrs() {
                    Ok(iter) => {
                        let addrs: Vec<SocketAddr> = iter.collect();
                        ctx.trace.dns_done(&addrs, None);
                        addrs
                    }
                    Err(e) => {
                        ctx.trace.dns_done(&[], Some(&e));
                        return Err(ErrorKind::ConnectionFailure(e));
                    }
                }
            }
        };
        if addrs.is_empty() {
            return Err(ErrorKind::InvalidDestinationHost(ctx.host.to_string()));
        }

        let deadline = ctx.timeout.map(|t| Instant::now() + t);
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses to dial");
        for addr in addrs {
            ctx.trace.connect_start(addr);
            let attempt = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ErrorKind::ConnectionTimeout);
                    }
                    TcpStream::connect_timeout(&addr, remaining)
                }
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    ctx.trace.connect_done(addr, None);
                    debug!("dialed {}:{} via {addr}", ctx.host, ctx.port);
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    ctx.trace.connect_done(addr, Some(&e));
                    if e.kind() == io::ErrorKind::TimedOut {
                        return Err(ErrorKind::ConnectionTimeout);
                    }
                    last_err = e;
                }
            }
        }
        Err(ErrorKind::ConnectionFailure(last_err))
    }
}

impl RawDial for TcpDialer {
    fn dial(&self, ctx: &DialContext<'_>) -> Result<Connection, ErrorKind> {
        Ok(Connection::new(Box::new(self.connect(ctx)?)))
    }
}

/// TLS dialer over a user-supplied rustls configuration.
pub struct TlsDialer {
    config: Arc<ClientConfig>,
    tcp: TcpDialer,
}

impl TlsDialer {
    /// Wrap a pre-built rustls client configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            tcp: TcpDialer,
        }
    }

    fn session(&self, host: &str) -> Result<ClientConnection, ErrorKind> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| ErrorKind::InvalidDestinationHost(host.to_string()))?;
        ClientConnection::new(Arc::clone(&self.config), name)
            .map_err(|e| ErrorKind::ConnectionFailure(io::Error::other(e)))
    }
}

fn handshake<S: io::Read + io::Write>(
    tls: &mut ClientConnection,
    sock: &mut S,
    trace: &dyn RequestTrace,
) -> Result<(), ErrorKind> {
    trace.tls_handshake_start();
    while tls.is_handshaking() {
        if let Err(e) = tls.complete_io(sock) {
            trace.tls_handshake_done(Some(&e));
            return Err(ErrorKind::ConnectionFailure(e));
        }
    }
    trace.tls_handshake_done(None);
    Ok(())
}

impl TlsDial for TlsDialer {
    fn dial(&self, ctx: &DialContext<'_>) -> Result<Connection, ErrorKind> {
        let mut stream = self.tcp.connect(ctx)?;
        let mut tls = self.session(ctx.host)?;
        handshake(&mut tls, &mut stream, ctx.trace)?;
        Ok(Connection::new(Box::new(StreamOwned::new(tls, stream))))
    }

    fn upgrade(
        &self,
        conn: Connection,
        host: &str,
        trace: &dyn RequestTrace,
    ) -> Result<Connection, ErrorKind> {
        let mut tunnel = TunnelIo { conn };
        let mut tls = self.session(host)?;
        handshake(&mut tls, &mut tunnel, trace)?;
        Ok(Connection::new(Box::new(StreamOwned::new(tls, tunnel))))
    }
}

// Servers that drop the socket without a close_notify are routine; the
// reader treats that exactly like EOF.
fn tls_eof_as_clean(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        other => other,
    }
}

impl Transport for StreamOwned<ClientConnection, TcpStream> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tls_eof_as_clean(io::Read::read(self, buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut self.sock);
        match self.sock.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(dur)
    }
}

impl Transport for StreamOwned<ClientConnection, TunnelIo> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tls_eof_as_clean(io::Read::read(self, buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut self.sock);
        self.sock.conn.close().map_err(io::Error::other)
    }

    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.conn.set_read_timeout(dur).map_err(io::Error::other)
    }
}
