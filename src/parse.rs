//! Line-oriented reading and head parsing.
//!
//! Everything above the body is CRLF-framed: the status line, each header
//! line, chunk-size lines, and trailers. [`read_line`] is the single
//! primitive under all of them; it reads through the connection's
//! pushback buffer and pushes any overshoot back, so the body bytes that
//! follow a header block are never lost.

use bytes::{Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::headers::Headers;
use crate::response::{HttpVersion, Status};

/// Longest permitted status or header line, in bytes before the LF.
pub(crate) const MAX_LINE: usize = 4096;

/// Read one line: bytes up to the first LF, with a single trailing CR
/// stripped. Bytes past the LF are pushed back for the next read.
///
/// Fails with [`ErrorKind::IncompleteHeaders`] on EOF before any LF and
/// with [`ErrorKind::OverlongHeaders`] once more than [`MAX_LINE`] bytes
/// accumulate without one.
pub(crate) fn read_line(conn: &mut Connection) -> Result<Bytes, ErrorKind> {
    let mut acc = BytesMut::new();
    loop {
        let mut chunk = conn.read()?;
        if chunk.is_empty() {
            return Err(ErrorKind::IncompleteHeaders);
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if acc.len() + pos > MAX_LINE {
                    return Err(ErrorKind::OverlongHeaders);
                }
                let rest = chunk.split_off(pos + 1);
                conn.unread(rest)?;
                chunk.truncate(pos);
                let line = if acc.is_empty() {
                    chunk
                } else {
                    acc.extend_from_slice(&chunk);
                    acc.freeze()
                };
                return Ok(strip_cr(line));
            }
            None => {
                acc.extend_from_slice(&chunk);
                if acc.len() > MAX_LINE {
                    return Err(ErrorKind::OverlongHeaders);
                }
            }
        }
    }
}

fn strip_cr(mut line: Bytes) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line
}

/// Discard lines until a blank one. Used to skip informational response
/// header blocks and the CONNECT response body.
pub(crate) fn drop_till_blank_line(conn: &mut Connection) -> Result<(), ErrorKind> {
    loop {
        if read_line(conn)?.is_empty() {
            return Ok(());
        }
    }
}

/// Parse `HTTP/maj.min code reason`.
pub(crate) fn parse_status_line(line: &Bytes) -> Result<(HttpVersion, Status), ErrorKind> {
    let invalid = || ErrorKind::InvalidStatusLine(line.clone());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;

    let mut parts = text.splitn(3, ' ');
    let proto = parts.next().ok_or_else(invalid)?;
    let code = parts.next().ok_or_else(invalid)?;
    let reason = parts.next().unwrap_or("");

    let version = proto.strip_prefix("HTTP/").ok_or_else(invalid)?;
    let (major, minor) = version.split_once('.').ok_or_else(invalid)?;
    let version = HttpVersion {
        major: major.parse().map_err(|_| invalid())?,
        minor: minor.parse().map_err(|_| invalid())?,
    };

    if code.len() != 3 {
        return Err(invalid());
    }
    let code: u16 = code.parse().map_err(|_| invalid())?;

    Ok((
        version,
        Status {
            code,
            reason: reason.to_string(),
        },
    ))
}

/// Parse `Name: value`, trimming optional whitespace around the value.
pub(crate) fn parse_header_line(line: &Bytes) -> Result<(String, String), ErrorKind> {
    let invalid = || ErrorKind::InvalidHeader(line.clone());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let (name, value) = text.split_once(':').ok_or_else(invalid)?;
    if name.is_empty() || name.contains(' ') {
        return Err(invalid());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Read header lines until the blank line that ends the block.
pub(crate) fn read_header_block(conn: &mut Connection) -> Result<Headers, ErrorKind> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(conn)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = parse_header_line(&line)?;
        headers.push(name, value);
    }
}
