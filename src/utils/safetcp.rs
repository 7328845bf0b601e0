//! Safe TCP bind/connect/read/write helper functions.
//!
//! All dfstore channels speak the same framing: a single UTF-8 header line
//! terminated by `'\n'`, optionally followed by exactly as many raw payload
//! bytes as the header declares. Every helper here bounds its wait with a
//! timeout so that an unresponsive peer surfaces as an error instead of
//! hanging the calling task.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::DfsError;

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Maximum length in bytes of a header line, including the terminator.
pub const MAX_HEADER_LEN: usize = 4096;

/// Granularity of timed payload writes.
const WRITE_SLICE: usize = 64 * 1024;

/// Granularity of payload reads. The buffer grows by at most this much per
/// read, so a declared length is never allocated ahead of the bytes.
const READ_SLICE: usize = 64 * 1024;

/// Reads one header line from `conn_read`. Returns:
///   - `Ok(Some(line))` with the trailing `"\n"` (and `"\r"`) stripped
///   - `Ok(None)` if the peer closed the connection before sending anything
///   - `Err(err)` on I/O error, timeout, invalid UTF-8, or a line longer than
///     `MAX_HEADER_LEN`
///
/// A line cut short by EOF is accepted as-is when `allow_eof_terminator`
/// is true (one-shot node messages are not required to carry `'\n'`).
pub(crate) async fn read_header_line<Conn>(
    conn_read: &mut Conn,
    io_timeout: Duration,
    allow_eof_terminator: bool,
) -> Result<Option<String>, DfsError>
where
    Conn: AsyncBufRead + Unpin,
{
    let mut line_buf = Vec::with_capacity(128);
    let mut limited = (&mut *conn_read).take(MAX_HEADER_LEN as u64);
    let n = time::timeout(io_timeout, limited.read_until(b'\n', &mut line_buf))
        .await??;

    if n == 0 {
        return Ok(None);
    }
    if line_buf.last() == Some(&b'\n') {
        line_buf.pop();
    } else if n >= MAX_HEADER_LEN {
        return Err(DfsError::msg(format!(
            "header line exceeds {} bytes",
            MAX_HEADER_LEN
        )));
    } else if !allow_eof_terminator {
        return Err(DfsError::msg("connection closed mid-header"));
    }
    if line_buf.last() == Some(&b'\r') {
        line_buf.pop();
    }

    Ok(Some(String::from_utf8(line_buf)?))
}

/// Reads up to `len` payload bytes from `conn_read`, stopping early if the
/// peer closes the connection or goes silent for longer than `io_timeout`.
/// Only genuine I/O errors are returned as `Err`; callers compare the length
/// of what came back against what they expected.
pub(crate) async fn read_up_to<Conn>(
    conn_read: &mut Conn,
    len: usize,
    io_timeout: Duration,
) -> Result<Bytes, DfsError>
where
    Conn: AsyncBufRead + Unpin,
{
    let mut payload = BytesMut::with_capacity(len.min(READ_SLICE));
    while payload.len() < len {
        let want = (len - payload.len()).min(READ_SLICE);
        payload.reserve(want);
        let mut limited = (&mut *conn_read).take(want as u64);
        match time::timeout(io_timeout, limited.read_buf(&mut payload)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(payload.freeze())
}

/// Reads exactly `len` payload bytes from `conn_read`. Any early EOF or a
/// timeout is an error; a truncated payload is never returned.
pub(crate) async fn read_payload<Conn>(
    conn_read: &mut Conn,
    len: usize,
    io_timeout: Duration,
) -> Result<Bytes, DfsError>
where
    Conn: AsyncBufRead + Unpin,
{
    let payload = read_up_to(conn_read, len, io_timeout).await?;
    if payload.len() < len {
        return Err(DfsError::msg(format!(
            "payload truncated: got {} of {} bytes",
            payload.len(),
            len
        )));
    }
    Ok(payload)
}

/// Writes a header line (terminator appended here) followed by an optional
/// payload, then flushes. Each write step is bounded by `io_timeout`, so a
/// large payload gets `io_timeout` per `WRITE_SLICE` bytes.
pub(crate) async fn write_framed<Conn>(
    conn_write: &mut Conn,
    header: &str,
    payload: Option<&[u8]>,
    io_timeout: Duration,
) -> Result<(), DfsError>
where
    Conn: AsyncWrite + Unpin,
{
    let mut header_line = Vec::with_capacity(header.len() + 1);
    header_line.extend_from_slice(header.as_bytes());
    header_line.push(b'\n');
    time::timeout(io_timeout, conn_write.write_all(&header_line)).await??;

    for slice in payload.unwrap_or_default().chunks(WRITE_SLICE) {
        time::timeout(io_timeout, conn_write.write_all(slice)).await??;
    }
    time::timeout(io_timeout, conn_write.flush()).await??;
    Ok(())
}

/// Wrapper over tokio `TcpListener` binding that provides a retrying logic.
/// Port 0 asks the OS for an ephemeral port; check `local_addr()` after.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, DfsError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bound = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                pf_warn!("binding {} failed, retrying: {}", bind_addr, err);
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Connects to `conn_addr`, failing if the connection is not established
/// within `connect_timeout`. No retrying; callers own the fallback policy.
pub(crate) async fn tcp_connect_with_timeout(
    conn_addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, DfsError> {
    let stream =
        time::timeout(connect_timeout, TcpStream::connect(conn_addr)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
