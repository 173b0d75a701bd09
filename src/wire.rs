//! Wire format of the request queue protocol.
//!
//! One TCP connection carries one ordered stream of requests from a client
//! node to the server for that node.  All multi-byte integers are
//! **big-endian**; there is no framing beyond field lengths.
//!
//! ```text
//!  client                                   server
//!    │  node id            (i64, 8 bytes)      │   once per connection
//!    │────────────────────────────────────────▶│
//!    │  connect ack        (bool, 1 byte)      │
//!    │◀────────────────────────────────────────│
//!    │  request number     (u16, 2 bytes)      │   repeated
//!    │  request payload    (handler-defined)   │
//!    │────────────────────────────────────────▶│
//!    │  ok                 (bool)              │   one per request,
//!    │  [kind  (utf), message (utf)] if !ok    │   in request order
//!    │◀────────────────────────────────────────│
//! ```
//!
//! A `utf` string is a u16 byte length followed by that many bytes of UTF-8.
//!
//! The `encode_*` functions are pure; the `read_*` / `write_*` functions do
//! the I/O on any tokio stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::request::{Request, RequestFailure};

/// Byte length of the node-id header.
pub const NODE_ID_LEN: usize = 8;

/// Byte length of a request number.
pub const REQUEST_NUMBER_LEN: usize = 2;

/// Longest string the u16 length prefix can describe.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

const TRUE: u8 = 1;
const FALSE: u8 = 0;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append a length-prefixed UTF-8 string, truncating on a char boundary if
/// it does not fit the u16 length.
pub fn encode_utf(buf: &mut Vec<u8>, s: &str) {
    let mut end = s.len().min(MAX_UTF_LEN);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&(end as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..end]);
}

/// Serialise a request frame: number followed by the request payload.
pub fn encode_request(number: u16, request: &dyn Request) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(REQUEST_NUMBER_LEN + 16);
    buf.extend_from_slice(&number.to_be_bytes());
    request.write_request(&mut buf)?;
    Ok(buf)
}

/// Serialise a response frame.
pub fn encode_response(result: &Result<(), RequestFailure>) -> Vec<u8> {
    match result {
        Ok(()) => vec![TRUE],
        Err(failure) => {
            let mut buf = Vec::with_capacity(5 + failure.kind.len() + failure.message.len());
            buf.push(FALSE);
            encode_utf(&mut buf, &failure.kind);
            encode_utf(&mut buf, &failure.message);
            buf
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub async fn read_bool<R>(r: &mut R) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(r.read_u8().await? != FALSE)
}

pub async fn read_node_id<R>(r: &mut R) -> io::Result<i64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    r.read_i64().await
}

/// Read a raw request number.  Range checking is left to the caller.
pub async fn read_request_number<R>(r: &mut R) -> io::Result<u16>
where
    R: AsyncRead + Unpin + ?Sized,
{
    r.read_u16().await
}

pub async fn read_utf<R>(r: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = r.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one response frame.
///
/// The outer `Result` is the transport; the inner one is the outcome of
/// performing the request on the server.
pub async fn read_response<R>(r: &mut R) -> io::Result<Result<(), RequestFailure>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if read_bool(r).await? {
        return Ok(Ok(()));
    }
    let kind = read_utf(r).await?;
    let message = read_utf(r).await?;
    Ok(Err(RequestFailure { kind, message }))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub async fn write_node_id<W>(w: &mut W, node_id: i64) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&node_id.to_be_bytes()).await?;
    w.flush().await
}

pub async fn write_connect_ack<W>(w: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&[TRUE]).await?;
    w.flush().await
}

pub async fn write_response<W>(w: &mut W, result: &Result<(), RequestFailure>) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&encode_response(result)).await?;
    w.flush().await
}
