//! Frame codec for the varnish control protocol
//!
//! Requests are single lines terminated by `\n`. Every response starts with a
//! fixed 13-byte header followed by the body:
//!
//! ```text
//! 200 19      \n
//! |   |       `-- padding + newline
//! |   `---------- body length, 6 significant digits (bytes 4..10)
//! `-------------- 3-digit status code (bytes 0..3)
//! ```
//!
//! The body is `length + 1` bytes long; the extra byte is the newline that
//! terminates it. Reading a different number of bytes than the header
//! announces desynchronizes every later command on the same connection.

use crate::error::{Result, VarnishError};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Length of a response header in bytes
pub const HEADER_LEN: usize = 13;

/// Command executed successfully
pub const CLIS_OK: i32 = 200;

/// Authentication challenge; the body starts with the nonce
pub const CLIS_AUTH: i32 = 107;

/// Communication error; used for transport failures without an OS code
pub const CLIS_COMMS: i32 = 400;

/// Length of the authentication challenge at the start of a 107 body
pub const CHALLENGE_LEN: usize = 32;

/// Extra attempts allowed for a read that hits a transient condition
pub const DEFAULT_READ_RETRIES: u32 = 2;

/// Decoded response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Status code from bytes 0..3
    pub status: i32,
    /// Number of body bytes to read, including the terminating newline
    pub body_len: usize,
}

impl ResponseHeader {
    /// Decode the fixed 13-byte header
    pub fn parse(header: &[u8; HEADER_LEN]) -> Result<Self> {
        let status = parse_field(&header[0..3], "status")?;
        let declared: usize = parse_field(&header[4..10], "length")?;

        Ok(ResponseHeader {
            status,
            body_len: declared + 1,
        })
    }
}

fn parse_field<T: std::str::FromStr>(raw: &[u8], name: &str) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .map(|s| s.trim())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            VarnishError::MalformedFrame(format!(
                "{} field is not numeric: {:?}",
                name,
                String::from_utf8_lossy(raw)
            ))
        })
}

/// A complete response: status and message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: i32,
    pub message: String,
}

/// Reads and writes control-protocol frames with per-operation timeouts
#[derive(Debug, Clone)]
pub struct FrameCodec {
    send_timeout: Duration,
    receive_timeout: Duration,
    read_retries: u32,
}

impl FrameCodec {
    /// Create a codec with independent send and receive timeouts
    pub fn new(send_timeout: Duration, receive_timeout: Duration) -> Self {
        FrameCodec {
            send_timeout,
            receive_timeout,
            read_retries: DEFAULT_READ_RETRIES,
        }
    }

    /// Override how many extra attempts a transient read failure gets
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    pub fn read_retries(&self) -> u32 {
        self.read_retries
    }

    /// Encode a command line: the command followed by a single `\n`
    ///
    /// Commands containing line breaks are refused since the server would
    /// treat the remainder as a second command and answer twice.
    pub fn encode(command: &str) -> Result<Bytes> {
        if command.contains(['\n', '\r']) {
            return Err(VarnishError::InvalidCommand(format!(
                "command contains a line break: {:?}",
                command
            )));
        }

        let mut buf = BytesMut::with_capacity(command.len() + 1);
        buf.put_slice(command.as_bytes());
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }

    /// Encode a server-side response frame
    pub fn encode_response(status: i32, body: &str) -> Vec<u8> {
        let mut out = format!("{:<3} {:<8}\n", status, body.len()).into_bytes();
        out.extend_from_slice(body.as_bytes());
        out.push(b'\n');
        out
    }

    /// Write one encoded command, bounded by the send timeout
    pub async fn write_command<W>(&self, writer: &mut W, command: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = Self::encode(command)?;
        debug!("-> {}", command);

        match timeout(self.send_timeout, writer.write_all(&line)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VarnishError::Timeout(format!(
                    "send did not complete within {:?}",
                    self.send_timeout
                )))
            }
        }

        match timeout(self.send_timeout, writer.flush()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VarnishError::Timeout(format!(
                "flush did not complete within {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Read one complete frame: the 13-byte header, then `length + 1` bytes
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        self.fill(reader, &mut header, self.read_retries).await?;
        let header = ResponseHeader::parse(&header)?;

        let mut body = vec![0u8; header.body_len];
        self.fill(reader, &mut body, self.read_retries).await?;

        if body.last() == Some(&b'\n') {
            body.pop();
        }

        let message = String::from_utf8_lossy(&body).into_owned();
        debug!("<- {} ({} bytes)", header.status, message.len());

        Ok(Frame {
            status: header.status,
            message,
        })
    }

    /// Fill `buf` completely, retrying transient failures at most `retries` times
    ///
    /// Bytes received before a transient failure stay in `buf`; the next
    /// attempt continues where the previous one stopped.
    async fn fill<R>(&self, reader: &mut R, buf: &mut [u8], retries: u32) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let total = buf.len();
        let mut filled = 0;
        let mut retries_left = retries;

        while filled < total {
            let err = match timeout(self.receive_timeout, reader.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => VarnishError::IoError(format!(
                    "connection closed after {} of {} bytes",
                    filled, total
                )),
                Ok(Ok(n)) => {
                    filled += n;
                    continue;
                }
                Ok(Err(e)) => VarnishError::from(e),
                Err(_) => VarnishError::Timeout(format!("no data within {:?}", self.receive_timeout)),
            };

            if err.is_transient() && retries_left > 0 {
                retries_left -= 1;
                warn!("Transient read failure ({}), {} retries left", err, retries_left);
                continue;
            }
            return Err(err);
        }

        Ok(())
    }
}
