//! A single connection to one control terminal
//!
//! Lifecycle: open (connect, read greeting, authenticate if challenged),
//! execute any number of commands strictly in sequence, close.

use crate::auth::AuthNegotiator;
use crate::error::{Result, VarnishError};
use crate::protocol::{Frame, FrameCodec, CLIS_OK};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Address of one control terminal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

impl BackendEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BackendEndpoint {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for BackendEndpoint {
    type Err = VarnishError;

    /// Parse a `host:port` terminal entry; IPv6 hosts go in brackets
    fn from_str(terminal: &str) -> Result<Self> {
        let (host, port) = terminal
            .rsplit_once(':')
            .ok_or_else(|| VarnishError::invalid_endpoint(terminal, "expected host:port"))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(VarnishError::invalid_endpoint(terminal, "empty host"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| VarnishError::invalid_endpoint(terminal, format!("bad port: {}", e)))?;
        if port == 0 {
            return Err(VarnishError::invalid_endpoint(terminal, "port must not be 0"));
        }

        Ok(BackendEndpoint::new(host, port))
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Outcome of one command on one terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Protocol status, or a transport error code for failures below the protocol
    pub code: i32,
    pub message: String,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.code == CLIS_OK
    }

    /// Record an error in the same shape as a protocol reply
    pub fn from_error(err: &VarnishError) -> Self {
        let message = match err {
            VarnishError::AuthenticationFailed { message, .. }
            | VarnishError::UnexpectedGreeting { message, .. } => message.clone(),
            other => other.to_string(),
        };

        CommandResult {
            code: err.status_code(),
            message,
        }
    }
}

impl From<Frame> for CommandResult {
    fn from(frame: Frame) -> Self {
        CommandResult {
            code: frame.status,
            message: frame.message,
        }
    }
}

/// Per-operation socket timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl SocketTimeouts {
    /// Use the same limit for every operation
    pub fn uniform(limit: Duration) -> Self {
        SocketTimeouts {
            connect: limit,
            send: limit,
            receive: limit,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.send, self.receive)
    }
}

/// An open, authenticated connection to one control terminal
pub struct ControlConnection<S> {
    stream: S,
    codec: FrameCodec,
    label: String,
    /// Set after a transport failure; the stream position is no longer known
    broken: Option<VarnishError>,
}

impl ControlConnection<TcpStream> {
    /// Connect to a terminal and complete the greeting and authentication
    pub async fn open(endpoint: &BackendEndpoint, timeouts: SocketTimeouts, secret: &str) -> Result<Self> {
        let label = endpoint.to_string();
        debug!("Connecting to control terminal {}", label);

        let stream = match timeout(
            timeouts.connect,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(VarnishError::Timeout(format!(
                    "connect to {} did not complete within {:?}",
                    label, timeouts.connect
                )))
            }
        };
        stream.set_nodelay(true)?;

        Self::establish(stream, timeouts.codec(), secret, label).await
    }
}

impl<S> ControlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the greeting on a fresh stream and authenticate when challenged
    pub async fn establish(mut stream: S, codec: FrameCodec, secret: &str, label: String) -> Result<Self> {
        let greeting = codec.read_frame(&mut stream).await?;

        if AuthNegotiator::is_required(&greeting) {
            AuthNegotiator::new(secret)
                .negotiate(&mut stream, &codec, &greeting)
                .await?;
            info!("Authenticated to control terminal {}", label);
        } else if greeting.status != CLIS_OK {
            return Err(VarnishError::UnexpectedGreeting {
                code: greeting.status,
                message: greeting.message,
            });
        }

        Ok(ControlConnection {
            stream,
            codec,
            label,
            broken: None,
        })
    }

    /// Send one command and read its reply
    ///
    /// Never fails: protocol errors come back with the server's status,
    /// transport errors with their error code. After a transport error the
    /// connection refuses further commands, reporting the same failure.
    pub async fn execute(&mut self, command: &str) -> CommandResult {
        if let Some(err) = &self.broken {
            return CommandResult::from_error(err);
        }

        match self.exchange(command).await {
            Ok(frame) => {
                if frame.status != CLIS_OK {
                    warn!(
                        "Received status code {} running {} on {}. Full response text: {}",
                        frame.status, command, self.label, frame.message
                    );
                }
                frame.into()
            }
            Err(e) => {
                warn!("Socket error running {} on {}: {}", command, self.label, e);
                let result = CommandResult::from_error(&e);
                if !matches!(e, VarnishError::InvalidCommand(_)) {
                    self.broken = Some(e);
                }
                result
            }
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Frame> {
        self.codec.write_command(&mut self.stream, command).await?;
        self.codec.read_frame(&mut self.stream).await
    }

    /// Shut the connection down
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error closing connection to {}: {}", self.label, e);
        }
    }
}
