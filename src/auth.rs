//! Challenge-response authentication for control terminals
//!
//! A terminal configured with a secret greets new connections with status
//! 107 and a body whose first 32 bytes are the challenge. The client answers
//! `auth <key>` where `key` is the hex SHA-256 of
//! `challenge \n secret \n challenge \n`, byte for byte.

use crate::error::{Result, VarnishError};
use crate::protocol::{Frame, FrameCodec, CHALLENGE_LEN, CLIS_AUTH, CLIS_OK};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

/// Answers the authentication challenge on a freshly opened connection
pub struct AuthNegotiator<'a> {
    secret: &'a str,
}

impl<'a> AuthNegotiator<'a> {
    pub fn new(secret: &'a str) -> Self {
        AuthNegotiator { secret }
    }

    /// Compute the response key for a challenge
    pub fn response_key(challenge: &str, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(challenge.as_bytes());
        hasher.update(b"\n");
        hasher.update(secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(challenge.as_bytes());
        hasher.update(b"\n");
        hex::encode(hasher.finalize())
    }

    /// Extract the challenge from a 107 greeting body
    pub fn challenge(greeting: &Frame) -> &str {
        let message = greeting.message.as_str();
        match message.char_indices().nth(CHALLENGE_LEN) {
            Some((end, _)) => &message[..end],
            None => message,
        }
    }

    /// Whether a greeting asks for authentication
    pub fn is_required(greeting: &Frame) -> bool {
        greeting.status == CLIS_AUTH
    }

    /// Send `auth <key>` for the given greeting and check the reply
    ///
    /// Returns the reply frame on success. A reply other than 200 is an
    /// `AuthenticationFailed` error carrying the status the server sent.
    pub async fn negotiate<S>(&self, stream: &mut S, codec: &FrameCodec, greeting: &Frame) -> Result<Frame>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = Self::challenge(greeting);
        let key = Self::response_key(challenge, self.secret);
        debug!("Answering authentication challenge");

        codec.write_command(stream, &format!("auth {}", key)).await?;
        let reply = codec.read_frame(stream).await?;

        if reply.status != CLIS_OK {
            error!(
                "Authentication to control terminal failed: {} {}",
                reply.status, reply.message
            );
            return Err(VarnishError::AuthenticationFailed {
                code: reply.status,
                message: reply.message,
            });
        }

        Ok(reply)
    }
}
