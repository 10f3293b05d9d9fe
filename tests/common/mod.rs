//! Mock control terminal for integration tests

#![allow(dead_code)]

use adv_varnish::auth::AuthNegotiator;
use adv_varnish::protocol::{FrameCodec, CLIS_AUTH, CLIS_OK};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub const CHALLENGE: &str = "qzbnkcsvnbrhmgvjyxktjwlbbfpnsdfu";

type Reply = Arc<dyn Fn(&str) -> (i32, String) + Send + Sync>;

/// Answers `status` with "running" and every other command with an empty 200
pub fn default_reply(command: &str) -> (i32, String) {
    if command == "status" {
        (CLIS_OK, "Child in state running".to_string())
    } else {
        (CLIS_OK, String::new())
    }
}

/// A control terminal on 127.0.0.1 that records what it receives
pub struct MockControlServer {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockControlServer {
    pub async fn start() -> Self {
        Self::start_with(None, Arc::new(default_reply)).await
    }

    pub async fn with_secret(secret: &str) -> Self {
        Self::start_with(Some(secret.to_string()), Arc::new(default_reply)).await
    }

    pub async fn start_with(secret: Option<String>, reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let server_accepts = accepts.clone();
        let server_commands = commands.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                server_accepts.fetch_add(1, Ordering::SeqCst);

                let secret = secret.clone();
                let reply = reply.clone();
                let commands = server_commands.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();

                    match &secret {
                        Some(secret) => {
                            let body = format!("{}\n\nAuthentication required.\n", CHALLENGE);
                            let _ = write
                                .write_all(&FrameCodec::encode_response(CLIS_AUTH, &body))
                                .await;

                            let Ok(Some(line)) = lines.next_line().await else {
                                return;
                            };
                            let expected = format!("auth {}", AuthNegotiator::response_key(CHALLENGE, secret));
                            if line != expected {
                                let _ = write
                                    .write_all(&FrameCodec::encode_response(
                                        CLIS_AUTH,
                                        "Authentication required.",
                                    ))
                                    .await;
                                return;
                            }
                            let _ = write
                                .write_all(&FrameCodec::encode_response(CLIS_OK, "Welcome"))
                                .await;
                        }
                        None => {
                            let _ = write
                                .write_all(&FrameCodec::encode_response(CLIS_OK, "Welcome"))
                                .await;
                        }
                    }

                    while let Ok(Some(line)) = lines.next_line().await {
                        commands.lock().unwrap().push(line.clone());
                        let (code, body) = reply(&line);
                        if write
                            .write_all(&FrameCodec::encode_response(code, &body))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });

        MockControlServer {
            addr,
            accepts,
            commands,
        }
    }

    pub fn terminal(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// An address nothing listens on
pub async fn closed_terminal() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
