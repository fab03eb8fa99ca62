//! TCP transport.
//!
//! Each link is a `tokio::net::TcpStream` owned by a single background
//! **actor task**. The actor:
//!
//! - writes the credential handshake line, if a credential was supplied,
//!   before anything else;
//! - writes outbound frames one at a time, each followed by `\n`;
//! - forwards raw reads to the inbox without looking for frame boundaries
//!   (reassembly happens in the client's frame buffer);
//! - stops on server EOF, I/O error, outbox closure, or [`Link::close`].
//!
//! No other task touches the socket, so writes can never interleave.
//!
//! ## Addresses
//!
//! `tcp://host:port` or bare `host:port`. Host names are resolved on every
//! open, so a reconnect picks up DNS changes.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_trace,
    ConnectionError,
    Credential,
    Endpoint,
    KvError,
    Link,
    Result,
    Transport,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

/// Settings for [`create_tcp_transport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Identifier used in log lines.
    pub transport_id: String,

    /// Upper bound on DNS resolution plus TCP connect.
    ///
    /// Default: 10 seconds
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            transport_id: "tcp".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct TcpTransport {
    config: TcpConfig,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn transport_id(&self) -> &str {
        &self.config.transport_id
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Link> {
        let addr = parse_address(endpoint.address.as_str())?;

        log_debug!("{}: connecting to {addr}", self.config.transport_id);

        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| ConnectionError::Open(format!("{addr}: connect timed out")))?
            .map_err(|err| ConnectionError::Open(format!("{addr}: {err}")))?;

        if let Err(_err) = stream.set_nodelay(true) {
            log_debug!("{}: set_nodelay failed: {_err}", self.config.transport_id);
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        let actor = TcpLinkActor {
            transport_id: format!("{}:{addr}", self.config.transport_id),
            stream,
            credential: endpoint.credential.clone(),
            outbox_rx,
            inbox_tx,
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(actor.run());

        Ok(Link {
            outbox,
            inbox,
            shutdown,
        })
    }
}

struct TcpLinkActor {
    // ---
    transport_id: String, // for logging only
    stream: TcpStream,
    credential: Option<Credential>,
    outbox_rx: mpsc::UnboundedReceiver<Bytes>,
    inbox_tx: mpsc::Sender<Bytes>,
    shutdown: Arc<Notify>,
}

impl TcpLinkActor {
    // ---

    async fn run(self) {
        // ---
        let TcpLinkActor {
            transport_id,
            stream,
            credential,
            mut outbox_rx,
            inbox_tx,
            shutdown,
        } = self;

        let (mut reader, mut writer) = stream.into_split();

        if let Some(credential) = credential {
            let hello = handshake_frame(&credential);
            if let Err(_err) = write_frame(&mut writer, &hello).await {
                log_error!("{transport_id}: credential handshake failed: {_err}");
                return;
            }
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            buf.reserve(READ_CHUNK);

            tokio::select! {
                frame = outbox_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(_err) = write_frame(&mut writer, &frame).await {
                            log_error!("{transport_id}: write failed: {_err}");
                            break;
                        }
                    }
                    None => {
                        log_debug!("{transport_id}: outbox closed");
                        break;
                    }
                },

                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        log_info!("{transport_id}: closed by server");
                        break;
                    }
                    Ok(_n) => {
                        log_trace!("{transport_id}: read {_n} bytes");
                        if inbox_tx.send(buf.split().freeze()).await.is_err() {
                            log_debug!("{transport_id}: inbox dropped");
                            break;
                        }
                    }
                    Err(_err) => {
                        log_error!("{transport_id}: read failed: {_err}");
                        break;
                    }
                },

                _ = shutdown.notified() => {
                    log_debug!("{transport_id}: close requested");
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    let mut line = BytesMut::with_capacity(frame.len() + 1);
    line.put_slice(frame);
    line.put_u8(b'\n');
    writer.write_all(&line).await
}

fn handshake_frame(credential: &Credential) -> Bytes {
    let hello = serde_json::json!({
        "command": "auth",
        "data": { "credential": credential.expose() },
    });
    Bytes::from(hello.to_string())
}

/// Accepts `tcp://host:port` or `host:port`.
fn parse_address(address: &str) -> Result<String> {
    let rest = address.strip_prefix("tcp://").unwrap_or(address);
    let rest = rest.trim_end_matches('/');

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(rest.to_string()),
        _ => Err(KvError::InvalidAddress(format!(
            "{address}: expected tcp://host:port"
        ))),
    }
}

/// Create a TCP transport.
///
/// Connections are made lazily, on every [`Transport::open`].
pub fn create_tcp_transport(config: TcpConfig) -> TransportPtr {
    Arc::new(TcpTransport { config })
}
