//! Client side of the framed TCP protocol

use log::{debug, info, warn};
use shared::{
    write_frame, Encode, EncodeError, ErrorPacket, Frame, FrameError, FrameFormat, FrameReader,
    Packet, MAX_PAYLOAD_SIZE,
};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Frames buffered by the background reader before it waits for the consumer
const INCOMING_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("invalid packet: {0}")]
    Decode(#[from] bincode::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("refused by server: {0}")]
    Refused(String),
    #[error("unexpected packet: {0:?}")]
    Unexpected(Packet),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Write side of a connection
pub struct Sender {
    writer: OwnedWriteHalf,
    format: FrameFormat,
    timeout: Duration,
}

impl Sender {
    /// Encodes a message and writes it as one frame.
    pub async fn send<E: Encode + ?Sized>(&mut self, message: &E) -> Result<()> {
        let payload = message.to_payload()?;
        self.send_bytes(payload.as_bytes()).await
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        timeout(
            self.timeout,
            write_frame(&mut self.writer, self.format, payload),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Closes the write side; the server sees end of stream.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Frames delivered by the background reader started with [`Client::start`]
pub struct Incoming {
    rx: mpsc::Receiver<Frame>,
}

impl Incoming {
    /// Waits for the next frame. `None` once the connection has ended.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Takes every frame received so far without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// A connection to a tick server
pub struct Client {
    reader: FrameReader<OwnedReadHalf>,
    sender: Sender,
    timeout: Duration,
}

impl Client {
    pub async fn connect(addr: &str, format: FrameFormat) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: FrameReader::new(read_half, format, MAX_PAYLOAD_SIZE),
            sender: Sender {
                writer: write_half,
                format,
                timeout: DEFAULT_TIMEOUT,
            },
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the deadline for every read and write on this connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.sender.timeout = timeout;
        self
    }

    pub fn format(&self) -> FrameFormat {
        self.sender.format
    }

    pub async fn send<E: Encode + ?Sized>(&mut self, message: &E) -> Result<()> {
        self.sender.send(message).await
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        self.sender.send_bytes(payload).await
    }

    /// Reads the next frame, failing with [`ClientError::Timeout`] if none
    /// arrives in time.
    pub async fn recv(&mut self) -> Result<Frame> {
        let frame = timeout(self.timeout, self.reader.read_frame())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(frame)
    }

    pub async fn recv_packet(&mut self) -> Result<Packet> {
        let frame = self.recv().await?;
        Ok(Packet::decode(&frame.payload)?)
    }

    /// Introduces this client and waits for the verdict.
    ///
    /// Returns the session id assigned by the server. A rejection or an
    /// error notice from a full server becomes [`ClientError::Refused`].
    pub async fn hello(&mut self, name: &str, password: Option<&str>) -> Result<u64> {
        self.send(&Packet::Hello {
            name: name.to_string(),
            password: password.map(str::to_string),
        })
        .await?;

        let frame = self.recv().await?;
        match Packet::decode(&frame.payload) {
            Ok(Packet::Welcome { session_id }) => {
                info!("Connected! Session ID: {}", session_id);
                Ok(session_id)
            }
            Ok(Packet::Rejected { reason }) => Err(ClientError::Refused(reason)),
            Ok(other) => Err(ClientError::Unexpected(other)),
            Err(e) => match ErrorPacket::decode(&frame.payload) {
                Some(notice) => Err(ClientError::Refused(notice.message)),
                None => Err(e.into()),
            },
        }
    }

    /// Moves reading to a background task and returns the write side
    /// together with the stream of incoming frames.
    pub fn start(self) -> (Sender, Incoming) {
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let mut reader = self.reader;

        tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(FrameError::Closed) => {
                        info!("Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Connection lost: {}", e);
                        break;
                    }
                }
            }
        });

        (self.sender, Incoming { rx })
    }

    pub async fn close(self) {
        self.sender.close().await
    }
}
