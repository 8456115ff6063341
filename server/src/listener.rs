//! TCP front door: accepts connections, runs the handshake and hands
//! admitted sessions to an instance
//!
//! Each accepted connection gets a fresh session id and its own handshake
//! task, so a slow client never holds up the accept loop. The handshake
//! reads exactly one frame, asks the application to validate it, writes
//! the application's response, and then either closes the connection or
//! admits the session and starts its loops.

use crate::error::{Error, Result};
use crate::game::Game;
use crate::instance::{AdmitError, Instance};
use crate::session::{Session, SessionId};
use log::{debug, error, info, warn};
use shared::{write_frame, Encode, ErrorPacket, FrameReader};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Longest a refused connection is drained before it is dropped
const CLOSE_LINGER: Duration = Duration::from_secs(1);

pub struct Listener<G: Game> {
    listener: TcpListener,
    instance: Arc<Instance<G>>,
    next_id: AtomicU64,
}

impl<G: Game> Listener<G> {
    /// Binds to `addr` after checking the instance's configuration.
    pub async fn bind(addr: &str, instance: Arc<Instance<G>>) -> Result<Self> {
        instance.config().validate()?;

        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            instance,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn instance(&self) -> &Arc<Instance<G>> {
        &self.instance
    }

    /// Serves until Ctrl+C or SIGTERM, then stops the instance.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Starts the instance if needed and accepts connections until
    /// `shutdown` resolves or the instance is stopped elsewhere.
    ///
    /// On return the instance is stopped and every session has been closed.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ticker = self.instance.start();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                _ = self.instance.stopped() => {
                    info!("Instance stopped, closing listener");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let instance = Arc::clone(&self.instance);
                        tokio::spawn(handshake(instance, stream, peer, id));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        self.instance.stop();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                error!("Tick loop panicked: {}", e);
            }
        }
        Ok(())
    }
}

async fn handshake<G: Game>(
    instance: Arc<Instance<G>>,
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
) {
    let config = instance.config();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let (read_half, mut write_half) = stream.into_split();

    if instance.len() >= config.max_sessions {
        warn!("Rejecting {}: server is full", peer);
        refuse(&instance, read_half, write_half, ErrorPacket::server_full()).await;
        return;
    }

    let mut reader = FrameReader::new(read_half, config.frame_format, config.max_frame_size);
    let first = match timeout(config.handshake_timeout, reader.read_frame()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) if e.is_malformed() => {
            warn!("Rejecting {}: {}", peer, e);
            let notice = ErrorPacket::bad_packet_size();
            refuse(&instance, reader.into_inner(), write_half, notice).await;
            return;
        }
        Ok(Err(e)) => {
            debug!("Connection from {} ended during handshake: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Handshake from {} timed out", peer);
            return;
        }
    };

    let admission = instance.game().validate(id, &first);
    if let Some(response) = &admission.response {
        let written = timeout(
            config.write_timeout,
            write_frame(&mut write_half, config.frame_format, response.as_bytes()),
        )
        .await;
        if !matches!(written, Ok(Ok(()))) {
            debug!("Failed to send handshake response to {}", peer);
            if admission.accepted {
                instance.abandon(id);
            }
            return;
        }
    }

    if !admission.accepted {
        info!("Handshake from {} rejected", peer);
        close(reader.into_inner(), write_half).await;
        return;
    }

    let (session, outbound) = Session::new(id, Some(peer), config.outbound_capacity);
    match instance.admit(&session) {
        Ok(()) => {
            info!("Session {} connected from {}", id, peer);
            session.spawn(reader, write_half, outbound, config.malformed_frames);
        }
        Err(AdmitError::Full(_)) => {
            warn!("Rejecting {}: server filled up during handshake", peer);
            instance.abandon(id);
            refuse(&instance, reader.into_inner(), write_half, ErrorPacket::server_full()).await;
        }
        Err(e) => {
            debug!("Dropping {} after handshake: {}", peer, e);
            instance.abandon(id);
            close(reader.into_inner(), write_half).await;
        }
    }
}

/// Sends an error notice, then closes the connection.
async fn refuse<G: Game>(
    instance: &Instance<G>,
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    notice: ErrorPacket,
) {
    let config = instance.config();
    match notice.to_payload() {
        Ok(payload) => {
            let _ = timeout(
                config.write_timeout,
                write_frame(&mut writer, config.frame_format, payload.as_bytes()),
            )
            .await;
        }
        Err(e) => error!("Failed to encode error notice: {}", e),
    }
    close(reader, writer).await;
}

/// Half-closes the connection and discards inbound bytes until the peer
/// closes too, or `CLOSE_LINGER` passes. Dropping a socket with unread
/// data resets it, which can destroy the last frame we wrote.
async fn close(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) {
    let _ = writer.shutdown().await;
    let mut sink = [0u8; 1024];
    let _ = timeout(CLOSE_LINGER, async {
        while let Ok(n) = reader.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
