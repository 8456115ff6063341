//! Per-connection state and the two tasks that drive a connection
//!
//! A session owns one TCP connection after the handshake has admitted it:
//! - The read loop decodes frames, enforces the idle timeout and hands each
//!   frame to the accumulator of the instance the session is bound to
//! - The write loop drains a bounded queue of outbound batches and writes
//!   each batch as consecutive frames, under a write deadline
//!
//! A session that cannot keep up with its outbound queue is terminated
//! rather than allowed to stall the tick loop. Termination happens once,
//! from whichever task or caller notices the problem first, and is reported
//! to the bound instance exactly once.

use crate::accumulator::{Accumulator, Input};
use crate::config::MalformedFramePolicy;
use crate::group::Group;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{encode_frame, Frame, FrameError, FrameFormat, FrameReader, Payload};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Unique session identifier assigned by the listener
pub type SessionId = u64;

/// Ordered payloads delivered to a session in one write
pub type Batch = Arc<[Payload]>;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    #[error("connection closed by peer")]
    Eof,
    #[error("connection error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },
    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("full tcp buffer, bad receiver")]
    Overflow,
    #[error("server shutting down")]
    Shutdown,
    #[error("closed by the application")]
    Closed,
}

impl DisconnectReason {
    pub fn from_io(err: &io::Error) -> Self {
        DisconnectReason::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<FrameError> for DisconnectReason {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => DisconnectReason::Eof,
            FrameError::Io(e) => DisconnectReason::from_io(&e),
            other => DisconnectReason::MalformedFrame(other.to_string()),
        }
    }
}

/// Termination notice sent to the instance a session is bound to.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub id: SessionId,
    pub reason: DisconnectReason,
}

/// Where a session's inputs go and who hears about its termination.
///
/// Replaced as a whole when a session moves to another instance.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) group: Arc<Group>,
    pub(crate) accumulator: Arc<Accumulator>,
    pub(crate) disconnects: mpsc::UnboundedSender<Disconnect>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
}

struct State {
    terminated: bool,
    outbound: Option<mpsc::Sender<Batch>>,
    binding: Option<Binding>,
    reason: Option<DisconnectReason>,
}

/// One admitted client connection
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    state: Mutex<State>,
    closed: CancellationToken,
}

impl Session {
    /// Creates an unbound session together with the receiving end of its
    /// outbound queue, which holds at most `outbound_capacity` batches.
    ///
    /// The receiver is handed to [`Session::spawn`] once the connection
    /// is ready to be driven.
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let session = Arc::new(Self {
            id,
            peer,
            state: Mutex::new(State {
                terminated: false,
                outbound: Some(tx),
                binding: None,
                reason: None,
            }),
            closed: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// The reason recorded by the call that terminated this session
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.state.lock().reason.clone()
    }

    /// Queues a batch for the write loop without waiting.
    ///
    /// Returns `false` if the batch was not queued. A terminated session
    /// drops the batch silently; a session whose queue is full is
    /// terminated with [`DisconnectReason::Overflow`].
    pub fn ship(&self, batch: Batch) -> bool {
        let overflowed = {
            let state = self.state.lock();
            if state.terminated {
                return false;
            }
            let Some(outbound) = state.outbound.as_ref() else {
                return false;
            };
            match outbound.try_send(batch) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        };

        if overflowed {
            warn!(
                "Session {}: outbound queue full, dropping slow receiver",
                self.id
            );
            self.terminate(DisconnectReason::Overflow);
        }
        false
    }

    /// Ends the session: both loops stop, the connection is closed and the
    /// bound instance is notified.
    ///
    /// Safe to call from any task, any number of times. Only the first call
    /// has an effect and returns `true`.
    pub fn terminate(&self, reason: DisconnectReason) -> bool {
        let binding = {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.terminated = true;
            state.outbound = None;
            state.reason = Some(reason.clone());
            state.binding.clone()
        };

        debug!("Session {} terminated: {}", self.id, reason);
        self.closed.cancel();

        if let Some(binding) = binding {
            // The instance may already be gone during shutdown
            let _ = binding.disconnects.send(Disconnect {
                id: self.id,
                reason,
            });
        }
        true
    }

    /// Terminates the session on behalf of the application.
    pub fn close(&self) -> bool {
        self.terminate(DisconnectReason::Closed)
    }

    /// Waits until the session has been terminated.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Installs a new binding, returning the previous one.
    ///
    /// Fails with the recorded reason if the session is already terminated.
    pub(crate) fn bind(&self, binding: Binding) -> Result<Option<Binding>, DisconnectReason> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(state.reason.clone().unwrap_or(DisconnectReason::Closed));
        }
        Ok(state.binding.replace(binding))
    }

    pub(crate) fn binding(&self) -> Option<Binding> {
        self.state.lock().binding.clone()
    }

    /// Read and write deadlines of the bound instance; `None` if unbound.
    fn timeouts(&self) -> Option<(Duration, Duration)> {
        self.state
            .lock()
            .binding
            .as_ref()
            .map(|binding| (binding.read_timeout, binding.write_timeout))
    }

    /// Ends a session whose loops were started before it joined an instance.
    fn unbound(&self) {
        warn!("Session {}: running without an instance, closing", self.id);
        self.terminate(DisconnectReason::Closed);
    }

    /// Starts the read and write loops for this session.
    ///
    /// The reader's frame format is used for outbound frames as well, so
    /// both directions of a connection speak the same format. Deadlines
    /// come from the instance the session is bound to; a session spawned
    /// before [`Instance::admit`](crate::Instance::admit) closes itself.
    pub fn spawn<R, W>(
        self: &Arc<Self>,
        reader: FrameReader<R>,
        writer: W,
        outbound: mpsc::Receiver<Batch>,
        malformed_frames: MalformedFramePolicy,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let format = reader.format();
        let read_task = tokio::spawn(Arc::clone(self).read_loop(reader, malformed_frames));
        let write_task = tokio::spawn(Arc::clone(self).write_loop(writer, outbound, format));
        (read_task, write_task)
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        mut reader: FrameReader<R>,
        malformed_frames: MalformedFramePolicy,
    ) {
        loop {
            let Some((read_timeout, _)) = self.timeouts() else {
                self.unbound();
                break;
            };
            let result = tokio::select! {
                _ = self.closed.cancelled() => break,
                result = timeout(read_timeout, reader.read_frame()) => result,
            };

            match result {
                Ok(Ok(frame)) => self.deliver(frame),
                Ok(Err(err))
                    if err.is_malformed() && malformed_frames == MalformedFramePolicy::Skip =>
                {
                    let skipped = reader.skip_frame();
                    warn!(
                        "Session {}: skipping malformed frame of {} bytes: {}",
                        self.id, skipped, err
                    );
                }
                Ok(Err(err)) => {
                    if err.is_malformed() {
                        warn!("Session {}: {}", self.id, err);
                    }
                    self.terminate(err.into());
                    break;
                }
                Err(_) => {
                    self.terminate(DisconnectReason::ReadTimeout(read_timeout));
                    break;
                }
            }
        }
    }

    fn deliver(self: &Arc<Self>, frame: Frame) {
        let accumulator = self
            .state
            .lock()
            .binding
            .as_ref()
            .map(|binding| Arc::clone(&binding.accumulator));

        match accumulator {
            Some(accumulator) => accumulator.add(Input::new(Arc::clone(self), frame)),
            None => debug!("Session {}: dropping input, not bound", self.id),
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut writer: W,
        mut outbound: mpsc::Receiver<Batch>,
        format: FrameFormat,
    ) {
        let mut buf = Vec::new();
        loop {
            let batch = tokio::select! {
                _ = self.closed.cancelled() => break,
                batch = outbound.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            buf.clear();
            for payload in batch.iter() {
                if let Err(err) = encode_frame(format, payload.as_bytes(), &mut buf) {
                    warn!("Session {}: dropping outbound payload: {}", self.id, err);
                }
            }
            if buf.is_empty() {
                continue;
            }

            let Some((_, write_timeout)) = self.timeouts() else {
                self.unbound();
                break;
            };
            let write = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            };
            let result = tokio::select! {
                _ = self.closed.cancelled() => break,
                result = timeout(write_timeout, write) => result,
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.terminate(DisconnectReason::from_io(&err));
                    break;
                }
                Err(_) => {
                    self.terminate(DisconnectReason::WriteTimeout(write_timeout));
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("terminated", &state.terminated)
            .field("reason", &state.reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{write_frame, MAX_PAYLOAD_SIZE};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn binding(
        read_timeout: Duration,
    ) -> (
        Binding,
        Arc<Accumulator>,
        mpsc::UnboundedReceiver<Disconnect>,
    ) {
        let accumulator = Arc::new(Accumulator::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Binding {
            group: Arc::new(Group::new("test")),
            accumulator: Arc::clone(&accumulator),
            disconnects: tx,
            read_timeout,
            write_timeout: Duration::from_secs(1),
        };
        (binding, accumulator, rx)
    }

    /// Spawns a bound session over an in-memory pipe and returns the
    /// client's end of the pipe.
    fn connected(
        read_timeout: Duration,
        policy: MalformedFramePolicy,
    ) -> (
        Arc<Session>,
        DuplexStream,
        Arc<Accumulator>,
        mpsc::UnboundedReceiver<Disconnect>,
    ) {
        let (client, server) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        let (session, outbound) = Session::new(1, None, 8);
        let (binding, accumulator, disconnects) = binding(read_timeout);
        session.bind(binding).unwrap();
        session.spawn(
            FrameReader::new(read_half, FrameFormat::Plain, 1024),
            write_half,
            outbound,
            policy,
        );
        (session, client, accumulator, disconnects)
    }

    fn batch(items: &[&str]) -> Batch {
        items.iter().map(|s| Payload::from(*s)).collect()
    }

    async fn wait_for_inputs(accumulator: &Accumulator, count: usize) {
        for _ in 0..200 {
            if accumulator.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Timed out waiting for {} inputs", count);
    }

    #[test]
    fn test_ship_queues_in_order() {
        let (session, mut rx) = Session::new(7, None, 4);
        assert!(session.ship(batch(&["a"])));
        assert!(session.ship(batch(&["b", "c"])));

        assert_eq!(rx.try_recv().unwrap()[0], Payload::from("a"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1], Payload::from("c"));
    }

    #[test]
    fn test_full_queue_terminates_with_overflow() {
        let (session, _rx) = Session::new(3, None, 2);
        assert!(session.ship(batch(&["1"])));
        assert!(session.ship(batch(&["2"])));
        assert!(!session.ship(batch(&["3"])));

        assert!(session.is_terminated());
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::Overflow));
    }

    #[test]
    fn test_ship_after_terminate_is_silent() {
        let (session, mut rx) = Session::new(4, None, 2);
        session.close();

        assert!(!session.ship(batch(&["late"])));
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminate_reports_exactly_once() {
        let (session, _rx) = Session::new(9, None, 2);
        let (binding, _accumulator, mut disconnects) = binding(Duration::from_secs(1));
        session.bind(binding).unwrap();

        let first = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| session.terminate(DisconnectReason::Shutdown)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(first, 1);
        let notice = disconnects.try_recv().unwrap();
        assert_eq!(notice.id, 9);
        assert_eq!(notice.reason, DisconnectReason::Shutdown);
        assert!(disconnects.try_recv().is_err());
    }

    #[test]
    fn test_bind_rejected_after_terminate() {
        let (session, _rx) = Session::new(2, None, 2);
        session.terminate(DisconnectReason::Eof);

        let (binding, _accumulator, _disconnects) = binding(Duration::from_secs(1));
        assert!(matches!(session.bind(binding), Err(DisconnectReason::Eof)));
        assert!(session.binding().is_none());
    }

    #[test]
    fn test_disconnect_reason_from_frame_error() {
        assert_eq!(
            DisconnectReason::from(FrameError::Closed),
            DisconnectReason::Eof
        );
        let reason = DisconnectReason::from(FrameError::TooLarge {
            declared: 70_000,
            max: MAX_PAYLOAD_SIZE,
        });
        assert!(matches!(reason, DisconnectReason::MalformedFrame(_)));

        let io_err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            DisconnectReason::from(FrameError::Io(io_err)),
            DisconnectReason::Io {
                kind: io::ErrorKind::ConnectionReset,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_accumulator() {
        let (session, mut client, accumulator, _disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Terminate);

        write_frame(&mut client, FrameFormat::Plain, b"first").await.unwrap();
        write_frame(&mut client, FrameFormat::Plain, b"second").await.unwrap();
        wait_for_inputs(&accumulator, 2).await;

        let inputs = accumulator.consume();
        assert_eq!(inputs[0].payload().as_bytes(), b"first");
        assert_eq!(inputs[1].payload().as_bytes(), b"second");
        assert_eq!(inputs[0].session_id(), session.id());
        assert!(!session.is_terminated());
    }

    #[tokio::test]
    async fn test_batch_written_as_consecutive_frames() {
        let (session, client, _accumulator, _disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Terminate);

        assert!(session.ship(batch(&["one", "two", "three"])));

        let mut reader = FrameReader::new(client, FrameFormat::Plain, MAX_PAYLOAD_SIZE);
        for expected in ["one", "two", "three"] {
            let frame = timeout(Duration::from_secs(1), reader.read_frame())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.payload, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_write_loop_emits_one_buffer_per_batch() {
        let mut expected = Vec::new();
        for payload in [b"ab".as_slice(), b"cde".as_slice()] {
            encode_frame(FrameFormat::Plain, payload, &mut expected).unwrap();
        }
        let writer = tokio_test::io::Builder::new().write(&expected).build();

        let (_client, server) = duplex(1024);
        let (session, outbound) = Session::new(5, None, 4);
        let (binding, _accumulator, _disconnects) = binding(Duration::from_secs(5));
        session.bind(binding).unwrap();
        let (_read_task, write_task) = session.spawn(
            FrameReader::new(server, FrameFormat::Plain, 1024),
            writer,
            outbound,
            MalformedFramePolicy::Terminate,
        );

        assert!(session.ship(batch(&["ab", "cde"])));
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();

        // The mock panics if the bytes written differ from the expectation
        timeout(Duration::from_secs(1), write_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unbound_session_closes_itself() {
        let (_client, server) = duplex(1024);
        let (session, outbound) = Session::new(6, None, 4);
        let (read_task, write_task) = session.spawn(
            FrameReader::new(server, FrameFormat::Plain, 1024),
            tokio::io::sink(),
            outbound,
            MalformedFramePolicy::Terminate,
        );

        timeout(Duration::from_secs(1), read_task).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), write_task).await.unwrap().unwrap();
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::Closed));
    }

    #[tokio::test]
    async fn test_peer_close_terminates_with_eof() {
        let (session, client, _accumulator, mut disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Terminate);

        drop(client);
        let notice = timeout(Duration::from_secs(1), disconnects.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(session.is_terminated());
        assert!(matches!(
            notice.reason,
            DisconnectReason::Eof | DisconnectReason::Io { .. }
        ));
    }

    #[tokio::test]
    async fn test_idle_session_times_out() {
        let (session, _client, _accumulator, mut disconnects) =
            connected(Duration::from_millis(50), MalformedFramePolicy::Terminate);

        let notice = timeout(Duration::from_secs(1), disconnects.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            notice.reason,
            DisconnectReason::ReadTimeout(Duration::from_millis(50))
        );
        assert_eq!(session.disconnect_reason(), Some(notice.reason));
    }

    #[tokio::test]
    async fn test_oversized_frame_terminates_by_default() {
        let (session, mut client, _accumulator, mut disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Terminate);

        // Declares 2000 bytes against a 1024 byte limit
        client.write_all(&[0x07, 0xD0]).await.unwrap();
        let notice = timeout(Duration::from_secs(1), disconnects.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(notice.reason, DisconnectReason::MalformedFrame(_)));
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped_when_configured() {
        let (session, mut client, accumulator, _disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Skip);

        let mut oversized = vec![0x07, 0xD0];
        oversized.extend(std::iter::repeat(0xAB).take(2000));
        client.write_all(&oversized).await.unwrap();
        write_frame(&mut client, FrameFormat::Plain, b"after").await.unwrap();

        wait_for_inputs(&accumulator, 1).await;
        let inputs = accumulator.consume();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].payload().as_bytes(), b"after");
        assert!(!session.is_terminated());
    }

    #[tokio::test]
    async fn test_terminate_closes_connection() {
        let (session, client, _accumulator, _disconnects) =
            connected(Duration::from_secs(5), MalformedFramePolicy::Terminate);

        session.close();
        session.closed().await;

        let mut reader = FrameReader::new(client, FrameFormat::Plain, MAX_PAYLOAD_SIZE);
        let result = timeout(Duration::from_secs(1), reader.read_frame())
            .await
            .unwrap();
        assert!(matches!(result, Err(FrameError::Closed)));
    }
}
