//! Tick-driven scheduler binding an application to its sessions
//!
//! An instance owns the member group, the accumulator and the dispatcher
//! for one application. Its tick loop runs at a fixed interval:
//! 1. Take every input accumulated since the previous tick
//! 2. Hand them to [`Game::update`]
//! 3. Enqueue the returned messages and flush them to the sessions
//!
//! Flushing tick N completes before tick N+1 begins. Disconnects are
//! handled on a separate task so the application hears about a departed
//! session without waiting for the next tick.

use crate::accumulator::Accumulator;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, FlushStats, Recipient};
use crate::game::Game;
use crate::group::Group;
use crate::session::{Binding, Disconnect, DisconnectReason, Session, SessionId};
use log::{debug, error, info};
use parking_lot::Mutex;
use shared::Payload;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Ticks between two debug summaries of the loop
const STATS_INTERVAL: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("instance is stopped")]
    Stopped,
    #[error("instance is full ({0} sessions)")]
    Full(usize),
    #[error("session already terminated: {0}")]
    Terminated(DisconnectReason),
}

pub struct Instance<G: Game> {
    game: G,
    config: Config,
    members: Arc<Group>,
    accumulator: Arc<Accumulator>,
    dispatcher: Mutex<Dispatcher>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes whole ticks
    tick_guard: Mutex<()>,
    ticks: AtomicU64,
    shutdown: CancellationToken,
    disconnect_tx: mpsc::UnboundedSender<Disconnect>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<Disconnect>>>,
}

impl<G: Game> Instance<G> {
    pub fn new(game: G, config: Config) -> Arc<Self> {
        let members = Arc::new(Group::new("members"));
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            game,
            members: Arc::clone(&members),
            accumulator: Arc::new(Accumulator::new()),
            dispatcher: Mutex::new(Dispatcher::new(members)),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            tick_guard: Mutex::new(()),
            ticks: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            disconnect_tx,
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
            config,
        })
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Group of every session currently admitted
    pub fn members(&self) -> &Arc<Group> {
        &self.members
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Number of ticks completed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Admits a session, or moves it here from the instance it is bound to.
    ///
    /// After this returns `Ok`, the session's inputs go to this instance's
    /// accumulator and its termination is reported to this instance's
    /// application. A moved session is removed from its previous instance.
    pub fn admit(&self, session: &Arc<Session>) -> Result<(), AdmitError> {
        let lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Stopped {
            return Err(AdmitError::Stopped);
        }
        if self.members.contains(session.id()) {
            return Ok(());
        }
        if self.members.len() >= self.config.max_sessions {
            return Err(AdmitError::Full(self.config.max_sessions));
        }

        let binding = Binding {
            group: Arc::clone(&self.members),
            accumulator: Arc::clone(&self.accumulator),
            disconnects: self.disconnect_tx.clone(),
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
        };
        let previous = session.bind(binding).map_err(AdmitError::Terminated)?;
        if let Some(previous) = previous {
            previous.group.remove(session.id());
            debug!("Session {} moved to a new instance", session.id());
        }
        self.members.add(Arc::clone(session));

        // Terminated between bind and add: the disconnect notice may
        // already have been handled, so undo the add here
        if session.is_terminated() {
            self.members.remove(session.id());
            let reason = session
                .disconnect_reason()
                .unwrap_or(DisconnectReason::Closed);
            return Err(AdmitError::Terminated(reason));
        }

        // Under the lifecycle lock: `on_disconnect` waits for it, so the
        // application never hears about a departure before the arrival
        self.game.admitted(session);
        drop(lifecycle);
        Ok(())
    }

    /// Tells the application that a session it accepted in `validate`
    /// will not join this instance.
    pub fn abandon(&self, session: SessionId) {
        debug!("Session {} abandoned before admission", session);
        self.game.abandoned(session);
    }

    /// Queues payloads outside of `update`; they go out with the next flush.
    pub fn dispatch(&self, recipient: Recipient, payloads: impl IntoIterator<Item = Payload>) {
        self.dispatcher.lock().enqueue(recipient, payloads);
    }

    /// Runs one tick immediately: consume, update, flush.
    pub fn tick(&self) -> FlushStats {
        let _guard = self.tick_guard.lock();
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let batch = self.accumulator.consume();
        let inputs = batch.len();
        let outbox = self.game.update(tick, batch);

        let stats = {
            let mut dispatcher = self.dispatcher.lock();
            for (recipient, payloads) in outbox {
                dispatcher.enqueue(recipient, payloads);
            }
            dispatcher.flush()
        };

        if tick % STATS_INTERVAL == 0 {
            debug!(
                "Tick {}: {} sessions, {} inputs, {} batches delivered, {} skipped",
                tick,
                self.members.len(),
                inputs,
                stats.delivered,
                stats.skipped
            );
        }
        stats
    }

    /// Spawns the tick loop. Returns `None` if the instance was already
    /// started or has been stopped.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let disconnects = self.begin()?;
        Some(tokio::spawn(Arc::clone(self).drive(disconnects)))
    }

    /// Runs the tick loop on the current task until [`Instance::stop`].
    /// Returns immediately if the instance was already started or stopped.
    pub async fn run(self: Arc<Self>) {
        if let Some(disconnects) = self.begin() {
            self.drive(disconnects).await;
        }
    }

    /// Terminates every member, ends the tick loop and refuses further
    /// admissions. Later calls do nothing.
    pub fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        let closed = self.members.close(DisconnectReason::Shutdown);
        info!("Stopping instance, closed {} sessions", closed);
        self.shutdown.cancel();

        // Never started: no handler task exists to report the closures
        if previous == Lifecycle::NotStarted {
            if let Some(mut disconnects) = self.disconnect_rx.lock().take() {
                while let Ok(notice) = disconnects.try_recv() {
                    self.on_disconnect(notice);
                }
            }
        }
    }

    /// Waits until [`Instance::stop`] has been called.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    fn begin(&self) -> Option<mpsc::UnboundedReceiver<Disconnect>> {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::NotStarted {
            return None;
        }
        let disconnects = self.disconnect_rx.lock().take()?;
        *lifecycle = Lifecycle::Running;
        Some(disconnects)
    }

    async fn drive(self: Arc<Self>, disconnects: mpsc::UnboundedReceiver<Disconnect>) {
        let handler = tokio::spawn(Arc::clone(&self).handle_disconnects(disconnects));

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Instance running at {:.1} ticks per second",
            1.0 / self.config.tick_interval.as_secs_f64()
        );

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        if let Err(e) = handler.await {
            error!("Disconnect handler panicked: {}", e);
        }
        info!("Instance stopped after {} ticks", self.ticks());
    }

    async fn handle_disconnects(self: Arc<Self>, mut disconnects: mpsc::UnboundedReceiver<Disconnect>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                notice = disconnects.recv() => match notice {
                    Some(notice) => self.on_disconnect(notice),
                    None => break,
                },
            }
        }

        // Sessions closed by stop() report after the token fires
        while let Ok(notice) = disconnects.try_recv() {
            self.on_disconnect(notice);
        }
    }

    fn on_disconnect(&self, notice: Disconnect) {
        // Waits out an `admit` still running the `admitted` hook
        let _admissions = self.lifecycle.lock();
        self.members.remove(notice.id);
        info!("Session {} disconnected: {}", notice.id, notice.reason);
        self.game.disconnect(notice.id, &notice.reason);
    }
}
