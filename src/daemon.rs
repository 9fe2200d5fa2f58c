//! Event loop.
//!
//! Everything that mutates the registry or the inhibitor runs inside `Daemon::dispatch`,
//! called from a single task. The async side only waits: for a bus signal, for the
//! compositor socket to die, for the reconnect timer, or for a termination signal.

use std::{future, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    aggregator::{Aggregator, Compositor, Transition},
    bus::{BusClient, BusEvent},
    config::CompositorConfig,
    error::ConnectError,
    player::{PlaybackStatus, PlayerId, PlayerRecord},
    registry::PlayerRegistry,
    wayland::WaylandCompositor,
};

#[derive(Debug)]
pub enum Event<C> {
    PlayerAppeared(PlayerRecord),
    PlayerVanished(PlayerId),
    StatusChanged(PlayerId, PlaybackStatus),
    CompositorConnected(C),
    CompositorDisconnected,
}

impl<C> From<BusEvent> for Event<C> {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::PlayerAppeared(record) => Self::PlayerAppeared(record),
            BusEvent::PlayerVanished(id) => Self::PlayerVanished(id),
            BusEvent::StatusChanged(id, status) => Self::StatusChanged(id, status),
        }
    }
}

pub struct Daemon<C: Compositor> {
    registry: PlayerRegistry,
    aggregator: Aggregator<C>,
}

impl<C: Compositor> Daemon<C> {
    /// Seeds the registry from the players found at startup and decides once.
    pub fn new(compositor: C, players: Vec<PlayerRecord>) -> Self {
        let mut daemon = Self {
            registry: players.into_iter().collect(),
            aggregator: Aggregator::with_compositor(compositor),
        };
        if daemon.registry.is_empty() {
            info!("no MPRIS players on the bus yet");
        } else {
            info!("tracking {} player(s)", daemon.registry.len());
        }
        for record in daemon.registry.snapshot() {
            debug!(player = %record.id, status = %record.status, "seeded");
        }
        let transition = daemon.aggregator.reconcile(daemon.registry.any_playing());
        daemon.report(transition);
        daemon
    }

    #[cfg(test)]
    pub const fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn is_inhibited(&self) -> bool {
        self.aggregator.is_inhibited()
    }

    pub const fn is_connected(&self) -> bool {
        self.aggregator.is_connected()
    }

    pub fn compositor_mut(&mut self) -> Option<&mut C> {
        self.aggregator.compositor_mut()
    }

    /// Applies one event, then recomputes the decision from the whole registry.
    pub fn dispatch(&mut self, event: Event<C>) -> Transition {
        let transition = match event {
            Event::PlayerAppeared(record) => {
                info!(
                    player = %record.id,
                    status = %record.status,
                    name = record.label(),
                    "player appeared"
                );
                self.registry.insert(record);
                self.reconcile()
            }
            Event::PlayerVanished(id) => {
                if self.registry.remove(&id).is_some() {
                    info!(player = %id, "player vanished");
                } else {
                    trace!(player = %id, "vanish for a player not in the registry");
                }
                self.reconcile()
            }
            Event::StatusChanged(id, status) => {
                match self.registry.status(&id) {
                    Some(old) if old != status => {
                        info!(player = %id, from = %old, to = %status, "status changed");
                        self.registry.upsert(id, status);
                    }
                    Some(_) => trace!(player = %id, %status, "status unchanged"),
                    None => trace!(player = %id, "status for a player not in the registry"),
                }
                self.reconcile()
            }
            Event::CompositorConnected(compositor) => {
                let playing = self.registry.any_playing();
                self.aggregator.connected(compositor, playing)
            }
            Event::CompositorDisconnected => {
                self.aggregator.disconnected();
                self.reconcile()
            }
        };
        self.report(transition);
        transition
    }

    /// Releases any outstanding inhibitor. Runs on every exit path.
    pub fn shutdown(&mut self) {
        let transition = self.aggregator.release();
        self.report(transition);
    }

    fn reconcile(&mut self) -> Transition {
        self.aggregator.reconcile(self.registry.any_playing())
    }

    fn report(&self, transition: Transition) {
        match transition {
            Transition::Inhibited => {
                let players: Vec<_> = self.registry.playing().collect();
                info!("idle inhibited by {}", players.join(", "));
            }
            Transition::Released => info!("idle allowed"),
            Transition::CreateFailed | Transition::None => {}
        }
    }
}

/// Exponential reconnect delay, doubling up to a ceiling.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Signal,
    BusLost,
}

async fn connect_compositor(cfg: &CompositorConfig) -> Result<WaylandCompositor, ConnectError> {
    let attempts = cfg.startup_attempts();
    let mut attempt = 1;
    loop {
        match WaylandCompositor::connect() {
            Ok(compositor) => return Ok(compositor),
            Err(e) if attempt < attempts => {
                warn!("compositor handshake failed ({attempt}/{attempts}): {e}");
                sleep(cfg.reconnect_initial()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn compositor_closed(daemon: &mut Daemon<WaylandCompositor>) -> String {
    match daemon.compositor_mut() {
        Some(compositor) => compositor.closed().await.to_string(),
        None => future::pending().await,
    }
}

pub async fn run(cfg: &CompositorConfig) -> Result<Exit> {
    let compositor = connect_compositor(cfg)
        .await
        .context("initial compositor handshake")?;

    let mut bus = BusClient::connect().await.context("connecting to session bus")?;
    let players = bus.list_players().await.context("listing MPRIS players")?;

    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("SIGHUP handler")?;

    // Nothing below may return early: the inhibitor must be released on the way out.
    let mut daemon = Daemon::new(compositor, players);

    let mut backoff = Backoff::new(cfg.reconnect_initial(), cfg.reconnect_max());
    let mut next_attempt = Instant::now();

    let exit = loop {
        tokio::select! {
            _ = sigterm.recv() => break Exit::Signal,
            _ = sigint.recv() => break Exit::Signal,
            _ = sighup.recv() => break Exit::Signal,
            msg = bus.recv() => match msg {
                Ok(msg) => {
                    for event in bus.events(&msg).await {
                        daemon.dispatch(event.into());
                    }
                }
                Err(e) => {
                    error!("lost the session bus: {e}");
                    break Exit::BusLost;
                }
            },
            reason = compositor_closed(&mut daemon), if daemon.is_connected() => {
                warn!("compositor connection lost: {reason}");
                daemon.dispatch(Event::CompositorDisconnected);
                next_attempt = Instant::now() + backoff.next_delay();
            }
            () = sleep_until(next_attempt), if !daemon.is_connected() => {
                match WaylandCompositor::connect() {
                    Ok(compositor) => {
                        backoff.reset();
                        daemon.dispatch(Event::CompositorConnected(compositor));
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        debug!("compositor reconnect failed: {e} (retry in {delay:?})");
                        next_attempt = Instant::now() + delay;
                    }
                }
            }
        }
    };

    info!(?exit, "shutting down");
    daemon.shutdown();
    Ok(exit)
}
