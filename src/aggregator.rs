//! Decision engine.
//!
//! Folds the registry's "anyone playing?" answer and the compositor link state into a
//! single inhibitor. The inhibitor handle lives inside the link it was created on, so
//! dropping the link on disconnect drops the handle with it and the state can never
//! be `Inhibited` while disconnected.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::InhibitError;

/// What the aggregator needs from a compositor connection.
pub trait Compositor {
    type Handle: fmt::Debug;

    fn create_inhibitor(&mut self) -> Result<Self::Handle, InhibitError>;

    /// Best effort. The handle is consumed either way.
    fn destroy_inhibitor(&mut self, handle: Self::Handle) -> Result<(), InhibitError>;
}

#[derive(Debug)]
pub enum InhibitionState<H> {
    Uninhibited,
    Inhibited(H),
}

impl<H> InhibitionState<H> {
    /// Moves the state out, leaving `Uninhibited` behind.
    fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Uninhibited)
    }

    pub const fn is_inhibited(&self) -> bool {
        matches!(self, Self::Inhibited(_))
    }
}

/// A live compositor connection and the inhibitor created on it, if any.
struct Link<C: Compositor> {
    client: C,
    state: InhibitionState<C::Handle>,
}

/// Outcome of one reconcile pass, mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Inhibited,
    Released,
    CreateFailed,
}

pub struct Aggregator<C: Compositor> {
    link: Option<Link<C>>,
}

impl<C: Compositor> Default for Aggregator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Compositor> Aggregator<C> {
    /// Starts with no compositor link.
    pub const fn new() -> Self {
        Self { link: None }
    }

    pub fn with_compositor(client: C) -> Self {
        let mut agg = Self::new();
        agg.link = Some(Link {
            client,
            state: InhibitionState::Uninhibited,
        });
        agg
    }

    pub const fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    #[cfg(test)]
    pub fn is_inhibited(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.state.is_inhibited())
    }

    pub fn compositor_mut(&mut self) -> Option<&mut C> {
        self.link.as_mut().map(|link| &mut link.client)
    }

    /// Brings the inhibitor in line with `playing`.
    ///
    /// Called after every stimulus with the value recomputed from the whole registry,
    /// so a failed create is retried by whatever event comes next.
    pub fn reconcile(&mut self, playing: bool) -> Transition {
        let Some(link) = self.link.as_mut() else {
            if playing {
                debug!("players are playing but no compositor is connected");
            }
            return Transition::None;
        };

        match (playing, link.state.is_inhibited()) {
            (true, false) => match link.client.create_inhibitor() {
                Ok(handle) => {
                    debug!(?handle, "created idle inhibitor");
                    link.state = InhibitionState::Inhibited(handle);
                    Transition::Inhibited
                }
                Err(e) => {
                    warn!("failed to create idle inhibitor: {e} (will retry on next event)");
                    Transition::CreateFailed
                }
            },
            (false, true) => {
                if let InhibitionState::Inhibited(handle) = link.state.take() {
                    debug!(?handle, "destroying idle inhibitor");
                    if let Err(e) = link.client.destroy_inhibitor(handle) {
                        warn!("failed to destroy idle inhibitor: {e}");
                    }
                }
                Transition::Released
            }
            _ => Transition::None,
        }
    }

    /// A new compositor link came up. Any previous link is dropped first.
    pub fn connected(&mut self, client: C, playing: bool) -> Transition {
        if self.link.is_some() {
            // Replacing a live link: release through the old connection first.
            self.release();
        }
        info!("compositor connected");
        self.link = Some(Link {
            client,
            state: InhibitionState::Uninhibited,
        });
        self.reconcile(playing)
    }

    /// The compositor connection is gone. The handle died with it, so it is dropped
    /// without a destroy request.
    pub fn disconnected(&mut self) -> Option<C> {
        let link = self.link.take()?;
        if let InhibitionState::Inhibited(handle) = link.state {
            info!(?handle, "compositor disconnected, inhibitor dropped with connection");
        } else {
            info!("compositor disconnected");
        }
        Some(link.client)
    }

    /// Destroys an outstanding inhibitor, keeping the link. Used on every exit path.
    pub fn release(&mut self) -> Transition {
        self.reconcile(false)
    }
}
