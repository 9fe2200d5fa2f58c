use std::{io, path::PathBuf};

use thiserror::Error;

/// A single player's status could not be read. The player degrades to `Unknown`.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("player {0} is not on the bus")]
    UnknownPlayer(String),

    #[error("status query to {player} failed: {source}")]
    Transport {
        player: String,
        #[source]
        source: zbus::Error,
    },
}

/// The compositor handshake did not complete.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("cannot reach the Wayland compositor: {0}")]
    Connect(#[from] wayland_client::ConnectError),

    #[error("Wayland roundtrip failed: {0}")]
    Dispatch(#[from] wayland_client::DispatchError),

    #[error("compositor does not advertise {0}")]
    MissingGlobal(&'static str),

    #[error("cannot watch the Wayland socket: {0}")]
    Io(#[from] io::Error),
}

/// Creating or destroying the inhibitor failed after the handshake.
#[derive(Error, Debug)]
pub enum InhibitError {
    #[error("no surface is bound to the compositor connection")]
    NoSurface,

    #[error("compositor no longer offers zwp_idle_inhibit_manager_v1")]
    NoManager,

    #[error("compositor connection failed: {0}")]
    Dispatch(#[from] wayland_client::DispatchError),
}

/// Failures of the session bus link itself.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("session bus request failed: {0}")]
    Zbus(#[from] zbus::Error),

    #[error("session bus request failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("session bus connection closed")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
