use std::{fmt, str::FromStr};

/// Well-known bus name prefix every MPRIS player owns.
pub const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";

/// One media player connection on the session bus.
///
/// Identity is the pair of well-known name and unique owner. The bus daemon never
/// hands out the same unique name twice, so a player that quits and comes back under
/// the same well-known name is a different `PlayerId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerId {
    bus_name: String,
    owner: String,
}

impl PlayerId {
    pub fn new(bus_name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            owner: owner.into(),
        }
    }

    #[cfg(test)]
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Short name as playerctl prints it ("firefox.instance_1_240").
    pub fn short_name(&self) -> &str {
        self.bus_name
            .strip_prefix(MPRIS_PREFIX)
            .unwrap_or(&self.bus_name)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_name(), self.owner)
    }
}

/// MPRIS `PlaybackStatus`, plus `Unknown` for players we could not ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl PlaybackStatus {
    /// Only a confirmed `Playing` keeps the session awake.
    pub const fn is_playing(self) -> bool {
        matches!(self, Self::Playing)
    }
}

impl FromStr for PlaybackStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        })
    }
}

impl From<&str> for PlaybackStatus {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub status: PlaybackStatus,
    /// MPRIS `Identity`, e.g. "Mozilla Firefox". Absent when the player does not say.
    pub identity: Option<String>,
}

impl PlayerRecord {
    pub const fn new(id: PlayerId, status: PlaybackStatus) -> Self {
        Self {
            id,
            status,
            identity: None,
        }
    }

    /// Name for log lines: the identity if known, else the short bus name.
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or_else(|| self.id.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mpris_status_strings() {
        assert_eq!(PlaybackStatus::from("Playing"), PlaybackStatus::Playing);
        assert_eq!(PlaybackStatus::from("Paused"), PlaybackStatus::Paused);
        assert_eq!(PlaybackStatus::from("Stopped"), PlaybackStatus::Stopped);
        assert_eq!(PlaybackStatus::from(" Playing\n"), PlaybackStatus::Playing);
    }

    #[test]
    fn unrecognised_status_is_unknown_and_not_playing() {
        let status = PlaybackStatus::from("playing");
        assert_eq!(status, PlaybackStatus::Unknown);
        assert!(!status.is_playing());
        assert!(!PlaybackStatus::from("").is_playing());
    }

    #[test]
    fn short_name_strips_mpris_prefix() {
        let id = PlayerId::new("org.mpris.MediaPlayer2.firefox.instance_1_240", ":1.42");
        assert_eq!(id.short_name(), "firefox.instance_1_240");
        assert_eq!(id.to_string(), "firefox.instance_1_240 (:1.42)");

        let odd = PlayerId::new("com.example.Player", ":1.7");
        assert_eq!(odd.short_name(), "com.example.Player");
    }

    #[test]
    fn label_prefers_identity() {
        let mut rec = PlayerRecord::new(
            PlayerId::new("org.mpris.MediaPlayer2.spotify", ":1.3"),
            PlaybackStatus::Playing,
        );
        assert_eq!(rec.label(), "spotify");

        rec.identity = Some("Spotify".into());
        assert_eq!(rec.label(), "Spotify");
    }

    #[test]
    fn same_name_new_owner_is_a_new_player() {
        let first = PlayerId::new("org.mpris.MediaPlayer2.mpv", ":1.10");
        let second = PlayerId::new("org.mpris.MediaPlayer2.mpv", ":1.11");
        assert_ne!(first, second);
        assert_eq!(first.bus_name(), second.bus_name());
    }
}
