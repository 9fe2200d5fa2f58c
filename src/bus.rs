//! MPRIS observation over the session bus (zbus 3.x).
//!
//! Two match-rule streams feed the client: player appear/vanish (`NameOwnerChanged`
//! in the `org.mpris.MediaPlayer2` namespace) and player `PropertiesChanged`. Each
//! carries matching signals only, so method replies never queue up behind an unread
//! stream. A player's status is followed from the moment it appears until it
//! vanishes by keying signals on its unique owner.

use std::{collections::HashMap, sync::Arc};

use futures_util::stream::{self, Select, StreamExt};
use tracing::{debug, info, instrument, trace, warn};
use zbus::{
    dbus_proxy, fdo, fdo::DBusProxy, zvariant::OwnedValue, CacheProperties, Connection,
    MatchRule, Message, MessageStream, MessageType,
};

use crate::{
    error::{BusError, QueryError},
    player::{PlaybackStatus, PlayerId, PlayerRecord, MPRIS_PREFIX},
};

const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";
const PLAYBACK_STATUS: &str = "PlaybackStatus";

const NAME_OWNER_RULE: &str = "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged',arg0namespace='org.mpris.MediaPlayer2'";
const STATUS_RULE: &str = "type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='/org/mpris/MediaPlayer2',arg0='org.mpris.MediaPlayer2.Player'";

/// Signals buffered per stream while the loop is busy with a bus round trip.
const SIGNAL_QUEUE: usize = 1024;

#[dbus_proxy(
    interface = "org.mpris.MediaPlayer2.Player",
    default_path = "/org/mpris/MediaPlayer2"
)]
trait MediaPlayer2Player {
    #[dbus_proxy(property)]
    fn playback_status(&self) -> zbus::Result<String>;
}

#[dbus_proxy(
    interface = "org.mpris.MediaPlayer2",
    default_path = "/org/mpris/MediaPlayer2"
)]
trait MediaPlayer2 {
    #[dbus_proxy(property)]
    fn identity(&self) -> zbus::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    PlayerAppeared(PlayerRecord),
    PlayerVanished(PlayerId),
    StatusChanged(PlayerId, PlaybackStatus),
}

pub struct BusClient {
    conn: Connection,
    dbus: DBusProxy<'static>,
    signals: Select<MessageStream, MessageStream>,
    /// Unique owner name -> players it holds. Status signals from any other sender
    /// are dropped.
    owners: HashMap<String, Vec<PlayerId>>,
}

impl BusClient {
    pub async fn connect() -> Result<Self, BusError> {
        Self::with_connection(Connection::session().await?).await
    }

    /// Subscribes to player appear/vanish and status signals before anything is
    /// listed, so no player can slip in between enumeration and subscription.
    pub async fn with_connection(conn: Connection) -> Result<Self, BusError> {
        let dbus = DBusProxy::new(&conn).await?;
        let owner_changes = MessageStream::for_match_rule(
            MatchRule::try_from(NAME_OWNER_RULE)?,
            &conn,
            Some(SIGNAL_QUEUE),
        )
        .await?;
        let status_changes = MessageStream::for_match_rule(
            MatchRule::try_from(STATUS_RULE)?,
            &conn,
            Some(SIGNAL_QUEUE),
        )
        .await?;

        Ok(Self {
            conn,
            dbus,
            signals: stream::select(owner_changes, status_changes),
            owners: HashMap::new(),
        })
    }

    /// Every MPRIS player currently on the bus, with its status.
    ///
    /// A player whose status cannot be read is reported as `Unknown`.
    #[instrument(skip(self))]
    pub async fn list_players(&mut self) -> Result<Vec<PlayerRecord>, BusError> {
        let names = self.dbus.list_names().await?;
        let mut players = Vec::new();

        for name in names {
            let bus_name = name.as_str().to_owned();
            if !bus_name.starts_with(MPRIS_PREFIX) {
                continue;
            }
            let owner = match self.dbus.get_name_owner(name.into_inner()).await {
                Ok(owner) => owner.as_str().to_owned(),
                Err(e) => {
                    debug!("{bus_name} went away during enumeration: {e}");
                    continue;
                }
            };

            let id = PlayerId::new(bus_name, owner);
            self.subscribe(&id);
            players.push(self.record(id).await);
        }

        info!("found {} MPRIS player(s) on the session bus", players.len());
        Ok(players)
    }

    #[instrument(skip(self), fields(player = %id))]
    pub async fn query_status(&self, id: &PlayerId) -> Result<PlaybackStatus, QueryError> {
        let transport = |source| QueryError::Transport {
            player: id.to_string(),
            source,
        };

        let proxy = MediaPlayer2PlayerProxy::builder(&self.conn)
            .destination(id.owner().to_owned())
            .map_err(transport)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(transport)?;

        match proxy.playback_status().await {
            Ok(status) => Ok(PlaybackStatus::from(status.as_str())),
            Err(e) if is_missing_player(&e) => Err(QueryError::UnknownPlayer(id.to_string())),
            Err(source) => Err(transport(source)),
        }
    }

    /// The player's `Identity`, if it has a non-empty one.
    async fn identity(&self, id: &PlayerId) -> Option<String> {
        let proxy = MediaPlayer2Proxy::builder(&self.conn)
            .destination(id.owner().to_owned())
            .ok()?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .ok()?;

        match proxy.identity().await {
            Ok(name) if !name.trim().is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                debug!(player = %id, "no identity: {e}");
                None
            }
        }
    }

    /// Next signal from either subscription. Cancel safe, so it can sit in a
    /// `select!` next to other wake-ups. Returns `BusError::Disconnected` once the bus
    /// connection is gone.
    pub async fn recv(&mut self) -> Result<Arc<Message>, BusError> {
        loop {
            match self.signals.next().await {
                Some(Ok(msg)) => return Ok(msg),
                Some(Err(zbus::Error::InputOutput(e))) => {
                    warn!("session bus socket failed: {e}");
                    return Err(BusError::Disconnected);
                }
                Some(Err(e)) => warn!("dropping unreadable bus message: {e}"),
                None => return Err(BusError::Disconnected),
            }
        }
    }

    /// Turns one signal into player events, updating the tracked owners on the way.
    ///
    /// May query players; run it to completion.
    pub async fn events(&mut self, msg: &Message) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let Ok(hdr) = msg.header() else {
            return events;
        };
        if !matches!(hdr.message_type(), Ok(MessageType::Signal)) {
            return events;
        }

        let iface = hdr.interface().ok().flatten().map(|i| i.as_str().to_owned());
        let member = hdr.member().ok().flatten().map(|m| m.as_str().to_owned());

        match (iface.as_deref(), member.as_deref()) {
            (Some("org.freedesktop.DBus"), Some("NameOwnerChanged")) => {
                let Ok((name, old, new)) = msg.body::<(String, String, String)>() else {
                    return events;
                };
                if let Some(change) = OwnerChange::parse(&name, &old, &new) {
                    self.apply_owner_change(change, &mut events).await;
                }
            }
            (Some("org.freedesktop.DBus.Properties"), Some("PropertiesChanged")) => {
                let path = hdr.path().ok().flatten().map(|p| p.as_str().to_owned());
                if path.as_deref() != Some(MPRIS_PATH) {
                    return events;
                }
                let sender = hdr.sender().ok().flatten().map(|s| s.as_str().to_owned());
                let Some(ids) = sender.and_then(|s| self.owners.get(&s).cloned()) else {
                    trace!("PropertiesChanged from a sender we do not track");
                    return events;
                };
                let Ok((iface, changed, invalidated)) =
                    msg.body::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                else {
                    return events;
                };
                if iface != PLAYER_IFACE {
                    return events;
                }
                match status_change(&changed, &invalidated) {
                    StatusChange::Set(status) => {
                        events.extend(ids.into_iter().map(|id| BusEvent::StatusChanged(id, status)));
                    }
                    StatusChange::Invalidated => {
                        for id in ids {
                            let status = self.status_or_unknown(&id).await;
                            events.push(BusEvent::StatusChanged(id, status));
                        }
                    }
                    StatusChange::Unrelated => {}
                }
            }
            _ => {}
        }
        events
    }

    async fn apply_owner_change(&mut self, change: OwnerChange, events: &mut Vec<BusEvent>) {
        match change {
            OwnerChange::Appeared(id) => events.push(self.appeared(id).await),
            OwnerChange::Vanished(id) => events.push(self.vanished(id)),
            OwnerChange::Replaced { old, new } => {
                events.push(self.vanished(old));
                events.push(self.appeared(new).await);
            }
        }
    }

    async fn appeared(&mut self, id: PlayerId) -> BusEvent {
        debug!(player = %id, "name acquired");
        self.subscribe(&id);
        BusEvent::PlayerAppeared(self.record(id).await)
    }

    fn vanished(&mut self, id: PlayerId) -> BusEvent {
        debug!(player = %id, "name released");
        self.unsubscribe(&id);
        BusEvent::PlayerVanished(id)
    }

    fn subscribe(&mut self, id: &PlayerId) {
        let ids = self.owners.entry(id.owner().to_owned()).or_default();
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }

    fn unsubscribe(&mut self, id: &PlayerId) {
        if let Some(ids) = self.owners.get_mut(id.owner()) {
            ids.retain(|known| known != id);
            if ids.is_empty() {
                self.owners.remove(id.owner());
            }
        }
    }

    async fn record(&self, id: PlayerId) -> PlayerRecord {
        let status = self.status_or_unknown(&id).await;
        let identity = self.identity(&id).await;
        PlayerRecord {
            identity,
            ..PlayerRecord::new(id, status)
        }
    }

    async fn status_or_unknown(&self, id: &PlayerId) -> PlaybackStatus {
        self.query_status(id).await.unwrap_or_else(|e| {
            warn!("{e}; treating {} as not playing", id.short_name());
            PlaybackStatus::Unknown
        })
    }
}

/// The destination is gone, reported either as a raw method error or already mapped
/// to its `fdo` variant by the properties proxy.
fn is_missing_player(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::MethodError(name, _, _) => is_missing_name(name.as_str()),
        zbus::Error::FDO(e) => matches!(
            **e,
            fdo::Error::ServiceUnknown(_) | fdo::Error::NameHasNoOwner(_)
        ),
        _ => false,
    }
}

fn is_missing_name(error_name: &str) -> bool {
    matches!(
        error_name,
        "org.freedesktop.DBus.Error.ServiceUnknown" | "org.freedesktop.DBus.Error.NameHasNoOwner"
    )
}

#[derive(Debug, PartialEq, Eq)]
enum OwnerChange {
    Appeared(PlayerId),
    Vanished(PlayerId),
    Replaced { old: PlayerId, new: PlayerId },
}

impl OwnerChange {
    /// Interprets a `NameOwnerChanged(name, old_owner, new_owner)` signal. Empty owner
    /// strings mean "none".
    fn parse(name: &str, old: &str, new: &str) -> Option<Self> {
        if !name.starts_with(MPRIS_PREFIX) {
            return None;
        }
        match (old.is_empty(), new.is_empty()) {
            (true, false) => Some(Self::Appeared(PlayerId::new(name, new))),
            (false, true) => Some(Self::Vanished(PlayerId::new(name, old))),
            (false, false) if old != new => Some(Self::Replaced {
                old: PlayerId::new(name, old),
                new: PlayerId::new(name, new),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusChange {
    Set(PlaybackStatus),
    Invalidated,
    Unrelated,
}

fn status_change(changed: &HashMap<String, OwnedValue>, invalidated: &[String]) -> StatusChange {
    if let Some(value) = changed.get(PLAYBACK_STATUS) {
        let status = value
            .downcast_ref::<str>()
            .map_or(PlaybackStatus::Unknown, PlaybackStatus::from);
        return StatusChange::Set(status);
    }
    if invalidated.iter().any(|p| p == PLAYBACK_STATUS) {
        return StatusChange::Invalidated;
    }
    StatusChange::Unrelated
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;

    const MPV: &str = "org.mpris.MediaPlayer2.mpv";

    #[test]
    fn owner_change_appear_and_vanish() {
        assert_eq!(
            OwnerChange::parse(MPV, "", ":1.5"),
            Some(OwnerChange::Appeared(PlayerId::new(MPV, ":1.5")))
        );
        assert_eq!(
            OwnerChange::parse(MPV, ":1.5", ""),
            Some(OwnerChange::Vanished(PlayerId::new(MPV, ":1.5")))
        );
    }

    #[test]
    fn owner_change_handover_is_vanish_plus_appear() {
        assert_eq!(
            OwnerChange::parse(MPV, ":1.5", ":1.9"),
            Some(OwnerChange::Replaced {
                old: PlayerId::new(MPV, ":1.5"),
                new: PlayerId::new(MPV, ":1.9"),
            })
        );
    }

    #[test]
    fn owner_change_ignores_other_names_and_noise() {
        assert_eq!(OwnerChange::parse("org.freedesktop.Notifications", "", ":1.2"), None);
        assert_eq!(OwnerChange::parse(MPV, "", ""), None);
        assert_eq!(OwnerChange::parse(MPV, ":1.5", ":1.5"), None);
    }

    #[test]
    fn status_change_reads_playback_status() {
        let mut changed = HashMap::new();
        changed.insert(
            PLAYBACK_STATUS.to_owned(),
            OwnedValue::from(Value::from("Playing")),
        );
        assert_eq!(
            status_change(&changed, &[]),
            StatusChange::Set(PlaybackStatus::Playing)
        );
    }

    #[test]
    fn status_change_with_wrong_type_is_unknown() {
        let mut changed = HashMap::new();
        changed.insert(PLAYBACK_STATUS.to_owned(), OwnedValue::from(Value::from(3u32)));
        assert_eq!(
            status_change(&changed, &[]),
            StatusChange::Set(PlaybackStatus::Unknown)
        );
    }

    #[test]
    fn status_change_invalidated_and_unrelated() {
        let mut changed = HashMap::new();
        changed.insert("Volume".to_owned(), OwnedValue::from(Value::from(0.5f64)));

        assert_eq!(status_change(&changed, &[]), StatusChange::Unrelated);
        assert_eq!(
            status_change(&changed, &[PLAYBACK_STATUS.to_owned()]),
            StatusChange::Invalidated
        );
    }

    #[test]
    fn match_rules_parse() {
        let owners = MatchRule::try_from(NAME_OWNER_RULE).unwrap();
        assert_eq!(owners.member().map(|m| m.as_str()), Some("NameOwnerChanged"));

        let status = MatchRule::try_from(STATUS_RULE).unwrap();
        assert_eq!(status.member().map(|m| m.as_str()), Some("PropertiesChanged"));
        assert_eq!(
            status.interface().map(|i| i.as_str()),
            Some("org.freedesktop.DBus.Properties")
        );
    }

    #[test]
    fn missing_player_errors() {
        assert!(is_missing_name("org.freedesktop.DBus.Error.ServiceUnknown"));
        assert!(is_missing_name("org.freedesktop.DBus.Error.NameHasNoOwner"));
        assert!(!is_missing_name("org.freedesktop.DBus.Error.NoReply"));

        let mapped = zbus::Error::FDO(Box::new(fdo::Error::ServiceUnknown("gone".into())));
        assert!(is_missing_player(&mapped));
        let other = zbus::Error::FDO(Box::new(fdo::Error::NoReply("slow".into())));
        assert!(!is_missing_player(&other));
    }

    /// Tests against a throwaway `dbus-daemon`. Skipped when the binary is missing.
    mod live {
        use std::{
            fs,
            io::{BufRead, BufReader},
            process::{Child, Command, Stdio},
            time::Duration,
        };

        use tempfile::TempDir;
        use tokio::time::timeout;
        use zbus::{
            dbus_interface,
            fdo::{RequestNameFlags, RequestNameReply},
            names::WellKnownName,
            ConnectionBuilder,
        };

        use super::*;

        const VLC: &str = "org.mpris.MediaPlayer2.vlc";
        const WAIT: Duration = Duration::from_secs(10);

        struct PrivateBus {
            daemon: Child,
            address: String,
            _dir: TempDir,
        }

        impl PrivateBus {
            fn start() -> Option<Self> {
                let dir = tempfile::tempdir().ok()?;
                let config = dir.path().join("session.conf");
                fs::write(
                    &config,
                    format!(
                        r#"<busconfig>
  <type>session</type>
  <listen>unix:dir={}</listen>
  <auth>EXTERNAL</auth>
  <policy context="default">
    <allow send_destination="*" eavesdrop="true"/>
    <allow eavesdrop="true"/>
    <allow own="*"/>
  </policy>
</busconfig>
"#,
                        dir.path().display()
                    ),
                )
                .ok()?;

                let mut daemon = Command::new("dbus-daemon")
                    .arg(format!("--config-file={}", config.display()))
                    .arg("--nofork")
                    .arg("--print-address")
                    .stdout(Stdio::piped())
                    .spawn()
                    .ok()?;
                let mut address = String::new();
                BufReader::new(daemon.stdout.take()?)
                    .read_line(&mut address)
                    .ok()?;
                Some(Self {
                    daemon,
                    address: address.trim().to_owned(),
                    _dir: dir,
                })
            }

            async fn connect(&self) -> Connection {
                ConnectionBuilder::address(self.address.as_str())
                    .unwrap()
                    .build()
                    .await
                    .unwrap()
            }

            async fn client(&self) -> BusClient {
                BusClient::with_connection(self.connect().await).await.unwrap()
            }

            /// A connection serving the MPRIS root and player interfaces.
            async fn player(&self, status: &str) -> Connection {
                ConnectionBuilder::address(self.address.as_str())
                    .unwrap()
                    .serve_at(
                        MPRIS_PATH,
                        FakePlayer {
                            status: status.to_owned(),
                        },
                    )
                    .unwrap()
                    .serve_at(MPRIS_PATH, FakeRoot)
                    .unwrap()
                    .build()
                    .await
                    .unwrap()
            }
        }

        impl Drop for PrivateBus {
            fn drop(&mut self) {
                let _ = self.daemon.kill();
                let _ = self.daemon.wait();
            }
        }

        struct FakePlayer {
            status: String,
        }

        #[dbus_interface(name = "org.mpris.MediaPlayer2.Player")]
        impl FakePlayer {
            #[dbus_interface(property)]
            fn playback_status(&self) -> String {
                self.status.clone()
            }
        }

        struct FakeRoot;

        #[dbus_interface(name = "org.mpris.MediaPlayer2")]
        impl FakeRoot {
            #[dbus_interface(property)]
            fn identity(&self) -> String {
                "Fake Player".to_owned()
            }
        }

        async fn set_status(conn: &Connection, status: &str) {
            let iface = conn
                .object_server()
                .interface::<_, FakePlayer>(MPRIS_PATH)
                .await
                .unwrap();
            iface.get_mut().await.status = status.to_owned();
            iface
                .get()
                .await
                .playback_status_changed(iface.signal_context())
                .await
                .unwrap();
        }

        async fn own(conn: &Connection, name: &str, flags: RequestNameFlags) {
            let reply = DBusProxy::new(conn)
                .await
                .unwrap()
                .request_name(WellKnownName::try_from(name).unwrap(), flags.into())
                .await
                .unwrap();
            assert!(matches!(reply, RequestNameReply::PrimaryOwner));
        }

        fn owner(conn: &Connection) -> String {
            conn.unique_name().unwrap().to_string()
        }

        /// Reads signals until one of them yields events.
        async fn next_events(bus: &mut BusClient) -> Vec<BusEvent> {
            timeout(WAIT, async {
                loop {
                    let msg = bus.recv().await.unwrap();
                    let events = bus.events(&msg).await;
                    if !events.is_empty() {
                        return events;
                    }
                }
            })
            .await
            .expect("no player event arrived")
        }

        #[tokio::test]
        async fn enumerates_many_players_without_stalling() {
            let Some(bus) = PrivateBus::start() else {
                eprintln!("dbus-daemon not found, skipping");
                return;
            };
            let server = bus.player("Playing").await;
            for i in 0..40 {
                let name = format!("org.mpris.MediaPlayer2.fake{i}");
                server.request_name(name.as_str()).await.unwrap();
            }

            let mut client = bus.client().await;
            let players = timeout(WAIT, client.list_players())
                .await
                .expect("enumeration stalled")
                .unwrap();

            assert_eq!(players.len(), 40);
            assert!(players.iter().all(|p| p.status == PlaybackStatus::Playing));
            assert!(players.iter().all(|p| p.label() == "Fake Player"));
            assert_eq!(client.owners[&owner(&server)].len(), 40);
        }

        #[tokio::test]
        async fn follows_a_player_from_appear_to_vanish() {
            let Some(bus) = PrivateBus::start() else {
                eprintln!("dbus-daemon not found, skipping");
                return;
            };
            let mut client = bus.client().await;
            assert!(client.list_players().await.unwrap().is_empty());

            let server = bus.player("Paused").await;
            let unique = owner(&server);
            let id = PlayerId::new(MPV, unique.clone());
            server.request_name(MPV).await.unwrap();

            let mut appeared = PlayerRecord::new(id.clone(), PlaybackStatus::Paused);
            appeared.identity = Some("Fake Player".into());
            assert_eq!(
                next_events(&mut client).await,
                [BusEvent::PlayerAppeared(appeared)]
            );
            assert_eq!(client.owners[&unique], [id.clone()]);

            set_status(&server, "Playing").await;
            assert_eq!(
                next_events(&mut client).await,
                [BusEvent::StatusChanged(id.clone(), PlaybackStatus::Playing)]
            );

            server.release_name(MPV).await.unwrap();
            assert_eq!(
                next_events(&mut client).await,
                [BusEvent::PlayerVanished(id)]
            );
            assert!(client.owners.is_empty());

            // The connection outlives its name, and its status signals now go nowhere.
            set_status(&server, "Stopped").await;
            server.request_name(VLC).await.unwrap();
            let events = next_events(&mut client).await;
            assert!(
                matches!(&events[..], [BusEvent::PlayerAppeared(r)] if r.id == PlayerId::new(VLC, unique.clone())),
                "unexpected events {events:?}"
            );
        }

        #[tokio::test]
        async fn handover_reports_vanish_before_appear() {
            let Some(bus) = PrivateBus::start() else {
                eprintln!("dbus-daemon not found, skipping");
                return;
            };
            let first = bus.player("Playing").await;
            let second = bus.player("Paused").await;
            own(&first, MPV, RequestNameFlags::AllowReplacement).await;

            let mut client = bus.client().await;
            assert_eq!(client.list_players().await.unwrap().len(), 1);

            own(&second, MPV, RequestNameFlags::ReplaceExisting).await;
            let events = next_events(&mut client).await;

            assert_eq!(events.len(), 2, "unexpected events {events:?}");
            assert_eq!(
                events[0],
                BusEvent::PlayerVanished(PlayerId::new(MPV, owner(&first)))
            );
            assert!(matches!(
                &events[1],
                BusEvent::PlayerAppeared(r)
                    if r.id == PlayerId::new(MPV, owner(&second))
                        && r.status == PlaybackStatus::Paused
            ));
            assert!(!client.owners.contains_key(&owner(&first)));
            assert!(client.owners.contains_key(&owner(&second)));
        }

        #[tokio::test]
        async fn status_of_a_gone_owner_is_unknown() {
            let Some(bus) = PrivateBus::start() else {
                eprintln!("dbus-daemon not found, skipping");
                return;
            };
            let client = bus.client().await;
            let ghost = PlayerId::new("org.mpris.MediaPlayer2.ghost", ":1.9999");

            assert!(matches!(
                client.query_status(&ghost).await,
                Err(QueryError::UnknownPlayer(_))
            ));
            assert_eq!(client.status_or_unknown(&ghost).await, PlaybackStatus::Unknown);
            assert_eq!(client.identity(&ghost).await, None);
        }
    }
}
