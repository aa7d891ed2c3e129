//! Inhibit coordinator (companion process)
//!
//! Runs unprivileged in the user's session and feeds the controller two
//! kinds of veto signal over the local socket:
//!
//! - `inhibit` while the session manager reports held inhibitors. There is
//!   no release message in the protocol; the token is re-sent once per
//!   second (and immediately on any set change) so the controller can rely
//!   on polling cadence alone.
//! - `notify` whenever a desktop notification is observed on the session
//!   bus. Observation uses a second, private bus connection switched into
//!   monitor mode; a monitor only watches and structurally never answers
//!   the calls it sees.
//!
//! The socket client is deliberately forgiving: connect failures and
//! disconnects are ordinary (the controller may simply not be up yet) and
//! retried on a fixed one-second delay, forever.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use futures_lite::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::Instant;
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy, Connection, MessageStream};

use crate::protocol::Token;
use crate::signals::SignalBridge;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const PRESENCE_INTERVAL: Duration = Duration::from_secs(1);

/// Match rule for observing desktop notifications bus-wide
const MONITOR_RULE: &str = "type='method_call',\
                            member='Notify',\
                            path='/org/freedesktop/Notifications',\
                            interface='org.freedesktop.Notifications'";

#[derive(Debug, thiserror::Error)]
pub enum InhibitError {
    #[error("D-Bus failure: {0}")]
    Dbus(#[from] zbus::Error),
}

#[proxy(
    interface = "org.gnome.SessionManager",
    default_service = "org.gnome.SessionManager",
    default_path = "/org/gnome/SessionManager"
)]
pub trait SessionManager {
    /// Full list of currently held inhibitors
    fn get_inhibitors(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    #[zbus(signal)]
    fn inhibitor_added(&self, inhibitor: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    fn inhibitor_removed(&self, inhibitor: OwnedObjectPath) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.DBus.Monitoring",
    default_service = "org.freedesktop.DBus",
    default_path = "/org/freedesktop/DBus"
)]
pub trait Monitoring {
    fn become_monitor(&self, rules: &[&str], flags: u32) -> zbus::Result<()>;
}

/// Open a private session-bus connection and switch it into monitor mode,
/// watching Notify calls. The returned stream yields every observed call.
pub async fn monitor_notifications() -> Result<MessageStream, InhibitError> {
    let connection = zbus::connection::Builder::session()?.build().await?;

    let monitoring = MonitoringProxy::new(&connection).await?;
    monitoring.become_monitor(&[MONITOR_RULE], 0).await?;

    Ok(MessageStream::from(&connection))
}

/// True for the method calls our monitor rule matches
fn is_notify_call(msg: &zbus::Message) -> bool {
    let header = msg.header();
    header.message_type() == zbus::message::Type::MethodCall
        && header.interface().map(|i| i.as_str()) == Some("org.freedesktop.Notifications")
        && header.member().map(|m| m.as_str()) == Some("Notify")
}

/// Tracks the session inhibitor set and relays veto tokens to the controller
pub struct InhibitCoordinator {
    socket_path: PathBuf,
    inhibitors: HashSet<String>,
    socket: Option<UnixStream>,
    retry_at: Option<Instant>,
}

impl InhibitCoordinator {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            inhibitors: HashSet::new(),
            socket: None,
            retry_at: None,
        }
    }

    fn add_inhibitor(&mut self, path: String) {
        log::info!("inhibitor added: {}", path);
        self.inhibitors.insert(path);
    }

    fn remove_inhibitor(&mut self, path: &str) {
        log::info!("inhibitor removed: {}", path);
        self.inhibitors.remove(path);
    }

    fn inhibited(&self) -> bool {
        !self.inhibitors.is_empty()
    }

    async fn connect(&mut self) {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                log::info!("connected to controller socket");
                self.socket = Some(stream);
                self.retry_at = None;
            }
            Err(e) => {
                log::debug!("controller socket unavailable ({}), will retry", e);
                self.socket = None;
                self.retry_at = Some(Instant::now() + RETRY_DELAY);
            }
        }
    }

    async fn send(&mut self, token: Token) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        log::debug!("sending {:?}", token);
        if let Err(e) = socket.write_all(token.as_line().as_bytes()).await {
            log::debug!("socket write failed ({}), reconnecting", e);
            self.socket = None;
            self.retry_at = Some(Instant::now() + RETRY_DELAY);
        }
    }

    async fn send_if_inhibited(&mut self) {
        if self.inhibited() {
            self.send(Token::Inhibit).await;
        }
    }

    /// Drive the coordinator until termination is requested
    pub async fn run(
        mut self,
        session: &Connection,
        mut monitor: MessageStream,
        mut term: SignalBridge,
    ) -> Result<(), InhibitError> {
        let manager = SessionManagerProxy::new(session).await?;
        let mut added = manager.receive_inhibitor_added().await?;
        let mut removed = manager.receive_inhibitor_removed().await?;

        // Seed with whatever is already held; notifications keep us current
        // from here on
        match manager.get_inhibitors().await {
            Ok(list) => {
                for path in list {
                    self.inhibitors.insert(path.to_string());
                }
                log::info!("seeded {} inhibitor(s)", self.inhibitors.len());
            }
            Err(e) => log::warn!("GetInhibitors failed: {}", e),
        }

        let mut presence = tokio::time::interval(PRESENCE_INTERVAL);
        self.connect().await;

        loop {
            let retry = sleep_until_opt(self.retry_at);

            tokio::select! {
                _ = presence.tick() => self.send_if_inhibited().await,

                _ = retry => self.connect().await,

                Some(signal) = added.next() => match signal.args() {
                    Ok(args) => {
                        self.add_inhibitor(args.inhibitor().to_string());
                        self.send_if_inhibited().await;
                        presence.reset();
                    }
                    Err(e) => log::warn!("malformed InhibitorAdded signal: {}", e),
                },

                Some(signal) = removed.next() => match signal.args() {
                    Ok(args) => {
                        self.remove_inhibitor(args.inhibitor().as_str());
                        self.send_if_inhibited().await;
                        presence.reset();
                    }
                    Err(e) => log::warn!("malformed InhibitorRemoved signal: {}", e),
                },

                Some(msg) = monitor.next() => match msg {
                    Ok(msg) if is_notify_call(&msg) => self.send(Token::Notify).await,
                    Ok(_) => {}
                    Err(e) => log::warn!("monitor stream error: {}", e),
                },

                _ = term.recv() => {
                    log::info!("termination requested");
                    return Ok(());
                }
            }
        }
    }
}

/// Sleep until `deadline`, or forever when no retry is pending
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inhibitor_set_tracks_add_and_remove() {
        let mut coordinator = InhibitCoordinator::new(PathBuf::from("/tmp/unused"));
        assert!(!coordinator.inhibited());

        coordinator.add_inhibitor("/org/gnome/SessionManager/Inhibitor1".into());
        coordinator.add_inhibitor("/org/gnome/SessionManager/Inhibitor2".into());
        assert!(coordinator.inhibited());

        // Duplicate adds collapse
        coordinator.add_inhibitor("/org/gnome/SessionManager/Inhibitor1".into());
        assert_eq!(coordinator.inhibitors.len(), 2);

        coordinator.remove_inhibitor("/org/gnome/SessionManager/Inhibitor1");
        assert!(coordinator.inhibited());
        coordinator.remove_inhibitor("/org/gnome/SessionManager/Inhibitor2");
        assert!(!coordinator.inhibited());
    }

    #[test]
    fn removing_an_unknown_inhibitor_is_harmless() {
        let mut coordinator = InhibitCoordinator::new(PathBuf::from("/tmp/unused"));
        coordinator.remove_inhibitor("/org/gnome/SessionManager/Inhibitor9");
        assert!(!coordinator.inhibited());
    }

    #[tokio::test]
    async fn send_without_a_connection_is_a_noop() {
        let mut coordinator = InhibitCoordinator::new(PathBuf::from("/tmp/unused"));
        coordinator.send(Token::Notify).await;
        assert!(coordinator.socket.is_none());
        assert!(coordinator.retry_at.is_none());
    }

    #[tokio::test]
    async fn failed_connect_schedules_a_retry() {
        let mut coordinator =
            InhibitCoordinator::new(PathBuf::from("/tmp/sleepwalkd-no-such-socket"));
        coordinator.connect().await;
        assert!(coordinator.socket.is_none());
        assert!(coordinator.retry_at.is_some());
    }

    #[tokio::test]
    async fn tokens_reach_the_listening_controller() {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::UnixListener;

        let path = PathBuf::from(format!("/tmp/sleepwalkd-inh-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let mut coordinator = InhibitCoordinator::new(path.clone());
        coordinator.connect().await;
        assert!(coordinator.socket.is_some());

        coordinator.add_inhibitor("/i/1".into());
        coordinator.send_if_inhibited().await;
        coordinator.send(Token::Notify).await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "inhibit");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "notify");

        let _ = std::fs::remove_file(&path);
    }
}
