//! WiFi link implementations
//!
//! - [`SysfsWifiLink`] watches a Linux interface through
//!   `/sys/class/net/<iface>/operstate` and runs configured commands to
//!   reconnect or disconnect it.
//! - [`StaticLink`] is for hosts whose network is not managed by the node
//!   (wired boards, containers). It reports the link up once at startup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LinkEvent, WifiLink};
use crate::config::WifiConfig;

const SYSFS_NET: &str = "/sys/class/net";

pub struct SysfsWifiLink {
    interface: String,
    connected: Arc<AtomicBool>,
    reconnect_command: Vec<String>,
    disconnect_command: Vec<String>,
    cancel: CancellationToken,
}

impl SysfsWifiLink {
    /// Starts watching `interface` and reports transitions on `events`
    pub fn spawn(
        interface: String,
        config: &WifiConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let mut operstate = PathBuf::from(SYSFS_NET);
        operstate.push(&interface);
        operstate.push("operstate");
        Self::spawn_with_state_file(interface, operstate, config, events)
    }

    pub(crate) fn spawn_with_state_file(
        interface: String,
        operstate: PathBuf,
        config: &WifiConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        info!("Watching link state of {} at {}", interface, operstate.display());
        tokio::spawn(watch_operstate(
            operstate,
            Duration::from_millis(config.poll_interval_ms.max(10)),
            connected.clone(),
            events,
            cancel.clone(),
        ));

        SysfsWifiLink {
            interface,
            connected,
            reconnect_command: config.reconnect_command.clone(),
            disconnect_command: config.disconnect_command.clone(),
            cancel,
        }
    }
}

async fn read_link_up(operstate: &Path) -> bool {
    match tokio::fs::read_to_string(operstate).await {
        Ok(state) => state.trim() == "up",
        Err(e) => {
            debug!("Could not read {}: {}", operstate.display(), e);
            false
        }
    }
}

async fn watch_operstate(
    operstate: PathBuf,
    interval: Duration,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last_up = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let up = read_link_up(&operstate).await;
        if up == last_up {
            continue;
        }
        last_up = up;
        connected.store(up, Ordering::SeqCst);

        let event = if up {
            LinkEvent::WifiConnected
        } else {
            LinkEvent::WifiDisconnected
        };
        debug!("Link state changed: {:?}", event);
        if events.send(event).await.is_err() {
            error!("Event channel closed, stopping link watcher");
            break;
        }
    }
    debug!("Link watcher for {} stopped", operstate.display());
}

fn run_command(label: &'static str, command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        debug!("No {} command configured", label);
        return;
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    let shown = command.join(" ");
    tokio::spawn(async move {
        match cmd.status().await {
            Ok(status) if status.success() => debug!("{} command '{}' finished", label, shown),
            Ok(status) => warn!("{} command '{}' exited with {}", label, shown, status),
            Err(e) => error!("Failed to run {} command '{}': {}", label, shown, e),
        }
    });
}

impl WifiLink for SysfsWifiLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&mut self) {
        info!("[wifi] Reconnecting {}", self.interface);
        run_command("reconnect", &self.reconnect_command);
    }

    fn disconnect(&mut self) {
        info!("[wifi] Disconnecting {}", self.interface);
        run_command("disconnect", &self.disconnect_command);
    }

    fn detach(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for SysfsWifiLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct StaticLink {
    connected: bool,
}

impl StaticLink {
    /// Reports the link up on `events` right away
    pub fn spawn(events: mpsc::Sender<LinkEvent>) -> Self {
        tokio::spawn(async move {
            if events.send(LinkEvent::WifiConnected).await.is_err() {
                error!("Event channel closed before link came up");
            }
        });
        StaticLink { connected: true }
    }
}

impl WifiLink for StaticLink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reconnect(&mut self) {
        debug!("[wifi] Static link, nothing to reconnect");
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn detach(&mut self) {}
}

/// Picks the link implementation for this host
pub fn spawn_link(config: &WifiConfig, events: mpsc::Sender<LinkEvent>) -> Box<dyn WifiLink + Send> {
    match &config.interface {
        Some(interface) => Box::new(SysfsWifiLink::spawn(interface.clone(), config, events)),
        None => {
            info!("No WiFi interface configured, treating link as always up");
            Box::new(StaticLink::spawn(events))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> WifiConfig {
        WifiConfig {
            poll_interval_ms: 10,
            ..WifiConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no link event in time")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn sysfs_link_reports_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let operstate = dir.path().join("operstate");
        tokio::fs::write(&operstate, "down\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let link = SysfsWifiLink::spawn_with_state_file(
            "wlan0".to_string(),
            operstate.clone(),
            &fast_config(),
            tx,
        );
        assert!(!link.is_connected());

        tokio::fs::write(&operstate, "up\n").await.unwrap();
        assert!(matches!(next_event(&mut rx).await, LinkEvent::WifiConnected));
        assert!(link.is_connected());

        tokio::fs::write(&operstate, "down\n").await.unwrap();
        assert!(matches!(next_event(&mut rx).await, LinkEvent::WifiDisconnected));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn detached_link_stops_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let operstate = dir.path().join("operstate");
        tokio::fs::write(&operstate, "down\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut link = SysfsWifiLink::spawn_with_state_file(
            "wlan0".to_string(),
            operstate.clone(),
            &fast_config(),
            tx,
        );
        link.detach();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::fs::write(&operstate, "up\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_runs_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        let operstate = dir.path().join("operstate");
        let marker = dir.path().join("reconnected");

        let config = WifiConfig {
            reconnect_command: vec!["touch".to_string(), marker.display().to_string()],
            ..fast_config()
        };
        let (tx, _rx) = mpsc::channel(8);
        let mut link =
            SysfsWifiLink::spawn_with_state_file("wlan0".to_string(), operstate, &config, tx);

        link.reconnect();
        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn static_link_comes_up_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut link = StaticLink::spawn(tx);

        assert!(matches!(next_event(&mut rx).await, LinkEvent::WifiConnected));
        assert!(link.is_connected());

        link.disconnect();
        assert!(!link.is_connected());
    }
}
