//! Wiring (relay client, TCP connector, filesystem storage, multiplexer)
//! and the flows behind each subcommand.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use peerdrop_core::{Multiplexer, MultiplexerEvent, PeerEntry, PeerId, RoomType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Loaded, PairedDevice};
use crate::signaling::{SignalingClient, SignalingError};
use crate::storage::FsStorage;
use crate::transport::TcpConnector;

const CONNECT_WAIT: Duration = Duration::from_secs(15);
const STOP_WAIT: Duration = Duration::from_secs(5);
/// Reason sent when the accept policy turns a request down.
const DECLINED: &str = "declined";

pub struct Daemon {
    mux: Multiplexer,
    events: mpsc::UnboundedReceiver<MultiplexerEvent>,
    /// Taken once the relay client has been joined.
    signaling: Option<JoinHandle<Result<(), SignalingError>>>,
}

impl Daemon {
    pub fn start(loaded: &Loaded) -> anyhow::Result<Self> {
        let config = &loaded.config;
        let advertise_ip = match config.advertise_ip {
            Some(ip) => ip,
            None => outbound_ip().context("finding an address to advertise; set advertise_ip")?,
        };
        info!(relay = %config.server_url, %advertise_ip, root = %config.root.display(), "starting");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let client = SignalingClient::new(&config.server_url, config.discovery_mode, event_tx);
        let signaling = tokio::spawn(client.run(command_rx));

        let connector = Arc::new(TcpConnector::new(config.bind_ip, advertise_ip));
        let storage = Arc::new(FsStorage::new(&config.root));
        let (mux, events) =
            Multiplexer::spawn(config.engine(), connector, storage, command_tx, event_rx);
        Ok(Self {
            mux,
            events,
            signaling: Some(signaling),
        })
    }

    /// Next event; errors once the engine has stopped.
    async fn next_event(&mut self) -> anyhow::Result<MultiplexerEvent> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => Err(anyhow!("engine stopped")),
        }
    }

    /// Wait until the relay has assigned us an identity.
    async fn wait_connected(&mut self) -> anyhow::Result<PeerId> {
        let deadline = tokio::time::sleep(CONNECT_WAIT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => bail!("no answer from the relay after {CONNECT_WAIT:?}"),
                event = self.next_event() => {
                    if let MultiplexerEvent::Identity { peer_id, display_name } = event? {
                        info!(peer_id = %peer_id, name = %display_name, "connected to relay");
                        return Ok(peer_id);
                    }
                }
            }
        }
    }

    pub async fn stop(self) {
        if let Err(e) = self.mux.disconnect().await {
            debug!(error = %e, "engine already stopped");
        }
        let Some(signaling) = self.signaling else {
            return;
        };
        match tokio::time::timeout(STOP_WAIT, signaling).await {
            Ok(Ok(Err(e))) => warn!(error = %e, "relay client stopped"),
            Ok(_) => {}
            Err(_) => warn!("relay client did not stop in time"),
        }
    }
}

/// Resolves when the relay client exits on its own; pending once joined.
async fn relay_exited(signaling: &mut Option<JoinHandle<Result<(), SignalingError>>>) -> anyhow::Error {
    let Some(handle) = signaling.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *signaling = None;
    match result {
        Ok(Ok(())) => anyhow!("relay client stopped"),
        Ok(Err(e)) => e.into(),
        Err(e) => e.into(),
    }
}

/// Address of the interface used for outbound traffic. No packet is sent.
fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    Ok(socket.local_addr()?.ip())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Receive files until interrupted, applying the accept policy.
pub async fn listen(mut loaded: Loaded) -> anyhow::Result<()> {
    let mut daemon = Daemon::start(&loaded)?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let result = loop {
        let event = tokio::select! {
            r = &mut shutdown => break r,
            e = relay_exited(&mut daemon.signaling) => break Err(e),
            event = daemon.events.recv() => match event {
                Some(event) => event,
                None => break Err(anyhow!("engine stopped")),
            },
        };
        on_listen_event(&daemon.mux, &mut loaded, event).await;
    };
    daemon.stop().await;
    result
}

async fn on_listen_event(mux: &Multiplexer, loaded: &mut Loaded, event: MultiplexerEvent) {
    match event {
        MultiplexerEvent::ServerConnected => debug!("relay connected"),
        MultiplexerEvent::ServerDisconnected => warn!("relay connection lost"),
        MultiplexerEvent::Identity {
            peer_id,
            display_name,
        } => info!(peer_id = %peer_id, name = %display_name, "visible to peers"),
        MultiplexerEvent::PeerJoined(entry) => {
            info!(peer = %entry.info.id, name = %entry.info.display_name(), "peer joined")
        }
        MultiplexerEvent::PeerLeft(peer_id) => info!(peer = %peer_id, "peer left"),
        MultiplexerEvent::TransferRequest {
            peer_id,
            request,
            room_secret,
        } => {
            let files = request.header.len();
            let result = if loaded.config.auto_accepts(room_secret.as_deref()) {
                info!(peer = %peer_id, files, bytes = request.total_size, "accepting transfer");
                mux.accept_transfer(&peer_id).await
            } else {
                info!(peer = %peer_id, files, "declining transfer");
                mux.reject_transfer(&peer_id, Some(DECLINED.to_string())).await
            };
            if let Err(e) = result {
                warn!(peer = %peer_id, error = %e, "could not answer transfer request");
            }
        }
        MultiplexerEvent::ReceiveProgress { peer_id, progress } => debug!(
            peer = %peer_id,
            file = %progress.file_name,
            percent = progress.progress * 100.0,
            "receiving"
        ),
        MultiplexerEvent::FileReceived { peer_id, file } => {
            match mux.save_received_file(&file).await {
                Ok(path) => info!(peer = %peer_id, path = %path, "saved"),
                Err(e) => warn!(peer = %peer_id, file = %file.descriptor.name, error = %e, "save failed"),
            }
        }
        MultiplexerEvent::TransferComplete { peer_id, direction } => {
            info!(peer = %peer_id, ?direction, "transfer complete")
        }
        MultiplexerEvent::TransferCanceled { peer_id, direction } => {
            info!(peer = %peer_id, ?direction, "transfer canceled")
        }
        MultiplexerEvent::TextReceived { peer_id, text } => {
            info!(peer = %peer_id, "text received");
            println!("{peer_id}: {text}");
        }
        MultiplexerEvent::PairDeviceJoined {
            room_secret,
            peer_id,
        } => {
            if let Err(e) = record_pairing(mux, loaded, room_secret, &peer_id).await {
                warn!(error = %format!("{e:#}"), "could not save pairing");
            }
        }
        MultiplexerEvent::SecretRoomDeleted { room_secret } => {
            if loaded.config.remove_paired_device(&room_secret) {
                info!("paired device removed on the relay");
                if let Err(e) = loaded.config.save(&loaded.path) {
                    warn!(error = %format!("{e:#}"), "could not save config");
                }
            }
        }
        MultiplexerEvent::Error { peer_id, message } => {
            warn!(peer = %peer_id, error = %message, "session error")
        }
        other => debug!(?other, "event"),
    }
}

async fn record_pairing(
    mux: &Multiplexer,
    loaded: &mut Loaded,
    room_secret: String,
    peer_id: &PeerId,
) -> anyhow::Result<String> {
    let display_name = mux
        .peers()
        .await?
        .into_iter()
        .find(|p| &p.info.id == peer_id)
        .map(|p| p.info.display_name().to_string())
        .unwrap_or_else(|| peer_id.to_string());
    loaded.config.add_paired_device(PairedDevice {
        room_secret,
        display_name: display_name.clone(),
        paired_at: unix_now(),
        auto_accept: false,
    });
    loaded.config.save(&loaded.path)?;
    info!(name = %display_name, path = %loaded.path.display(), "paired");
    Ok(display_name)
}

fn matches_peer(entry: &PeerEntry, query: &str) -> bool {
    entry.info.id.as_str() == query || entry.info.display_name().eq_ignore_ascii_case(query)
}

/// Wait up to `wait` for a peer whose id or display name is `query`.
async fn find_peer(daemon: &mut Daemon, query: &str, wait: Duration) -> anyhow::Result<PeerId> {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        let peers = daemon.mux.peers().await?;
        if let Some(entry) = peers.iter().find(|e| matches_peer(e, query)) {
            return Ok(entry.info.id.clone());
        }
        tokio::select! {
            _ = &mut deadline => {
                let seen: Vec<_> = peers.iter().map(|e| e.info.display_name().to_string()).collect();
                bail!("peer {query:?} not found; visible: {}", seen.join(", "));
            }
            event = daemon.next_event() => { event?; }
        }
    }
}

/// Send files and folders to one peer; one batch for the files, one per folder.
pub async fn send(loaded: Loaded, peer: String, paths: Vec<PathBuf>, wait: Duration) -> anyhow::Result<()> {
    let mut files = Vec::new();
    let mut folders = Vec::new();
    for p in &paths {
        let abs = std::fs::canonicalize(p).with_context(|| format!("{}", p.display()))?;
        let path = abs.to_string_lossy().into_owned();
        if abs.is_dir() {
            folders.push(path);
        } else {
            files.push(path);
        }
    }

    let mut daemon = Daemon::start(&loaded)?;
    let result = send_batches(&mut daemon, &peer, files, folders, wait).await;
    daemon.stop().await;
    result?;
    println!("sent {} item(s) to {peer}", paths.len());
    Ok(())
}

async fn send_batches(
    daemon: &mut Daemon,
    peer: &str,
    files: Vec<String>,
    folders: Vec<String>,
    wait: Duration,
) -> anyhow::Result<()> {
    daemon.wait_connected().await?;
    let to = find_peer(daemon, peer, wait).await?;
    let mux = daemon.mux.clone();
    let batches = async move {
        if !files.is_empty() {
            mux.send_files_to_peer(&to, &files).await?;
        }
        for folder in &folders {
            mux.send_folder_to_peer(&to, folder).await?;
        }
        Ok::<_, peerdrop_core::MultiplexerError>(())
    };
    tokio::pin!(batches);
    loop {
        tokio::select! {
            r = &mut batches => return r.with_context(|| format!("sending to {peer}")),
            event = daemon.next_event() => match event? {
                MultiplexerEvent::SendProgress { progress, .. } => debug!(
                    file = %progress.file_name,
                    percent = progress.progress * 100.0,
                    "sending"
                ),
                MultiplexerEvent::TransferRequest { peer_id, .. } => {
                    if let Err(e) = daemon.mux.reject_transfer(&peer_id, Some(DECLINED.to_string())).await {
                        debug!(error = %e, "could not decline");
                    }
                }
                other => debug!(?other, "event"),
            },
        }
    }
}

/// Pair with another device: show a key, or join with one.
pub async fn pair(mut loaded: Loaded, join: Option<String>) -> anyhow::Result<()> {
    let mut daemon = Daemon::start(&loaded)?;
    let result = run_pairing(&mut daemon, &mut loaded, join).await;
    daemon.stop().await;
    result
}

async fn run_pairing(daemon: &mut Daemon, loaded: &mut Loaded, join: Option<String>) -> anyhow::Result<()> {
    daemon.wait_connected().await?;
    match &join {
        Some(key) => daemon.mux.pair_device_join(key)?,
        None => daemon.mux.pair_device_initiate()?,
    }
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let event = tokio::select! {
            r = &mut shutdown => {
                r?;
                daemon.mux.pair_device_cancel()?;
                bail!("pairing canceled");
            }
            event = daemon.next_event() => event?,
        };
        match event {
            MultiplexerEvent::PairDeviceInitiated { pair_key, .. } => {
                println!("pair key: {pair_key}");
                println!("enter it on the other device, or run `peerdrop pair --join {pair_key}`");
            }
            MultiplexerEvent::PairDeviceJoined {
                room_secret,
                peer_id,
            } => {
                let name = record_pairing(&daemon.mux, loaded, room_secret, &peer_id).await?;
                println!("paired with {name}");
                return Ok(());
            }
            MultiplexerEvent::PairDeviceJoinKeyInvalid => bail!("pair key is invalid or expired"),
            MultiplexerEvent::PairDeviceCanceled => bail!("pairing was canceled"),
            other => debug!(?other, "event"),
        }
    }
}

/// Forget a paired device here and on the relay.
pub async fn unpair(mut loaded: Loaded, name: String) -> anyhow::Result<()> {
    let device = loaded
        .config
        .paired_devices
        .iter()
        .find(|d| d.room_secret == name || d.display_name.eq_ignore_ascii_case(&name))
        .cloned()
        .ok_or_else(|| anyhow!("no paired device {name:?}"))?;
    loaded.config.remove_paired_device(&device.room_secret);
    loaded.config.save(&loaded.path)?;

    let mut daemon = Daemon::start(&loaded)?;
    let result = forget_on_relay(&mut daemon, &device.room_secret).await;
    daemon.stop().await;
    result?;
    println!("unpaired {}", device.display_name);
    Ok(())
}

async fn forget_on_relay(daemon: &mut Daemon, room_secret: &str) -> anyhow::Result<()> {
    daemon.wait_connected().await?;
    daemon.mux.delete_room_secret(room_secret)?;
    Ok(())
}

/// Print the peers visible after `wait`.
pub async fn peers(loaded: Loaded, wait: Duration) -> anyhow::Result<()> {
    let mut daemon = Daemon::start(&loaded)?;
    let result = list_peers(&mut daemon, &loaded, wait).await;
    daemon.stop().await;
    result
}

async fn list_peers(daemon: &mut Daemon, loaded: &Loaded, wait: Duration) -> anyhow::Result<()> {
    let me = daemon.wait_connected().await?;
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = daemon.next_event() => { event?; }
        }
    }
    let peers = daemon.mux.peers().await?;
    println!("you are {me}");
    if peers.is_empty() {
        println!("no peers visible");
    }
    for entry in peers {
        let room = match entry.room.room_type {
            RoomType::Open => "same network",
            RoomType::Secret => loaded
                .config
                .paired_device(&entry.room.room_id)
                .map(|d| d.display_name.as_str())
                .unwrap_or("paired"),
        };
        println!("{}\t{}\t({room})", entry.info.id, entry.info.display_name());
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_core::RoomMembership;

    fn entry(id: &str, name: &str) -> PeerEntry {
        PeerEntry {
            info: serde_json::from_value(serde_json::json!({
                "id": id,
                "name": {"displayName": name},
                "rtcSupported": true
            }))
            .unwrap(),
            room: RoomMembership::open("10.0.0.1"),
            rooms: vec![RoomMembership::open("10.0.0.1")],
        }
    }

    #[test]
    fn peers_match_by_id_or_name() {
        let e = entry("abc-123", "Blue Fox");
        assert!(matches_peer(&e, "abc-123"));
        assert!(matches_peer(&e, "blue fox"));
        assert!(!matches_peer(&e, "Blue"));
    }

    #[test]
    fn outbound_ip_is_not_unspecified() {
        if let Ok(ip) = outbound_ip() {
            assert!(!ip.is_unspecified());
        }
    }
}
