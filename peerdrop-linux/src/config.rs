//! Load config from file and environment; persist paired devices back.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// How this device shows up on the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Join the public-IP room and paired devices' rooms.
    #[default]
    Auto,
    /// Only paired devices can see us.
    PairedOnly,
}

/// Which incoming transfer requests the daemon accepts on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptPolicy {
    Always,
    /// Requests arriving through a paired device's room.
    #[default]
    Paired,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairedDevice {
    pub room_secret: String,
    pub display_name: String,
    /// Unix seconds.
    #[serde(default)]
    pub paired_at: u64,
    /// Accept from this device even when the policy says otherwise.
    #[serde(default)]
    pub auto_accept: bool,
}

/// Daemon configuration. File: ~/.config/peerdrop/config.toml or /etc/peerdrop/config.toml.
/// Env overrides: PEERDROP_SERVER_URL, PEERDROP_ROOT, PEERDROP_SAVE_LOCATION,
/// PEERDROP_DISCOVERY_MODE, PEERDROP_ACCEPT, PEERDROP_ADVERTISE_IP, PEERDROP_LOG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay server (default wss://pairdrop.net).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Directory relative storage paths resolve under (default $HOME).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Folder under `root` received files are saved to.
    #[serde(default = "default_save_location")]
    pub save_location: String,
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,
    #[serde(default)]
    pub accept: AcceptPolicy,
    /// env_logger filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Address data channel listeners bind to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Address written into offers; defaults to the outbound interface address.
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,
    #[serde(default)]
    pub paired_devices: Vec<PairedDevice>,
}

fn default_server_url() -> String {
    "wss://pairdrop.net".to_string()
}
fn default_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_save_location() -> String {
    peerdrop_core::config::DEFAULT_SAVE_LOCATION.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            root: default_root(),
            save_location: default_save_location(),
            discovery_mode: DiscoveryMode::default(),
            accept: AcceptPolicy::default(),
            log_level: default_log_level(),
            bind_ip: default_bind_ip(),
            advertise_ip: None,
            paired_devices: Vec::new(),
        }
    }
}

impl Config {
    /// Engine settings derived from this config.
    pub fn engine(&self) -> peerdrop_core::Config {
        peerdrop_core::Config {
            save_location: self.save_location.clone(),
            room_secrets: self.room_secrets(),
            ..peerdrop_core::Config::default()
        }
    }

    pub fn room_secrets(&self) -> Vec<String> {
        self.paired_devices
            .iter()
            .map(|d| d.room_secret.clone())
            .collect()
    }

    pub fn paired_device(&self, room_secret: &str) -> Option<&PairedDevice> {
        self.paired_devices
            .iter()
            .find(|d| d.room_secret == room_secret)
    }

    /// Whether a request arriving through `room_secret` (if any) is accepted unattended.
    pub fn auto_accepts(&self, room_secret: Option<&str>) -> bool {
        let paired = room_secret.and_then(|s| self.paired_device(s));
        match (self.accept, paired) {
            (AcceptPolicy::Always, _) => true,
            (_, Some(device)) if device.auto_accept => true,
            (AcceptPolicy::Paired, Some(_)) => true,
            _ => false,
        }
    }

    /// Record a pairing; replaces an entry with the same secret.
    pub fn add_paired_device(&mut self, device: PairedDevice) {
        self.paired_devices
            .retain(|d| d.room_secret != device.room_secret);
        self.paired_devices.push(device);
    }

    /// Returns whether an entry was removed.
    pub fn remove_paired_device(&mut self, room_secret: &str) -> bool {
        let before = self.paired_devices.len();
        self.paired_devices.retain(|d| d.room_secret != room_secret);
        before != self.paired_devices.len()
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PEERDROP_SERVER_URL") {
            self.server_url = s;
        }
        if let Some(s) = var("PEERDROP_ROOT") {
            self.root = PathBuf::from(s);
        }
        if let Some(s) = var("PEERDROP_SAVE_LOCATION") {
            self.save_location = s;
        }
        if let Some(s) = var("PEERDROP_DISCOVERY_MODE") {
            match s.as_str() {
                "auto" => self.discovery_mode = DiscoveryMode::Auto,
                "paired-only" => self.discovery_mode = DiscoveryMode::PairedOnly,
                _ => {}
            }
        }
        if let Some(s) = var("PEERDROP_ACCEPT") {
            match s.as_str() {
                "always" => self.accept = AcceptPolicy::Always,
                "paired" => self.accept = AcceptPolicy::Paired,
                "never" => self.accept = AcceptPolicy::Never,
                _ => {}
            }
        }
        if let Some(s) = var("PEERDROP_ADVERTISE_IP") {
            if let Ok(ip) = s.parse::<IpAddr>() {
                self.advertise_ip = Some(ip);
            }
        }
        if let Some(s) = var("PEERDROP_LOG") {
            self.log_level = s;
        }
    }

    /// Write the config as TOML, creating the parent directory.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let text = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// A loaded config and the file it is saved back to.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub path: PathBuf,
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must parse if it exists; the default locations are
/// skipped when unreadable.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Loaded> {
    let (mut config, path) = match explicit {
        Some(p) => (read_file(p)?.unwrap_or_default(), p.to_path_buf()),
        None => load_default(),
    };
    config.apply_env(|k| std::env::var(k).ok());
    Ok(Loaded { config, path })
}

fn read_file(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(c))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerdrop/config.toml"));
    out
}

fn load_default() -> (Config, PathBuf) {
    let paths = config_paths();
    for p in &paths {
        if p.exists() {
            match read_file(p) {
                Ok(Some(c)) => return (c, p.clone()),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "ignoring config file"),
            }
            break;
        }
    }
    (Config::default(), paths[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn device(secret: &str, auto_accept: bool) -> PairedDevice {
        PairedDevice {
            room_secret: secret.into(),
            display_name: "Phone".into(),
            paired_at: 1_700_000_000,
            auto_accept,
        }
    }

    #[test]
    fn file_fields_and_defaults() {
        let c: Config = toml::from_str(
            r#"
            server_url = "https://drop.example.com"
            discovery_mode = "paired-only"

            [[paired_devices]]
            room_secret = "s1"
            display_name = "Laptop"
            "#,
        )
        .unwrap();
        assert_eq!(c.server_url, "https://drop.example.com");
        assert_eq!(c.discovery_mode, DiscoveryMode::PairedOnly);
        assert_eq!(c.accept, AcceptPolicy::Paired);
        assert_eq!(c.save_location, "PeerDrop");
        assert_eq!(c.room_secrets(), vec!["s1"]);
        assert!(!c.paired_devices[0].auto_accept);
        assert_eq!(c.engine().room_secrets, vec!["s1"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("PEERDROP_SERVER_URL", "ws://localhost:3000"),
            ("PEERDROP_ACCEPT", "never"),
            ("PEERDROP_DISCOVERY_MODE", "bogus"),
            ("PEERDROP_ADVERTISE_IP", "192.168.1.20"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.server_url, "ws://localhost:3000");
        assert_eq!(c.accept, AcceptPolicy::Never);
        assert_eq!(c.discovery_mode, DiscoveryMode::Auto);
        assert_eq!(c.advertise_ip, Some("192.168.1.20".parse().unwrap()));
    }

    #[test]
    fn accept_policy() {
        let mut c = Config::default();
        c.add_paired_device(device("s1", false));
        c.add_paired_device(device("s2", true));
        assert!(c.auto_accepts(Some("s1")));
        assert!(!c.auto_accepts(None));
        assert!(!c.auto_accepts(Some("unknown")));

        c.accept = AcceptPolicy::Never;
        assert!(!c.auto_accepts(Some("s1")));
        assert!(c.auto_accepts(Some("s2")));

        c.accept = AcceptPolicy::Always;
        assert!(c.auto_accepts(None));
    }

    #[test]
    fn pairing_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut c = Config::default();
        c.add_paired_device(device("s1", false));
        c.add_paired_device(device("s1", true));
        assert_eq!(c.paired_devices.len(), 1);
        c.save(&path).unwrap();

        let mut loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.config.paired_devices, c.paired_devices);
        assert!(loaded.config.remove_paired_device("s1"));
        assert!(!loaded.config.remove_paired_device("s1"));
    }

    #[test]
    fn missing_explicit_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.config.server_url, "wss://pairdrop.net");
    }
}
