// PeerDrop for Linux: relay signaling client, direct TCP data channel, file transfer daemon.

mod config;
mod daemon;
mod signaling;
mod storage;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "peerdrop", version, about = "Share files with nearby and paired devices")]
struct Cli {
    /// Config file (default ~/.config/peerdrop/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Relay server, overriding the config file.
    #[arg(long, global = true)]
    server: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stay online and receive files.
    Listen,
    /// Send files or folders to a peer, by id or display name.
    Send {
        peer: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Seconds to wait for the peer to appear.
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Pair with another device so it can find this one anywhere.
    Pair {
        /// Join using the key shown on the other device.
        #[arg(long)]
        join: Option<String>,
    },
    /// Forget a paired device, by name or room secret.
    Unpair { device: String },
    /// List visible peers.
    Peers {
        /// Seconds to collect announcements.
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut loaded = config::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        loaded.config.server_url = server;
    }
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(loaded.config.log_level.as_str()),
    )
    .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Listen => daemon::listen(loaded).await,
            Command::Send { peer, paths, wait } => {
                daemon::send(loaded, peer, paths, Duration::from_secs(wait)).await
            }
            Command::Pair { join } => daemon::pair(loaded, join).await,
            Command::Unpair { device } => daemon::unpair(loaded, device).await,
            Command::Peers { wait } => daemon::peers(loaded, Duration::from_secs(wait)).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_takes_peer_and_paths() {
        let cli = Cli::try_parse_from(["peerdrop", "--server", "ws://localhost:3000", "send", "Blue Fox", "a.txt", "photos"])
            .unwrap();
        assert_eq!(cli.server.as_deref(), Some("ws://localhost:3000"));
        match cli.command {
            Command::Send { peer, paths, wait } => {
                assert_eq!(peer, "Blue Fox");
                assert_eq!(paths.len(), 2);
                assert_eq!(wait, 30);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["peerdrop", "send", "Blue Fox"]).is_err());
    }
}
