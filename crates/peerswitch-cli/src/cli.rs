//! Clap CLI definitions for PeerSwitch.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  peerswitch run                     Serve handoff requests from other machines
  peerswitch peers                   List machines running PeerSwitch nearby
  peerswitch hosts add Desk desk-mac Register a handoff target
  peerswitch switch Desk             Move keyboard and mouse to Desk
  peerswitch devices                 Show paired input devices

\x1b[1;36mFiles:\x1b[0m
  ~/.peerswitch/config.toml          Configuration
  ~/.peerswitch/                     Hosts, trusted fingerprints, TLS identity";

/// PeerSwitch: hand paired keyboards and mice between machines on the LAN.
#[derive(Parser)]
#[command(name = "peerswitch", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Advertise this machine and serve handoff requests until Ctrl+C.
    Run,
    /// Hand every paired device off to (or pull them back from) a host.
    Switch {
        /// Host label, host name or identifier.
        host: String,
        /// Seconds to wait for the host to be discovered.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Browse the network and list discovered peers.
    Peers {
        /// Seconds to browse before listing.
        #[arg(long, default_value_t = 3)]
        secs: u64,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Send a health check to a registered host.
    Ping {
        host: String,
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Manage registered hosts [*].
    #[command(subcommand)]
    Hosts(HostsCommands),
    /// List paired input devices on this machine.
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Manage trusted peer certificates [*].
    #[command(subcommand)]
    Trust(TrustCommands),
}

#[derive(Subcommand)]
pub enum HostsCommands {
    /// List registered hosts.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Register a host by label and advertised host name.
    Add { label: String, host_name: String },
    /// Remove a registered host.
    Remove { host: String },
}

#[derive(Subcommand)]
pub enum TrustCommands {
    /// List trusted certificate fingerprints.
    List,
    /// Forget a trusted fingerprint so the peer is re-pinned on next contact.
    Forget { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_switch_with_default_wait() {
        let cli = Cli::try_parse_from(["peerswitch", "switch", "Desk"]).unwrap();
        match cli.command {
            Commands::Switch { host, wait } => {
                assert_eq!(host, "Desk");
                assert_eq!(wait, 10);
            }
            _ => panic!("expected switch"),
        }
    }

    #[test]
    fn parses_hosts_add() {
        let cli =
            Cli::try_parse_from(["peerswitch", "--config", "/tmp/c.toml", "hosts", "add", "Desk", "desk-mac"])
                .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/c.toml")));
        assert!(matches!(
            cli.command,
            Commands::Hosts(HostsCommands::Add { ref label, ref host_name })
                if label == "Desk" && host_name == "desk-mac"
        ));
    }
}
