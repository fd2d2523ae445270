//! PeerSwitch CLI: hand paired keyboards and mice between machines.
//!
//! Every networked subcommand boots an in-process node, does its work and
//! shuts the node down again. `run` keeps the node up until Ctrl+C.

mod blueutil;
mod cli;
mod cmd;
pub mod table;
mod ui;

use crate::cli::*;
use clap::Parser;
use peerswitch_kernel::config::load_config;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level.
fn init_tracing_stderr(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    match cli.command {
        Commands::Run => cmd::network::cmd_run(config),
        Commands::Switch { host, wait } => cmd::network::cmd_switch(config, &host, wait),
        Commands::Peers { secs, json } => cmd::network::cmd_peers(config, secs, json),
        Commands::Ping { host, wait } => cmd::network::cmd_ping(config, &host, wait),
        Commands::Hosts(sub) => match sub {
            HostsCommands::List { json } => cmd::hosts::cmd_hosts_list(&config, json),
            HostsCommands::Add { label, host_name } => {
                cmd::hosts::cmd_hosts_add(&config, &label, &host_name)
            }
            HostsCommands::Remove { host } => cmd::hosts::cmd_hosts_remove(&config, &host),
        },
        Commands::Devices { json } => cmd::devices::cmd_devices(&config, json),
        Commands::Trust(sub) => match sub {
            TrustCommands::List => cmd::trust::cmd_trust_list(&config),
            TrustCommands::Forget { id } => cmd::trust::cmd_trust_forget(&config, &id),
        },
    }
}
