use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::snapshot::Pid;
use crate::workload::WorkloadConfig;

pub const DEFAULT_REGISTRY: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1099);
pub const DEFAULT_START_PORT: u16 = 60001;

/// Run a mesh of peers and take a Chandy-Lamport snapshot of it
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct RootCommand {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the name service peers register with
    Registry(RegistryArgs),
    /// Spawn TCP peers in this process, register them and run the workload
    Run(RunArgs),
    /// Run the workload over an in-process directory
    Local(WorkloadArgs),
}

#[derive(Debug, Args)]
pub struct RegistryArgs {
    /// Address to listen on
    #[arg(long, env = "SNAPMESH_REGISTRY", default_value_t = DEFAULT_REGISTRY)]
    pub listen: SocketAddr,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Address of the registry
    #[arg(long, env = "SNAPMESH_REGISTRY", default_value_t = DEFAULT_REGISTRY)]
    pub registry: SocketAddr,

    /// Host the peers listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port of peer 0; peer i listens on start_port + i
    #[arg(long, default_value_t = DEFAULT_START_PORT)]
    pub start_port: u16,

    /// Bound on registry requests, connects and each message exchange, in
    /// milliseconds
    #[arg(long, default_value_t = 5000)]
    pub link_timeout_ms: u64,

    #[command(flatten)]
    pub workload: WorkloadArgs,
}

#[derive(Debug, Args)]
pub struct WorkloadArgs {
    /// Number of peers
    #[arg(long, short = 'n', default_value_t = 3)]
    pub peers: u64,

    /// Peer that starts the snapshot
    #[arg(long, default_value_t = 2)]
    pub initiator: Pid,

    /// Background messages sent by every peer while the snapshot runs
    #[arg(long, default_value_t = 0)]
    pub messages: usize,

    /// Pause before peer 1 sends its second message, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub delay_ms: u64,

    /// How long to wait for every peer to finish, in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl From<&WorkloadArgs> for WorkloadConfig {
    fn from(args: &WorkloadArgs) -> Self {
        WorkloadConfig {
            peers: args.peers,
            initiator: args.initiator,
            messages: args.messages,
            delay: Duration::from_millis(args.delay_ms),
            timeout: Duration::from_secs(args.timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        RootCommand::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let command = RootCommand::try_parse_from(["snapmesh", "run", "--peers", "4"]).unwrap();

        let Action::Run(args) = command.action else {
            panic!("Wrong subcommand");
        };
        assert_eq!(args.start_port, DEFAULT_START_PORT);
        assert_eq!(args.link_timeout_ms, 5000);
        assert_eq!(args.workload.peers, 4);

        let config = WorkloadConfig::from(&args.workload);
        assert_eq!(config.initiator, 2);
        assert_eq!(config.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_local_overrides() {
        let command =
            RootCommand::try_parse_from(["snapmesh", "local", "-n", "5", "--initiator", "0", "--messages", "10"])
                .unwrap();

        let Action::Local(args) = command.action else {
            panic!("Wrong subcommand");
        };
        assert_eq!(args.peers, 5);
        assert_eq!(args.initiator, 0);
        assert_eq!(args.messages, 10);
    }
}
