//! Configuration for Storm.
//!
//! Holds the clap structs for command line arguments and flags. Workflow
//! documents and inventories are parsed in their own modules.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::platform::DEFAULT_SCRIPT_BASE;
use crate::ssh::{HostKeyPolicy, SshOptions};

#[derive(Parser)]
#[command(name = "storm", version, author, about = "Workflow runner with SSH fleet dispatch")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a workflow document on this machine
    Run {
        /// Workflow document to run
        file: PathBuf,

        /// Base directory for steps, used when the document sets none
        #[arg(long, short)]
        directory: Option<String>,

        /// Delete the workflow document after a successful run
        #[arg(long, short)]
        trash: bool,
    },
    /// Manage the agent on every host of an inventory
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Print version information
    Version,
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Upload a workflow to every host and run it there
    Run {
        /// Workflow document to dispatch
        file: PathBuf,

        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// Install the agent on every host
    Install {
        #[command(flatten)]
        fleet: FleetArgs,

        /// Build locally (dev) or use the released install script (prod)
        #[arg(long, short, value_enum, default_value = "prod")]
        mode: InstallMode,

        /// Where the prod install scripts are downloaded from
        #[arg(long, default_value = DEFAULT_SCRIPT_BASE)]
        script_base: String,

        /// (dev) Cargo project the agent is cross-built from
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
    /// Remove the agent from every host
    Uninstall {
        #[command(flatten)]
        fleet: FleetArgs,
    },
}

/// Flags shared by every fleet operation.
#[derive(Args)]
pub struct FleetArgs {
    /// Inventory file listing the hosts
    #[arg(long, short, default_value = "./inventory.yaml")]
    pub inventory: PathBuf,

    /// How many hosts to work on at once
    #[arg(long, short, default_value = "1")]
    pub parallelism: usize,

    /// Verify host keys against ~/.ssh/known_hosts
    #[arg(long)]
    pub strict_host_keys: bool,

    /// Seconds to wait for a host to accept the connection
    #[arg(long, default_value = "30")]
    pub connect_timeout: u64,

    /// Seconds after which a remote command is abandoned
    #[arg(long)]
    pub command_timeout: Option<u64>,
}

impl FleetArgs {
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            host_key_policy: if self.strict_host_keys {
                HostKeyPolicy::KnownHosts
            } else {
                HostKeyPolicy::AcceptAny
            },
            connect_timeout: Duration::from_secs(self.connect_timeout),
            command_timeout: self.command_timeout.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy, ValueEnum)]
pub enum InstallMode {
    Dev,
    Prod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_run() {
        let config = Config::try_parse_from(["storm", "run", "flow.yaml", "-t", "-d", "/srv"]).unwrap();
        match config.command {
            Command::Run {
                file,
                directory,
                trash,
            } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(directory.as_deref(), Some("/srv"));
                assert!(trash);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_install_defaults() {
        let config = Config::try_parse_from(["storm", "agent", "install"]).unwrap();
        match config.command {
            Command::Agent {
                command:
                    AgentCommand::Install {
                        fleet,
                        mode,
                        script_base,
                        ..
                    },
            } => {
                assert_eq!(fleet.inventory, PathBuf::from("./inventory.yaml"));
                assert_eq!(fleet.parallelism, 1);
                assert_eq!(mode, InstallMode::Prod);
                assert_eq!(script_base, DEFAULT_SCRIPT_BASE);
                let options = fleet.ssh_options();
                assert_eq!(options.host_key_policy, HostKeyPolicy::AcceptAny);
                assert_eq!(options.connect_timeout, Duration::from_secs(30));
            }
            _ => panic!("expected agent install"),
        }
    }

    #[test]
    fn test_agent_run_flags() {
        let config = Config::try_parse_from([
            "storm",
            "agent",
            "run",
            "flow.yaml",
            "-i",
            "hosts.yaml",
            "-p",
            "4",
            "--strict-host-keys",
        ])
        .unwrap();
        match config.command {
            Command::Agent {
                command: AgentCommand::Run { file, fleet },
            } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(fleet.inventory, PathBuf::from("hosts.yaml"));
                assert_eq!(fleet.parallelism, 4);
                assert_eq!(fleet.ssh_options().host_key_policy, HostKeyPolicy::KnownHosts);
            }
            _ => panic!("expected agent run"),
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Config::try_parse_from(["storm", "agent", "install", "-m", "beta"]).is_err());
    }
}
