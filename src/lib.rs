//! Storm: A workflow runner that dispatches to SSH fleets.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent workflow documents.
pub mod workflow;
// How to parse and represent hosts.
pub mod inventory;
// Where command output goes.
pub mod sink;
// Line splitting of child process output.
pub mod stream;
// Local shell command execution.
pub mod executor;
// Job sequencing and dependency gating.
pub mod runner;
// Facts about remote hosts.
pub mod platform;
// Remote session abstraction.
pub mod remote;
// SSH and SFTP transport.
pub mod ssh;
// Install, uninstall and run across an inventory.
pub mod fleet;

pub use config::{Config, InstallMode};
pub use error::{Result, StormError};
pub use executor::CommandExecutor;
pub use fleet::{AgentBuilder, FleetOrchestrator, FleetReport, HostOutcome, HostStatus};
pub use inventory::{Host, Inventory};
pub use remote::{Connector, RemoteSession};
pub use runner::{JobResult, JobResults, JobRunner};
pub use sink::{Capture, Console, Discard, OutputSink, Stream};
pub use ssh::{SshConnector, SshOptions};
pub use workflow::{Job, Step, WorkflowDocument};
