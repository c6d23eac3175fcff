//! Fleet operations.
//!
//! Every operation visits each inventory host with its own session. Hosts are
//! independent: a failing host is recorded under its name and the remaining
//! hosts are still processed. Up to `parallelism` hosts are in flight at once
//! and the report always follows inventory order.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::InstallMode;
use crate::error::{ExecutionContext, Result, StormError};
use crate::executor::CommandExecutor;
use crate::inventory::{Host, Inventory};
use crate::platform::{
    Os, Platform, RemoteProbe, DEFAULT_SCRIPT_BASE, REMOTE_DOCUMENT, UNAME_PROBE, WINDOWS_PROBE,
};
use crate::remote::{Connector, RemoteSession};
use crate::sink::{Console, Discard};
use crate::workflow::WorkflowDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Completed,
    Installed,
    AlreadyInstalled,
    NotInstalled,
    Removed,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            HostStatus::Completed => "Workflow completed.",
            HostStatus::Installed => "Storm is ready!",
            HostStatus::AlreadyInstalled => "Storm is already installed. Skipping.",
            HostStatus::NotInstalled => "Storm is not installed.",
            HostStatus::Removed => "Storm has been removed.",
        };
        f.write_str(message)
    }
}

#[derive(Debug)]
pub struct HostOutcome {
    pub host: String,
    pub result: Result<HostStatus>,
}

/// Per-host outcomes of one fleet operation, in inventory order.
#[derive(Debug, Default)]
pub struct FleetReport {
    outcomes: Vec<HostOutcome>,
}

impl FleetReport {
    pub fn outcomes(&self) -> &[HostOutcome] {
        &self.outcomes
    }

    pub fn get(&self, host: &str) -> Option<&HostOutcome> {
        self.outcomes.iter().find(|outcome| outcome.host == host)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    /// One line per failed host.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .filter_map(|outcome| {
                outcome
                    .result
                    .as_ref()
                    .err()
                    .map(|err| format!("{}: {}", outcome.host, err))
            })
            .join("\n")
    }
}

/// Cross-builds the agent on this machine, once per target per install.
pub struct AgentBuilder {
    project_dir: PathBuf,
    /// Build command; `{target}` is replaced with the target triple.
    command: String,
    built: Mutex<HashMap<&'static str, PathBuf>>,
}

impl AgentBuilder {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            command: "cargo build --release --target {target}".to_string(),
            built: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    /// Path of the agent binary for `platform`, building it first if needed.
    pub async fn build(&self, platform: Platform) -> Result<PathBuf> {
        let target = platform.target_triple();
        // Held across the build so concurrent hosts wait for one build per target.
        let mut built = self.built.lock().await;
        if let Some(artifact) = built.get(target) {
            return Ok(artifact.clone());
        }

        let command = self.command.replace("{target}", target);
        info!(triple = target, "building agent");
        eprintln!("[Storm] Building storm for {} ...", target);
        CommandExecutor::new()
            .execute(&self.project_dir, &command, &Console::new())
            .await?;

        let artifact = self.artifact_path(platform);
        if !artifact.is_file() {
            return Err(StormError::execution(
                ExecutionContext::Local,
                &command,
                format!("no binary produced at {}", artifact.display()),
            ));
        }
        built.insert(target, artifact.clone());
        Ok(artifact)
    }

    fn artifact_path(&self, platform: Platform) -> PathBuf {
        self.project_dir
            .join("target")
            .join(platform.target_triple())
            .join("release")
            .join(platform.binary_name())
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new(".")
    }
}

pub struct FleetOrchestrator<C> {
    connector: C,
    parallelism: usize,
    script_base: String,
    builder: AgentBuilder,
}

impl<C: Connector> FleetOrchestrator<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            parallelism: 1,
            script_base: DEFAULT_SCRIPT_BASE.to_string(),
            builder: AgentBuilder::default(),
        }
    }

    /// Number of hosts processed at once. Zero is treated as one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Base URL the production install scripts are fetched from.
    pub fn with_script_base(mut self, script_base: &str) -> Self {
        self.script_base = script_base.to_string();
        self
    }

    pub fn with_builder(mut self, builder: AgentBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Uploads `document` to every host and runs it there with the installed agent.
    pub async fn run(&self, document: &WorkflowDocument, inventory: &Inventory) -> Result<FleetReport> {
        let wire = document.to_yaml()?;
        let wire = wire.as_str();
        Ok(self
            .for_each_host(inventory, "run", |host, prefix| async move {
                let session = self.connector.connect(host).await?;
                let result = self.run_on(session.as_ref(), &document.name, wire, &prefix).await;
                session.close().await;
                result
            })
            .await)
    }

    pub async fn install(&self, mode: InstallMode, inventory: &Inventory) -> FleetReport {
        self.for_each_host(inventory, "install", |host, prefix| async move {
            let session = self.connector.connect(host).await?;
            let result = match mode {
                InstallMode::Dev => self.install_dev(session.as_ref(), &prefix).await,
                InstallMode::Prod => self.install_prod(session.as_ref(), &prefix).await,
            };
            session.close().await;
            result
        })
        .await
    }

    pub async fn uninstall(&self, inventory: &Inventory) -> FleetReport {
        self.for_each_host(inventory, "uninstall", |host, prefix| async move {
            let session = self.connector.connect(host).await?;
            let result = self.uninstall_on(session.as_ref(), &prefix).await;
            session.close().await;
            result
        })
        .await
    }

    async fn for_each_host<'a, F, Fut>(
        &'a self,
        inventory: &'a Inventory,
        operation: &'static str,
        work: F,
    ) -> FleetReport
    where
        F: Fn(&'a Host, ColoredString) -> Fut,
        Fut: std::future::Future<Output = Result<HostStatus>> + 'a,
    {
        if inventory.is_empty() {
            return FleetReport::default();
        }
        let colors = ColorPalette::new(inventory.len() as u32, PaletteType::Pastel, false).colors;
        let work = &work;
        let outcomes: Vec<HostOutcome> = stream::iter(inventory.hosts().iter().zip(colors))
            .map(|(host, color): (&'a Host, Color)| async move {
                let prefix = host.prettify(color);
                eprintln!("{} Starting {}.", prefix, operation);
                let result = work(host, prefix.clone()).await;
                match &result {
                    Ok(status) => {
                        eprintln!("{} {}", prefix, status);
                        info!(host = %host.name, operation, status = ?status, "host finished");
                    }
                    Err(err) => {
                        eprintln!("{} Failed: {}", prefix, err);
                        warn!(host = %host.name, operation, "host failed: {}", err);
                    }
                }
                HostOutcome {
                    host: host.name.clone(),
                    result,
                }
            })
            .buffered(self.parallelism)
            .collect()
            .await;
        FleetReport { outcomes }
    }

    async fn run_on(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        wire: &str,
        prefix: &ColoredString,
    ) -> Result<HostStatus> {
        let os = probe_remote(session).await?.os;
        eprintln!("{} Uploading workflow '{}'.", prefix, name);
        session.upload(wire.as_bytes(), REMOTE_DOCUMENT).await?;
        session
            .execute(
                &os.run_command(REMOTE_DOCUMENT),
                &Console::with_prefix(prefix.clone()),
            )
            .await?;
        Ok(HostStatus::Completed)
    }

    async fn install_dev(
        &self,
        session: &dyn RemoteSession,
        prefix: &ColoredString,
    ) -> Result<HostStatus> {
        let probe = probe_remote(session).await?;
        if is_installed(session, probe.os).await? {
            return Ok(HostStatus::AlreadyInstalled);
        }
        // Building needs a target triple, so only here does the architecture matter.
        let platform = probe.platform().map_err(|platform| StormError::UnsupportedPlatform {
            host: session.host().name.clone(),
            platform,
        })?;
        let binary = self.builder.build(platform).await?;
        eprintln!("{} Installing storm ({}) ...", prefix, platform);
        deploy(session, platform.os, &binary).await?;
        Ok(HostStatus::Installed)
    }

    async fn install_prod(
        &self,
        session: &dyn RemoteSession,
        prefix: &ColoredString,
    ) -> Result<HostStatus> {
        let os = probe_remote(session).await?.os;
        eprintln!("{} Installing storm ...", prefix);
        session
            .execute(
                &os.bootstrap_command(&self.script_base),
                &Console::with_prefix(prefix.clone()),
            )
            .await?;
        Ok(HostStatus::Installed)
    }

    async fn uninstall_on(
        &self,
        session: &dyn RemoteSession,
        prefix: &ColoredString,
    ) -> Result<HostStatus> {
        let os = probe_remote(session).await?.os;
        if !is_installed(session, os).await? {
            return Ok(HostStatus::NotInstalled);
        }
        eprintln!("{} Removing storm ...", prefix);
        session.execute(&os.removal_command(), &Discard).await?;
        Ok(HostStatus::Removed)
    }
}

/// Asks the host itself what it runs. Tries `uname` first, then Windows.
///
/// The Windows probe is only tried when `uname` ran and failed; transport
/// errors are returned as they are.
pub async fn probe_remote(session: &dyn RemoteSession) -> Result<RemoteProbe> {
    let host = &session.host().name;
    let unsupported = |platform: String| StormError::UnsupportedPlatform {
        host: host.clone(),
        platform,
    };
    match session.execute(UNAME_PROBE, &Discard).await {
        Ok(output) => RemoteProbe::from_uname(&output).map_err(unsupported),
        Err(uname_error) if uname_error.exit_code().is_some() => {
            match session.execute(WINDOWS_PROBE, &Discard).await {
                Ok(output) => RemoteProbe::from_windows_probe(&output).map_err(unsupported),
                Err(_) => Err(uname_error),
            }
        }
        Err(err) => Err(err),
    }
}

/// A clean non-zero exit of the presence probe means "not installed".
/// Anything else is a failure to find out.
async fn is_installed(session: &dyn RemoteSession, os: Os) -> Result<bool> {
    match session.execute(&os.presence_probe(), &Discard).await {
        Ok(_) => Ok(true),
        Err(err) if err.exit_code().is_some() => Ok(false),
        Err(err) => Err(err),
    }
}

async fn deploy(session: &dyn RemoteSession, os: Os, binary: &Path) -> Result<()> {
    session.copy_file(binary, &os.binary_path()).await?;
    if let Some(chmod) = os.mark_executable_command() {
        session.execute(&chmod, &Discard).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    fn outcome(host: &str, result: Result<HostStatus>) -> HostOutcome {
        HostOutcome {
            host: host.to_string(),
            result,
        }
    }

    #[test]
    fn test_report_success_and_summary() {
        let report = FleetReport {
            outcomes: vec![
                outcome("a", Ok(HostStatus::Completed)),
                outcome(
                    "b",
                    Err(StormError::Io(io::Error::new(io::ErrorKind::Other, "boom"))),
                ),
                outcome("c", Ok(HostStatus::Removed)),
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.failure_summary(), "b: I/O error: boom");
        assert!(report.get("c").unwrap().result.is_ok());
    }

    #[test]
    fn test_empty_report_is_success() {
        assert!(FleetReport::default().is_success());
    }

    #[tokio::test]
    async fn test_builder_builds_each_target_once() {
        let dir = tempfile::tempdir().unwrap();
        let builder = AgentBuilder::new(dir.path()).with_command(
            "mkdir -p target/{target}/release && echo x >> builds && touch target/{target}/release/storm",
        );
        let linux = Platform::from_uname("Linux x86_64").unwrap();
        let first = builder.build(linux).await.unwrap();
        let second = builder.build(linux).await.unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("target/x86_64-unknown-linux-gnu/release/storm"));
        let builds = std::fs::read_to_string(dir.path().join("builds")).unwrap();
        assert_eq!(builds.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_builder_without_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let builder = AgentBuilder::new(dir.path()).with_command("true");
        let linux = Platform::from_uname("Linux x86_64").unwrap();
        let err = builder.build(linux).await.unwrap_err();
        assert!(err.to_string().contains("no binary produced"));
    }
}
