//! Fleet inventory.
//!
//! One SSH connection is created per `Host` per fleet operation. Private keys
//! are read from disk when the inventory is loaded so that hosts carry their
//! key material with them and nothing touches the filesystem mid-run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use colored::*;
use colourado::Color;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, StormError};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone)]
pub struct Host {
    /// Name used to attribute output and failures.
    pub name: String,
    /// IP address or domain.
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Private key material (not a path).
    pub private_key: Option<String>,
    /// Reserved. Nothing uses it yet.
    pub sudo_password: Option<String>,
}

impl Host {
    pub fn new(name: &str, address: &str, user: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            port: DEFAULT_SSH_PORT,
            user: user.to_string(),
            password: None,
            private_key: None,
            sudo_password: None,
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Host>,
}

#[derive(Deserialize)]
struct InventoryFile {
    #[serde(default)]
    servers: Vec<HostEntry>,
}

#[derive(Deserialize)]
struct HostEntry {
    name: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: String,
    #[serde(rename = "ssh-pass", default)]
    ssh_pass: Option<String>,
    #[serde(rename = "private-ssh-key", default)]
    private_ssh_key: Option<String>,
    #[serde(rename = "sudo-pass", default)]
    sudo_pass: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Inventory {
    /// Builds an inventory from already-resolved hosts.
    pub fn new(hosts: Vec<Host>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(hosts.len());
        for host in &hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(StormError::config(
                    "<inventory>",
                    format!("Host name '{}' is used more than once", host.name),
                ));
            }
        }
        Ok(Self { hosts })
    }

    /// Reads an inventory file. Key paths are resolved relative to its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StormError::config(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base).map_err(|reason| StormError::config(path, reason))
    }

    /// Parses an inventory from YAML text, resolving key paths against `base`.
    pub fn from_yaml(text: &str, base: &Path) -> Result<Self> {
        Self::parse(text, base).map_err(|reason| StormError::config("<inline inventory>", reason))
    }

    fn parse(text: &str, base: &Path) -> std::result::Result<Self, String> {
        let file: InventoryFile = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        let mut hosts = Vec::with_capacity(file.servers.len());
        for server in file.servers {
            let private_key = match server.private_ssh_key.as_deref() {
                Some(key_path) if !key_path.is_empty() => {
                    let key_path = resolve_key_path(key_path, base);
                    let key = std::fs::read_to_string(&key_path).map_err(|e| {
                        format!(
                            "Failed to read private key {} for host '{}': {}",
                            key_path.display(),
                            server.name,
                            e
                        )
                    })?;
                    Some(key)
                }
                _ => None,
            };
            hosts.push(Host {
                name: server.name,
                address: server.host,
                port: server.port,
                user: server.user,
                password: server.ssh_pass.filter(|pass| !pass.is_empty()),
                private_key,
                sudo_password: server.sudo_pass,
            });
        }
        let inventory = Self::new(hosts).map_err(|e| match e {
            StormError::Config { reason, .. } => reason,
            other => other.to_string(),
        })?;
        debug!(hosts = ?inventory.hosts, "Hosts detected");
        Ok(inventory)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.name == name)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn resolve_key_path(key_path: &str, base: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(key_path).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}
