//! Remote platforms the agent can be installed on.
//!
//! Everything here describes the *target* host, as reported by probe commands
//! run on that host. The orchestrating machine's own OS never matters.

use std::fmt;

/// Probe for Unix-likes. Prints e.g. `Linux x86_64` or `Darwin arm64`.
pub const UNAME_PROBE: &str = "uname -sm";
/// Probe for Windows, valid from both cmd and PowerShell. Prints e.g. `Windows_NT AMD64`.
pub const WINDOWS_PROBE: &str = "cmd /c echo %OS% %PROCESSOR_ARCHITECTURE%";

pub const DEFAULT_SCRIPT_BASE: &str =
    "https://raw.githubusercontent.com/Overal-X/formatio.storm/main/scripts";

/// Install root, relative to the remote user's home (and to the SFTP root).
pub const INSTALL_DIR: &str = ".storm";
/// Where uploaded workflow documents land, relative to the remote home.
pub const REMOTE_DOCUMENT: &str = ".storm/workflow.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

impl Os {
    pub fn binary_name(self) -> &'static str {
        match self {
            Os::Windows => "storm.exe",
            _ => "storm",
        }
    }

    /// Agent binary path relative to the remote home.
    pub fn binary_path(self) -> String {
        format!("{}/bin/{}", INSTALL_DIR, self.binary_name())
    }

    /// Exits zero iff the agent binary is installed.
    pub fn presence_probe(self) -> String {
        match self {
            Os::Windows => format!(
                r#"cmd /c if exist "%USERPROFILE%\{}\bin\{}" (exit 0) else (exit 1)"#,
                INSTALL_DIR,
                self.binary_name()
            ),
            _ => format!("test -x ~/{}", self.binary_path()),
        }
    }

    pub fn removal_command(self) -> String {
        match self {
            Os::Windows => format!(r#"cmd /c rmdir /s /q "%USERPROFILE%\{}""#, INSTALL_DIR),
            _ => format!("rm -rf ~/{}", INSTALL_DIR),
        }
    }

    /// Only meaningful off Windows.
    pub fn mark_executable_command(self) -> Option<String> {
        match self {
            Os::Windows => None,
            _ => Some(format!("chmod +x ~/{}", self.binary_path())),
        }
    }

    /// Command that downloads and installs a released agent.
    pub fn bootstrap_command(self, script_base: &str) -> String {
        let script_base = script_base.trim_end_matches('/');
        match self {
            Os::Windows => format!(
                r#"powershell -c "irm {}/install.ps1 | iex""#,
                script_base
            ),
            _ => format!("curl -fsSL {}/install.sh | bash", script_base),
        }
    }

    /// Runs an uploaded workflow document with the installed agent.
    pub fn run_command(self, document: &str) -> String {
        match self {
            Os::Windows => format!(
                r#""%USERPROFILE%\{}\bin\{}" run --trash "%USERPROFILE%\{}""#,
                INSTALL_DIR,
                self.binary_name(),
                document.replace('/', "\\")
            ),
            _ => format!("~/{} run --trash ~/{}", self.binary_path(), document),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
}

/// What a host said about itself: a known OS family plus its raw machine name.
///
/// Only building the agent needs the architecture, so an unknown machine name
/// is not an error until `platform` is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProbe {
    pub os: Os,
    machine: String,
    raw: String,
}

impl RemoteProbe {
    /// Parses `uname -sm` output. Returns the raw text for an unknown OS.
    pub fn from_uname(output: &str) -> Result<Self, String> {
        let raw = output.trim().to_string();
        let mut fields = output.split_whitespace();
        let os = match fields.next() {
            Some("Linux") => Os::Linux,
            Some("Darwin") => Os::MacOs,
            _ => return Err(raw),
        };
        Ok(Self {
            os,
            machine: fields.next().unwrap_or_default().to_string(),
            raw,
        })
    }

    /// Parses the Windows probe output. Returns the raw text when it is not Windows.
    pub fn from_windows_probe(output: &str) -> Result<Self, String> {
        let raw = output.trim().to_string();
        let mut fields = output.split_whitespace();
        if fields.next() != Some("Windows_NT") {
            return Err(raw);
        }
        Ok(Self {
            os: Os::Windows,
            machine: fields.next().unwrap_or_default().to_string(),
            raw,
        })
    }

    /// The full platform. Returns the raw probe text for an unknown architecture.
    pub fn platform(&self) -> Result<Platform, String> {
        let arch = match (self.os, self.machine.as_str()) {
            (Os::Windows, "AMD64") => Arch::X86_64,
            (Os::Windows, "ARM64") => Arch::Aarch64,
            (Os::Linux | Os::MacOs, "x86_64" | "amd64") => Arch::X86_64,
            (Os::Linux | Os::MacOs, "aarch64" | "arm64") => Arch::Aarch64,
            _ => return Err(self.raw.clone()),
        };
        Ok(Platform { os: self.os, arch })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// Parses `uname -sm` output into a full platform.
    pub fn from_uname(output: &str) -> Result<Self, String> {
        RemoteProbe::from_uname(output)?.platform()
    }

    /// Rust target triple used to cross-build the agent for this platform.
    pub fn target_triple(&self) -> &'static str {
        match (self.os, self.arch) {
            (Os::Linux, Arch::X86_64) => "x86_64-unknown-linux-gnu",
            (Os::Linux, Arch::Aarch64) => "aarch64-unknown-linux-gnu",
            (Os::MacOs, Arch::X86_64) => "x86_64-apple-darwin",
            (Os::MacOs, Arch::Aarch64) => "aarch64-apple-darwin",
            (Os::Windows, Arch::X86_64) => "x86_64-pc-windows-gnu",
            (Os::Windows, Arch::Aarch64) => "aarch64-pc-windows-msvc",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        self.os.binary_name()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target_triple())
    }
}
