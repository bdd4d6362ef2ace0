//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use telnet_core::{TelnetError, TelnetResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Network interface whose IPv4 address to listen on.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default)]
    pub daemonize: bool,
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            interface: None,
            login: default_login(),
            daemonize: false,
            term: default_term(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_housekeeping_ms")]
    pub housekeeping_ms: u64,
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
    #[serde(default = "default_true")]
    pub negotiate: bool,
    #[serde(default = "default_true")]
    pub issue: bool,
    #[serde(default = "default_issue_file")]
    pub issue_file: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
            housekeeping_ms: default_housekeeping_ms(),
            linger_secs: default_linger_secs(),
            negotiate: true,
            issue: true,
            issue_file: default_issue_file(),
        }
    }
}

fn default_port() -> u16 {
    23
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_login() -> String {
    "/bin/sh".to_string()
}
fn default_term() -> String {
    "xterm".to_string()
}
fn default_buffer_size() -> usize {
    4000
}
fn default_max_sessions() -> usize {
    64
}
fn default_housekeeping_ms() -> u64 {
    1000
}
fn default_linger_secs() -> u64 {
    5
}
fn default_issue_file() -> String {
    "/etc/issue.net".to_string()
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; `None`/`false` leaves the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub interface: Option<String>,
    pub login: Option<String>,
    pub daemonize: bool,
    pub no_issue: bool,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: IpAddr,
    pub interface: Option<String>,
    pub login: PathBuf,
    pub daemonize: bool,
    pub term: String,
    pub buffer_size: usize,
    pub max_sessions: usize,
    pub housekeeping_interval: Duration,
    pub linger: Duration,
    pub negotiate: bool,
    /// Pre-login banner file; `None` when disabled.
    pub issue_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &Overrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> TelnetResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TelnetError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: &Overrides) -> Self {
        let login = cli.login.clone().unwrap_or(file.server.login);
        let issue_enabled = file.session.issue && !cli.no_issue;

        Self {
            port: cli.port.unwrap_or(file.server.port),
            bind: cli.bind.unwrap_or(file.server.bind),
            interface: cli.interface.clone().or(file.server.interface),
            login: expand_tilde_str(&login),
            daemonize: cli.daemonize || file.server.daemonize,
            term: file.server.term,
            buffer_size: file.session.buffer_size,
            max_sessions: cli.max_sessions.unwrap_or(file.session.max_sessions),
            housekeeping_interval: Duration::from_millis(file.session.housekeeping_ms),
            linger: Duration::from_secs(file.session.linger_secs),
            negotiate: file.session.negotiate,
            issue_file: issue_enabled.then(|| expand_tilde_str(&file.session.issue_file)),
        }
    }

    fn validate(&self) -> TelnetResult<()> {
        if self.buffer_size < 16 {
            return Err(TelnetError::Config(format!(
                "buffer_size must be at least 16 bytes, got {}",
                self.buffer_size
            )));
        }
        if self.max_sessions == 0 {
            return Err(TelnetError::Config("max_sessions must be at least 1".into()));
        }
        if self.housekeeping_interval < Duration::from_millis(10) {
            return Err(TelnetError::Config(
                "housekeeping_ms must be at least 10".into(),
            ));
        }
        Ok(())
    }

    /// Address to listen on. A configured interface wins over `bind`.
    pub fn listen_addr(&self) -> TelnetResult<SocketAddr> {
        match &self.interface {
            Some(name) => {
                let ip = interface_ipv4(name)?;
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
            }
            None => Ok(SocketAddr::new(self.bind, self.port)),
        }
    }

    /// The login program must exist and be executable.
    pub fn check_login(&self) -> TelnetResult<()> {
        use nix::unistd::{access, AccessFlags};

        access(self.login.as_path(), AccessFlags::X_OK).map_err(|e| {
            TelnetError::Config(format!(
                "\"{}\" is no valid executable: {e}",
                self.login.display()
            ))
        })
    }

    /// Read the issue banner, translating bare `\n` to `\r\n` for the wire.
    /// A missing or unreadable file yields no banner.
    pub fn load_banner(&self) -> Vec<u8> {
        let Some(path) = &self.issue_file else {
            return Vec::new();
        };
        match std::fs::read(path) {
            Ok(raw) => to_crlf(&raw),
            Err(e) => {
                info!(path = %path.display(), error = %e, "no issue banner");
                Vec::new()
            }
        }
    }
}

fn to_crlf(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 16);
    let mut prev = 0u8;
    for &b in raw {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// First IPv4 address assigned to the named interface.
fn interface_ipv4(name: &str) -> TelnetResult<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| TelnetError::Config(format!("cannot list interfaces: {e}")))?;
    addrs
        .filter(|ifa| ifa.interface_name == name)
        .find_map(|ifa| {
            ifa.address
                .and_then(|addr| addr.as_sockaddr_in().map(|sin| *SocketAddrV4::from(*sin).ip()))
        })
        .ok_or_else(|| {
            TelnetError::Config(format!(
                "please check the NIC you specified: no IPv4 address on {name}"
            ))
        })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
