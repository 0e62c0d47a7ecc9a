// src/config.rs
//! Configuration file parsing for mailsmithd
//!
//! Supports TOML configuration files with the following sections:
//! - [server] - Bind address and admin token
//! - [paths] - Lock directory and audit log
//! - [commands] - Privilege escalation prefix and command timeouts
//! - [webmail] - Web server flavour, PHP version, database naming
//! - [dns] - Default upstream forwarders

use crate::audit::DEFAULT_AUDIT_LOG;
use crate::lock::DEFAULT_LOCK_DIR;
use crate::runner::Timeouts;
use crate::services::{self, ServiceDescriptor};
use crate::{Error, Result, validate};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mailsmith/mailsmith.toml";

/// PHP branches with packaged FPM pools
pub const SUPPORTED_PHP_VERSIONS: &[&str] = &["7.4", "8.0", "8.2"];

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub commands: CommandsSection,

    #[serde(default)]
    pub webmail: WebmailSection,

    #[serde(default)]
    pub dns: DnsSection,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// HTTP API bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Bearer token required on every provisioning endpoint
    #[serde(default)]
    pub admin_token: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_token: String::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8025".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    /// Directory holding provisioning locks
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// JSON-lines audit trail of session activity
    #[serde(default = "default_audit_log")]
    pub audit_log: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            audit_log: default_audit_log(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_DIR)
}

fn default_audit_log() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_AUDIT_LOG))
}

/// External command settings
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsSection {
    /// Prepended to privileged commands; empty when running as root
    #[serde(default = "default_privilege_prefix")]
    pub privilege_prefix: Vec<String>,

    /// Status probes (e.g. "3s")
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,

    /// Ordinary mutations (e.g. "60s")
    #[serde(default = "default_command_timeout")]
    pub default_timeout: String,

    /// Package installation (e.g. "5m")
    #[serde(default = "default_install_timeout")]
    pub install_timeout: String,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            privilege_prefix: default_privilege_prefix(),
            probe_timeout: default_probe_timeout(),
            default_timeout: default_command_timeout(),
            install_timeout: default_install_timeout(),
        }
    }
}

fn default_privilege_prefix() -> Vec<String> {
    vec!["/usr/bin/sudo".to_string(), "-n".to_string()]
}

fn default_probe_timeout() -> String {
    "3s".to_string()
}

fn default_command_timeout() -> String {
    "60s".to_string()
}

fn default_install_timeout() -> String {
    "5m".to_string()
}

/// Web server fronting the webmail gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebServer {
    #[default]
    Nginx,
    Apache,
}

impl WebServer {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebServer::Nginx => "nginx",
            WebServer::Apache => "apache",
        }
    }

    pub fn service(&self) -> &'static ServiceDescriptor {
        match self {
            WebServer::Nginx => &services::NGINX,
            WebServer::Apache => &services::APACHE2,
        }
    }

    /// nginx hands PHP to a separate FPM process; Apache runs mod_php
    pub fn needs_php_fpm(&self) -> bool {
        matches!(self, WebServer::Nginx)
    }
}

impl std::fmt::Display for WebServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebmailSection {
    #[serde(default)]
    pub web_server: WebServer,

    #[serde(default = "default_php_version")]
    pub php_version: String,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    #[serde(default = "default_db_user")]
    pub db_user: String,

    /// Shown in the webmail UI
    #[serde(default = "default_product_name")]
    pub product_name: String,
}

impl Default for WebmailSection {
    fn default() -> Self {
        Self {
            web_server: WebServer::default(),
            php_version: default_php_version(),
            db_name: default_db_name(),
            db_user: default_db_user(),
            product_name: default_product_name(),
        }
    }
}

fn default_php_version() -> String {
    "8.2".to_string()
}

fn default_db_name() -> String {
    "roundcubemail".to_string()
}

fn default_db_user() -> String {
    "roundcube".to_string()
}

fn default_product_name() -> String {
    "Webmail".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    /// Upstream resolvers used when a request names none
    #[serde(default = "default_forwarders")]
    pub forwarders: Vec<String>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            forwarders: default_forwarders(),
        }
    }
}

fn default_forwarders() -> Vec<String> {
    ["1.1.1.1", "1.0.0.1", "9.9.9.9"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let bind = self.bind_addr()?;
        if !bind.ip().is_loopback() && self.server.admin_token.is_empty() {
            return Err(Error::Config(format!(
                "server.admin_token is required when binding to non-loopback address {}",
                bind
            )));
        }

        if !self.paths.lock_dir.is_absolute() {
            return Err(Error::Config(format!(
                "paths.lock_dir must be absolute, got {}",
                self.paths.lock_dir.display()
            )));
        }

        if let Some(audit_log) = &self.paths.audit_log {
            if !audit_log.is_absolute() {
                return Err(Error::Config(format!(
                    "paths.audit_log must be absolute, got {}",
                    audit_log.display()
                )));
            }
        }

        if let Some(program) = self.commands.privilege_prefix.first() {
            if !Path::new(program).is_absolute() {
                return Err(Error::Config(format!(
                    "commands.privilege_prefix must start with an absolute path, got '{}'",
                    program
                )));
            }
        }

        self.timeouts()?;

        if !SUPPORTED_PHP_VERSIONS.contains(&self.webmail.php_version.as_str()) {
            return Err(Error::Config(format!(
                "webmail.php_version must be one of {:?}, got '{}'",
                SUPPORTED_PHP_VERSIONS, self.webmail.php_version
            )));
        }

        validate::sql_identifier(&self.webmail.db_name)
            .map_err(|e| Error::Config(format!("webmail.db_name: {}", e)))?;
        validate::sql_identifier(&self.webmail.db_user)
            .map_err(|e| Error::Config(format!("webmail.db_user: {}", e)))?;

        for forwarder in &self.dns.forwarders {
            validate::forwarder(forwarder)
                .map_err(|e| Error::Config(format!("dns.forwarders: {}", e)))?;
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind.parse().map_err(|_| {
            Error::Config(format!("Invalid server.bind address: {}", self.server.bind))
        })
    }

    /// Parsed command timeouts
    pub fn timeouts(&self) -> Result<Timeouts> {
        Ok(Timeouts {
            probe: parse_duration(&self.commands.probe_timeout)?,
            default: parse_duration(&self.commands.default_timeout)?,
            install: parse_duration(&self.commands.install_timeout)?,
        })
    }

    pub fn with_lock_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.paths.lock_dir = dir.into();
        self
    }

    pub fn with_audit_log(mut self, path: Option<PathBuf>) -> Self {
        self.paths.audit_log = path;
        self
    }

    pub fn with_web_server(mut self, web_server: WebServer) -> Self {
        self.webmail.web_server = web_server;
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.server.admin_token = token.into();
        self
    }

    pub fn with_privilege_prefix(mut self, prefix: Vec<String>) -> Self {
        self.commands.privilege_prefix = prefix;
        self
    }
}

/// Parse a human-readable duration string (e.g., "3s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid duration: {}", s)))?;
    if num == 0 {
        return Err(Error::Config(format!("Duration must be non-zero: {}", s)));
    }

    let secs = num
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("Duration too large: {}", s)))?;
    Ok(Duration::from_secs(secs))
}
