// src/config_writer/mod.rs

//! Privileged configuration writes
//!
//! The writer never touches the filesystem itself. It hands content to the
//! command runner (`tee` reading stdin) and relies on the privilege prefix
//! for elevation. Every destination is checked against [`ALLOWED_PATHS`]
//! by exact string comparison before any command runs; a prefix match would
//! let a caller write sibling files such as `roundcube-webmail-evil`.
//!
//! A write lands in a sibling staging file first. Mode and ownership are
//! applied to the staging file, then it is renamed over the destination, so
//! the final path never holds a live credential with loose permissions.

pub mod templates;

use crate::runner::{CommandRunner, CommandSpec, Timeouts, bin};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ROUNDCUBE_CONFIG: &str = "/etc/roundcube/config.inc.php";
pub const NGINX_SNIPPET: &str = "/etc/nginx/snippets/roundcube-webmail.conf";
pub const NGINX_SITE: &str = "/etc/nginx/sites-available/roundcube-webmail";
pub const NGINX_SITE_ENABLED: &str = "/etc/nginx/sites-enabled/roundcube-webmail";
pub const APACHE_CONF: &str = "/etc/apache2/conf-available/roundcube-webmail.conf";
pub const APACHE_CONF_ENABLED: &str = "/etc/apache2/conf-enabled/roundcube-webmail.conf";
pub const UNBOUND_FORWARD: &str = "/etc/unbound/unbound.conf.d/forward.conf";

/// Closed set of paths the writer may create, replace, link or delete
pub const ALLOWED_PATHS: &[&str] = &[
    ROUNDCUBE_CONFIG,
    NGINX_SNIPPET,
    NGINX_SITE,
    NGINX_SITE_ENABLED,
    APACHE_CONF,
    UNBOUND_FORWARD,
];

const STAGING_SUFFIX: &str = ".mailsmith-new";

/// A rendered configuration file bound for one allow-listed path
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub path: String,
    pub content: String,
    /// Octal file mode, e.g. `0o640`
    pub mode: Option<u32>,
    /// `user:group`
    pub owner: Option<String>,
}

// Content may hold credentials
impl std::fmt::Debug for ConfigArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigArtifact")
            .field("path", &self.path)
            .field("content_len", &self.content.len())
            .field("mode", &self.mode.map(|m| format!("{:o}", m)))
            .field("owner", &self.owner)
            .finish()
    }
}

impl ConfigArtifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: None,
            owner: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Reject any path that is not exactly an allow-list entry
pub fn check_allowed(path: &str) -> Result<()> {
    if ALLOWED_PATHS.contains(&path) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "refusing to write non-allow-listed path: {}",
            path
        )))
    }
}

fn check_owner(owner: &str) -> Result<()> {
    let valid = owner.split_once(':').is_some_and(|(user, group)| {
        let part_ok = |s: &str| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        };
        part_ok(user) && part_ok(group)
    });
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid owner: {:?}", owner)))
    }
}

/// Writes allow-listed configuration through the command runner
#[derive(Clone)]
pub struct ConfigWriter {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl ConfigWriter {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    fn privileged(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .timeout(self.timeouts.default)
            .privileged()
    }

    /// Persist `content` at `path`
    pub fn write(&self, path: &str, content: &str) -> Result<()> {
        self.write_artifact(&ConfigArtifact::new(path, content))
    }

    /// Persist an artifact, applying its mode and owner before it goes live
    ///
    /// A failing `chmod`/`chown` is fatal: the staging file is removed and
    /// the destination is left untouched.
    pub fn write_artifact(&self, artifact: &ConfigArtifact) -> Result<()> {
        check_allowed(&artifact.path)?;
        if let Some(owner) = &artifact.owner {
            check_owner(owner)?;
        }

        let staging = format!("{}{}", artifact.path, STAGING_SUFFIX);
        info!("Writing {}", artifact.path);

        self.runner.run_checked(
            &self
                .privileged(bin::TEE)
                .arg(&staging)
                .stdin(artifact.content.as_str()),
        )?;

        if let Err(e) = self.restrict(&staging, artifact) {
            self.discard(&staging);
            return Err(e);
        }

        if let Err(e) = self
            .runner
            .run_checked(&self.privileged(bin::MV).args(["-f", "--", &staging, &artifact.path]))
        {
            self.discard(&staging);
            return Err(e);
        }

        debug!("Wrote {} ({} bytes)", artifact.path, artifact.content.len());
        Ok(())
    }

    fn restrict(&self, staging: &str, artifact: &ConfigArtifact) -> Result<()> {
        if let Some(mode) = artifact.mode {
            let chmod = self
                .privileged(bin::CHMOD)
                .args([format!("{:o}", mode), staging.to_string()]);
            self.runner.run_checked(&chmod)?;
        }
        if let Some(owner) = &artifact.owner {
            self.runner
                .run_checked(&self.privileged(bin::CHOWN).args([owner.as_str(), staging]))?;
        }
        Ok(())
    }

    fn discard(&self, staging: &str) {
        if let Err(e) = self
            .runner
            .run_checked(&self.privileged(bin::RM).args(["-f", "--", staging]))
        {
            warn!("Failed to remove staging file {}: {}", staging, e);
        }
    }

    /// Delete an allow-listed file or link; absent files are not an error
    pub fn remove(&self, path: &str) -> Result<()> {
        check_allowed(path)?;
        info!("Removing {}", path);
        self.runner
            .run_checked(&self.privileged(bin::RM).args(["-f", "--", path]))?;
        Ok(())
    }

    /// Point the allow-listed `link` at `target`, replacing any existing link
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        check_allowed(link)?;
        check_allowed(target)?;
        info!("Linking {} -> {}", link, target);
        self.runner
            .run_checked(&self.privileged(bin::LN).args(["-sfn", "--", target, link]))?;
        Ok(())
    }
}
