// src/session/webmail.rs

//! Webmail (Roundcube) provisioning
//!
//! Full setup runs these phases in order:
//!
//! | # | Phase | Rollback |
//! |---|-------|----------|
//! | 1 | `install-php-fpm` (nginx only) | remove packages this run installed |
//! | 2 | `install-webmail-packages` | remove packages this run installed |
//! | 3 | `start-php-fpm` (nginx only) | stop/disable if this run started it |
//! | 4 | `generate-secrets` (reuses credentials of an existing config) | - |
//! | 5 | `create-database` | drop database and user if this run created them |
//! | 6 | `write-webmail-config` | restore previous file or delete |
//! | 7 | `import-schema` | - (covered by 5) |
//! | 8 | `verify-database-access` | checkpoint |
//! | 9 | `activate-webserver` | revert unit state, restore displaced service |
//! | 10 | `write-webserver-snippet` | restore previous files or delete |
//! | 11 | `enable-webserver-snippet` | unlink / `a2disconf` |
//! | 12 | `test-webserver-config` | - |
//! | 13 | `reload-webserver` | - |
//!
//! Phase 8 is a checkpoint: once the new database user can see its schema,
//! the application sub-chain is committed, and a broken web server
//! configuration only unwinds phases 9 onwards.
//!
//! Reconfiguring an installation the guard reports as complete runs only
//! phase 3 and phases 9-13. Secrets and the database are left alone.

use super::{Provisioner, ProvisioningSession, SessionKind};
use crate::config::WebServer;
use crate::config_writer::templates::{self, RoundcubeSettings};
use crate::config_writer::{
    APACHE_CONF, APACHE_CONF_ENABLED, ConfigArtifact, NGINX_SITE, NGINX_SITE_ENABLED,
    NGINX_SNIPPET, ROUNDCUBE_CONFIG,
};
use crate::phase::{Phase, PhaseError, PhaseOutcome, applied};
use crate::probe::Completeness;
use crate::runner::{CommandResult, CommandSpec, bin};
use crate::secrets::WebmailSecrets;
use crate::services::{ConflictResolution, ConflictResolver};
use crate::{Error, Result, validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, info_span};

/// Packages making up the webmail application
pub const ROUNDCUBE_PACKAGES: &[&str] = &[
    "roundcube",
    "roundcube-core",
    "roundcube-mysql",
    "roundcube-plugins",
];

/// Initial schema shipped by the roundcube package
pub const ROUNDCUBE_SCHEMA: &str = "/usr/share/roundcube/SQL/mysql.initial.sql";

const CONFIG_MODE: u32 = 0o640;
const CONFIG_OWNER: &str = "root:www-data";
const APACHE_CONF_NAME: &str = "roundcube-webmail";

const VERIFY_SQL: &str = "SELECT COUNT(*) FROM information_schema.TABLES \
                          WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = 'users';\n";

/// POST /v1/webmail/setup body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebmailSetupRequest {
    pub domain: String,
    pub admin_email: String,
    #[serde(default)]
    pub reconfigure: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebmailSetupResponse {
    pub success: bool,
    pub webmail_url: String,
    pub web_server: WebServer,
    pub dns_instructions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebmailState {
    NotInstalled,
    Configured,
    Incomplete,
}

/// GET /v1/webmail/status body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebmailStatus {
    pub installed: bool,
    pub url: Option<String>,
    pub status: WebmailState,
    pub version: Option<String>,
    pub domain: Option<String>,
    pub web_server: WebServer,
    pub needs_reconfigure: bool,
    /// Failing completeness checks
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

/// Host serving IMAP/SMTP for `domain`
pub fn mail_host(domain: &str) -> String {
    if domain.starts_with("mail.") {
        domain.to_string()
    } else {
        format!("mail.{}", domain)
    }
}

/// Mail domain served by `host` (`mail.example.com` -> `example.com`)
pub fn mail_domain(host: &str) -> &str {
    host.strip_prefix("mail.").unwrap_or(host)
}

pub fn webmail_url(host: &str) -> String {
    format!("https://{}/webmail", host)
}

/// Records the operator has to create for `domain`
pub fn dns_instructions(domain: &str) -> Vec<String> {
    let host = mail_host(domain);
    let mut records = Vec::new();
    if host != domain {
        records.push(format!("Add A record: {} -> <server IP>", domain));
    }
    records.push(format!("Add A record: {} -> <server IP>", host));
    records.push(format!(
        "Add MX record: {} -> {} (priority 10)",
        mail_domain(&host),
        host
    ));
    records
}

fn php_packages(version: &str) -> Vec<String> {
    ["fpm", "mysql", "intl", "mbstring", "xml"]
        .iter()
        .map(|ext| format!("php{}-{}", version, ext))
        .collect()
}

fn fpm_unit(version: &str) -> String {
    format!("php{}-fpm.service", version)
}

fn fpm_socket(version: &str) -> String {
    format!("/run/php/php{}-fpm.sock", version)
}

/// Quote `s` as a MySQL string literal
fn sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// `db` and `user` are validated SQL identifiers
fn create_database_sql(db: &str, user: &str, password: &str) -> String {
    let account = format!("{}@'localhost'", sql_string(user));
    let password = sql_string(password);
    format!(
        "CREATE DATABASE IF NOT EXISTS `{db}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;
CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {password};
ALTER USER {account} IDENTIFIED BY {password};
GRANT SELECT, INSERT, UPDATE, DELETE, CREATE, ALTER, INDEX, DROP, LOCK TABLES, CREATE TEMPORARY TABLES ON `{db}`.* TO {account};
FLUSH PRIVILEGES;
"
    )
}

fn drop_database_sql(db: &str, user: &str) -> String {
    format!(
        "DROP DATABASE IF EXISTS `{db}`;
DROP USER IF EXISTS {}@'localhost';
FLUSH PRIVILEGES;
",
        sql_string(user)
    )
}

fn installed_outcome(installed: &[String]) -> PhaseOutcome {
    if installed.is_empty() {
        PhaseOutcome::Skipped("already installed".to_string())
    } else {
        PhaseOutcome::Applied
    }
}

fn config_artifact(content: String) -> ConfigArtifact {
    ConfigArtifact::new(ROUNDCUBE_CONFIG, content)
        .with_mode(CONFIG_MODE)
        .with_owner(CONFIG_OWNER)
}

/// State threaded through the webmail phases
#[derive(Debug, Default)]
struct WebmailContext {
    /// Host the webmail is served on (`mail.{domain}`)
    host: String,
    admin_email: String,
    installed_php: Vec<String>,
    installed_webmail: Vec<String>,
    fpm_was_enabled: bool,
    fpm_was_active: bool,
    php_socket: Option<String>,
    secrets: Option<WebmailSecrets>,
    database_created: bool,
    previous_config: Option<String>,
    webserver_was_enabled: bool,
    webserver_was_active: bool,
    displaced: ConflictResolution,
    previous_snippets: Vec<(&'static str, Option<String>)>,
    include_was_enabled: bool,
}

impl WebmailContext {
    fn secrets(&self) -> std::result::Result<&WebmailSecrets, PhaseError> {
        self.secrets
            .as_ref()
            .ok_or_else(|| PhaseError::new("secrets were not generated"))
    }
}

impl Provisioner {
    /// Install and wire up webmail for `request.domain`
    pub fn setup_webmail(&self, request: &WebmailSetupRequest) -> Result<WebmailSetupResponse> {
        let domain = validate::domain(&request.domain)?;
        let admin_email = validate::email(&request.admin_email)?;
        let web_server = self.config.webmail.web_server;

        let target = BTreeMap::from([
            ("domain".to_string(), domain.clone()),
            ("adminEmail".to_string(), admin_email.clone()),
            ("reconfigure".to_string(), request.reconfigure.to_string()),
        ]);
        let mut session = ProvisioningSession::new(SessionKind::WebmailSetup, target);
        let span = info_span!("session", id = %session.id, kind = %session.kind);
        let _entered = span.enter();

        let _lock = self.lock(SessionKind::WebmailSetup)?;

        let completeness = self.webmail_completeness();
        let done = completeness.is_fully_done();
        if done && !request.reconfigure {
            return Err(Error::Conflict("webmail is already configured".to_string()));
        }
        if request.reconfigure && !done {
            info!(
                "Reconfigure requested but installation is incomplete (missing: {}); running full setup",
                completeness.missing().join(", ")
            );
        }

        let phases = if done {
            self.webmail_reconfigure_phases()
        } else {
            self.webmail_phases()
        };
        info!(
            "Provisioning webmail for {} behind {} ({} phases)",
            domain,
            web_server,
            phases.len()
        );

        let host = mail_host(&domain);
        let mut ctx = WebmailContext {
            host: host.clone(),
            admin_email,
            ..Default::default()
        };
        let report = session.execute(&self.audit, &mut ctx, phases)?;

        Ok(WebmailSetupResponse {
            success: true,
            webmail_url: webmail_url(&host),
            web_server,
            dns_instructions: dns_instructions(&domain),
            warnings: report.warnings,
        })
    }

    /// Report what is installed, derived from the live system
    pub fn webmail_status(&self) -> WebmailStatus {
        let web_server = self.config.webmail.web_server;
        if !self.probe.package_installed("roundcube") {
            return WebmailStatus {
                installed: false,
                url: None,
                status: WebmailState::NotInstalled,
                version: None,
                domain: None,
                web_server,
                needs_reconfigure: false,
                missing: Vec::new(),
            };
        }

        let completeness = self.webmail_completeness();
        let done = completeness.is_fully_done();
        let domain = self.configured_domain();
        WebmailStatus {
            installed: true,
            url: domain.as_deref().map(|d| webmail_url(&mail_host(d))),
            status: if done {
                WebmailState::Configured
            } else {
                WebmailState::Incomplete
            },
            version: self.probe.package_version("roundcube"),
            domain,
            web_server,
            needs_reconfigure: !done,
            missing: completeness.missing(),
        }
    }

    /// package installed AND our config present AND include written AND include enabled
    pub(crate) fn webmail_completeness(&self) -> Completeness {
        let (snippet, enabled) = match self.config.webmail.web_server {
            WebServer::Nginx => (
                self.probe.path_exists(NGINX_SNIPPET) && self.probe.path_exists(NGINX_SITE),
                self.probe.is_symlink(NGINX_SITE_ENABLED),
            ),
            WebServer::Apache => (
                self.probe.path_exists(APACHE_CONF),
                self.probe.path_exists(APACHE_CONF_ENABLED),
            ),
        };
        Completeness::new()
            .check("package", self.probe.package_installed("roundcube"))
            .check("config", self.configured_domain().is_some())
            .check("snippet", snippet)
            .check("enabled", enabled)
    }

    /// Mail domain recorded in a config file this engine rendered
    fn configured_domain(&self) -> Option<String> {
        self.probe
            .read_file(ROUNDCUBE_CONFIG)
            .as_deref()
            .and_then(templates::domain_from_roundcube_config)
    }

    fn webmail_phases(&self) -> Vec<Phase<'_, WebmailContext>> {
        vec![
            self.install_php_phase(),
            self.install_webmail_phase(),
            self.start_php_fpm_phase(),
            self.generate_secrets_phase(),
            self.create_database_phase(),
            self.write_config_phase(),
            self.import_schema_phase(),
            self.verify_access_phase().checkpoint(),
            self.activate_webserver_phase(),
            self.write_snippet_phase(),
            self.enable_snippet_phase(),
            self.test_webserver_phase(),
            self.reload_webserver_phase(),
        ]
    }

    fn webmail_reconfigure_phases(&self) -> Vec<Phase<'_, WebmailContext>> {
        vec![
            self.start_php_fpm_phase(),
            self.activate_webserver_phase(),
            self.write_snippet_phase(),
            self.enable_snippet_phase(),
            self.test_webserver_phase(),
            self.reload_webserver_phase(),
        ]
    }

    fn skip_without_fpm(&self) -> impl Fn(&WebmailContext) -> Option<String> + '_ {
        move |_: &WebmailContext| {
            let web_server = self.config.webmail.web_server;
            (!web_server.needs_php_fpm()).then(|| format!("{} runs PHP in-process", web_server))
        }
    }

    fn install_php_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("install-php-fpm", move |ctx: &mut WebmailContext| {
            let packages = php_packages(&self.config.webmail.php_version);
            ctx.installed_php = self.packages.install_missing(&self.probe, &packages)?;
            Ok(installed_outcome(&ctx.installed_php))
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            self.packages.remove(&ctx.installed_php)?;
            Ok(())
        })
        .skip_when(self.skip_without_fpm())
    }

    fn install_webmail_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("install-webmail-packages", move |ctx: &mut WebmailContext| {
            let packages: Vec<String> = ROUNDCUBE_PACKAGES.iter().map(|p| p.to_string()).collect();
            ctx.installed_webmail = self.packages.install_missing(&self.probe, &packages)?;
            Ok(installed_outcome(&ctx.installed_webmail))
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            self.packages.remove(&ctx.installed_webmail)?;
            Ok(())
        })
    }

    fn start_php_fpm_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("start-php-fpm", move |ctx: &mut WebmailContext| {
            let version = &self.config.webmail.php_version;
            let unit = fpm_unit(version);
            let socket = fpm_socket(version);
            validate::socket_path(&socket)?;

            ctx.fpm_was_enabled = self.services.is_enabled(&unit);
            ctx.fpm_was_active = self.services.is_active(&unit);
            if !ctx.fpm_was_enabled {
                self.services.enable(&unit)?;
            }
            if !ctx.fpm_was_active {
                self.services.start(&unit)?;
            }

            if !self.probe.is_socket(&socket) {
                return Err(PhaseError::new(format!(
                    "PHP-FPM socket {} not found after starting {}",
                    socket, unit
                )));
            }
            info!("PHP-FPM listening on {}", socket);
            ctx.php_socket = Some(socket);
            Ok(PhaseOutcome::Applied)
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            let unit = fpm_unit(&self.config.webmail.php_version);
            self.services
                .revert_activation(&unit, ctx.fpm_was_enabled, ctx.fpm_was_active)?;
            Ok(())
        })
        .skip_when(self.skip_without_fpm())
    }

    /// Fresh credentials, unless a config this engine rendered already holds some
    ///
    /// A retry after a partial run keeps the password the database user and
    /// the existing config agree on, so unwinding the config never strands it.
    fn generate_secrets_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("generate-secrets", move |ctx: &mut WebmailContext| {
            let webmail = &self.config.webmail;
            let existing = self.probe.read_file(ROUNDCUBE_CONFIG).and_then(|content| {
                templates::secrets_from_roundcube_config(&content, &webmail.db_user)
            });
            match existing {
                Some(secrets) => {
                    info!("Reusing credentials from {}", ROUNDCUBE_CONFIG);
                    ctx.secrets = Some(secrets);
                    Ok(PhaseOutcome::Skipped("credentials already present".to_string()))
                }
                None => {
                    ctx.secrets = Some(WebmailSecrets::generate());
                    Ok(PhaseOutcome::Applied)
                }
            }
        })
    }

    fn create_database_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("create-database", move |ctx: &mut WebmailContext| {
            let webmail = &self.config.webmail;
            let password = ctx.secrets()?.db_password.clone();

            ctx.database_created = !self.database_exists(&webmail.db_name)?;
            self.mysql_root(&create_database_sql(&webmail.db_name, &webmail.db_user, &password))?;
            info!(
                "Database {} ready for {}@localhost (created: {})",
                webmail.db_name, webmail.db_user, ctx.database_created
            );
            Ok(PhaseOutcome::Applied)
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            if !ctx.database_created {
                return Ok(());
            }
            let webmail = &self.config.webmail;
            self.mysql_root(&drop_database_sql(&webmail.db_name, &webmail.db_user))?;
            Ok(())
        })
    }

    fn write_config_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("write-webmail-config", move |ctx: &mut WebmailContext| {
            let webmail = &self.config.webmail;
            let secrets = ctx.secrets()?;
            let content = templates::roundcube_config(&RoundcubeSettings {
                domain: mail_domain(&ctx.host).to_string(),
                admin_email: ctx.admin_email.clone(),
                db_host: "localhost".to_string(),
                db_name: webmail.db_name.clone(),
                db_user: webmail.db_user.clone(),
                db_password: secrets.db_password.clone(),
                des_key: secrets.des_key.clone(),
                product_name: webmail.product_name.clone(),
            })?;

            ctx.previous_config = self.probe.read_file(ROUNDCUBE_CONFIG);
            applied(self.writer.write_artifact(&config_artifact(content)))
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            match ctx.previous_config.take() {
                Some(previous) => self.writer.write_artifact(&config_artifact(previous))?,
                None => self.writer.remove(ROUNDCUBE_CONFIG)?,
            }
            Ok(())
        })
    }

    fn import_schema_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("import-schema", move |_: &mut WebmailContext| {
            let spec = CommandSpec::new(bin::MYSQL)
                .args(["--batch", self.config.webmail.db_name.as_str(), "-e"])
                .arg(format!("SOURCE {}", ROUNDCUBE_SCHEMA))
                .timeout(self.timeouts.default)
                .privileged();
            let result = self.runner.run(&spec)?;
            if result.success() {
                return Ok(PhaseOutcome::Applied);
            }
            // A previous partial run got this far
            if !result.timed_out && result.stderr.contains("already exists") {
                return Ok(PhaseOutcome::Skipped("schema already present".to_string()));
            }
            Err(PhaseError::new(format!(
                "schema import failed: {}",
                result.failure_detail()
            )))
        })
    }

    /// Log in as the webmail user and look for its schema
    fn verify_access_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("verify-database-access", move |ctx: &mut WebmailContext| {
            let webmail = &self.config.webmail;
            let spec = CommandSpec::new(bin::MYSQL)
                .arg(format!("--user={}", webmail.db_user))
                .args(["--host=localhost", "--batch", "--skip-column-names"])
                .arg(webmail.db_name.as_str())
                .env("MYSQL_PWD", ctx.secrets()?.db_password.as_str())
                .stdin(VERIFY_SQL)
                .timeout(self.timeouts.default);
            let result = self.runner.run_checked(&spec)?;
            if result.stdout.trim() != "1" {
                return Err(PhaseError::new(format!(
                    "{} cannot see the webmail schema in {}",
                    webmail.db_user, webmail.db_name
                )));
            }
            Ok(PhaseOutcome::Applied)
        })
    }

    fn activate_webserver_phase(&self) -> Phase<'_, WebmailContext> {
        let service = self.config.webmail.web_server.service();
        Phase::new("activate-webserver", move |ctx: &mut WebmailContext| {
            ctx.webserver_was_enabled = self.services.is_enabled(service.unit);
            ctx.webserver_was_active = self.services.is_active(service.unit);

            ctx.displaced = ConflictResolver::new(&self.services).resolve(service);
            if !ctx.webserver_was_enabled {
                self.services.enable(service.unit)?;
            }
            if !ctx.webserver_was_active {
                self.services.start(service.unit)?;
            }

            if ctx.displaced.warnings.is_empty() {
                Ok(PhaseOutcome::Applied)
            } else {
                Ok(PhaseOutcome::AppliedWithWarning(ctx.displaced.warnings.join("; ")))
            }
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            let reverted = self.services.revert_activation(
                service.unit,
                ctx.webserver_was_enabled,
                ctx.webserver_was_active,
            );
            ConflictResolver::new(&self.services).restore(&ctx.displaced);
            reverted?;
            Ok(())
        })
        .skip_when(move |_: &WebmailContext| {
            (self.services.is_enabled(service.unit) && self.services.is_active(service.unit))
                .then(|| format!("{} already running", service.name))
        })
    }

    fn write_snippet_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("write-webserver-snippet", move |ctx: &mut WebmailContext| {
            let files = match self.config.webmail.web_server {
                WebServer::Nginx => {
                    let socket = ctx
                        .php_socket
                        .clone()
                        .ok_or_else(|| PhaseError::new("PHP-FPM socket was not discovered"))?;
                    vec![
                        (NGINX_SNIPPET, templates::nginx_snippet(&socket)),
                        (NGINX_SITE, templates::nginx_site(&ctx.host)),
                    ]
                }
                WebServer::Apache => vec![(APACHE_CONF, templates::apache_conf())],
            };

            for (path, content) in files {
                ctx.previous_snippets.push((path, self.probe.read_file(path)));
                self.writer.write(path, &content)?;
            }
            Ok(PhaseOutcome::Applied)
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            let mut first_error = None;
            for (path, previous) in ctx.previous_snippets.drain(..).rev() {
                let restored = match previous {
                    Some(content) => self.writer.write(path, &content),
                    None => self.writer.remove(path),
                };
                if let Err(e) = restored {
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        })
    }

    fn enable_snippet_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("enable-webserver-snippet", move |ctx: &mut WebmailContext| {
            match self.config.webmail.web_server {
                WebServer::Nginx => {
                    ctx.include_was_enabled = self.probe.is_symlink(NGINX_SITE_ENABLED);
                    applied(self.writer.symlink(NGINX_SITE, NGINX_SITE_ENABLED))
                }
                WebServer::Apache => {
                    ctx.include_was_enabled = self.probe.path_exists(APACHE_CONF_ENABLED);
                    applied(self.apache_conf_tool(bin::A2ENCONF))
                }
            }
        })
        .with_rollback(move |ctx: &mut WebmailContext| {
            if ctx.include_was_enabled {
                return Ok(());
            }
            match self.config.webmail.web_server {
                WebServer::Nginx => self.writer.remove(NGINX_SITE_ENABLED)?,
                WebServer::Apache => {
                    self.apache_conf_tool(bin::A2DISCONF)?;
                }
            }
            Ok(())
        })
    }

    /// Never reload a web server whose configuration has not passed this
    fn test_webserver_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("test-webserver-config", move |_: &mut WebmailContext| {
            let spec = match self.config.webmail.web_server {
                WebServer::Nginx => CommandSpec::new(bin::NGINX).arg("-t"),
                WebServer::Apache => CommandSpec::new(bin::APACHE2CTL).arg("configtest"),
            };
            applied(
                self.runner
                    .run_checked(&spec.timeout(self.timeouts.default).privileged()),
            )
        })
    }

    fn reload_webserver_phase(&self) -> Phase<'_, WebmailContext> {
        Phase::new("reload-webserver", move |_: &mut WebmailContext| {
            // reload, not restart: the dashboard itself may be served through it
            applied(self.services.reload(self.config.webmail.web_server.service().unit))
        })
    }

    fn apache_conf_tool(&self, program: &str) -> Result<CommandResult> {
        let spec = CommandSpec::new(program)
            .arg(APACHE_CONF_NAME)
            .timeout(self.timeouts.default)
            .privileged();
        self.runner.run_checked(&spec)
    }

    /// Run SQL as the database superuser, feeding statements through stdin
    fn mysql_root(&self, sql: &str) -> Result<CommandResult> {
        let spec = CommandSpec::new(bin::MYSQL)
            .args(["--batch", "--skip-column-names"])
            .stdin(sql)
            .timeout(self.timeouts.default)
            .privileged();
        self.runner.run_checked(&spec)
    }

    fn database_exists(&self, db: &str) -> Result<bool> {
        let result = self.mysql_root(&format!(
            "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = {};\n",
            sql_string(db)
        ))?;
        Ok(result.stdout.trim() != "0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mail_host() {
        assert_eq!(mail_host("example.com"), "mail.example.com");
        assert_eq!(mail_host("mail.example.com"), "mail.example.com");
        assert_eq!(mail_domain("mail.example.com"), "example.com");
        assert_eq!(mail_domain("example.com"), "example.com");
    }

    #[test]
    fn test_dns_instructions_for_mail_host() {
        assert_eq!(
            dns_instructions("mail.example.com"),
            vec![
                "Add A record: mail.example.com -> <server IP>",
                "Add MX record: example.com -> mail.example.com (priority 10)",
            ]
        );
    }

    #[test]
    fn test_dns_instructions_for_bare_domain() {
        let records = dns_instructions("example.org");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], "Add A record: example.org -> <server IP>");
        assert_eq!(records[1], "Add A record: mail.example.org -> <server IP>");
        assert_eq!(records[2], "Add MX record: example.org -> mail.example.org (priority 10)");
    }

    #[test]
    fn test_sql_string_escapes() {
        assert_eq!(sql_string("plain"), "'plain'");
        assert_eq!(sql_string("o'brien"), "'o''brien'");
        assert_eq!(sql_string("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_create_database_sql_scopes_grant() {
        let sql = create_database_sql("roundcubemail", "roundcube", "pw");
        assert!(sql.contains("CREATE DATABASE IF NOT EXISTS `roundcubemail`"));
        assert!(sql.contains("ON `roundcubemail`.* TO 'roundcube'@'localhost'"));
        assert!(!sql.contains("*.*"));
        assert!(!sql.contains("GRANT ALL"));
    }

    #[test]
    fn test_php_packages() {
        let packages = php_packages("8.2");
        assert!(packages.contains(&"php8.2-fpm".to_string()));
        assert!(packages.contains(&"php8.2-mysql".to_string()));
        assert_eq!(fpm_socket("8.2"), "/run/php/php8.2-fpm.sock");
        assert!(validate::socket_path(&fpm_socket("7.4")).is_ok());
    }

    #[test]
    fn test_response_shape() {
        let response = WebmailSetupResponse {
            success: true,
            webmail_url: webmail_url("mail.example.com"),
            web_server: WebServer::Nginx,
            dns_instructions: vec![],
            warnings: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["webmailUrl"], "https://mail.example.com/webmail");
        assert_eq!(json["webServer"], "nginx");
        assert!(json.get("warnings").is_none());
    }
}
