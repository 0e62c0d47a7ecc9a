// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! [`FakeSystem`] is an in-memory host: it answers every command the
//! provisioner issues (dpkg, apt, systemctl, file tools, mysql, web server
//! and resolver checks) from a small state model and records each call.

#![allow(dead_code)]

use mailsmith::config_writer::APACHE_CONF_ENABLED;
use mailsmith::runner::bin;
use mailsmith::{CommandResult, CommandRunner, CommandSpec, Config, Provisioner, WebServer};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

pub const DEFAULT_DOMAIN: &str = "mail.example.com";
pub const DEFAULT_ADMIN: &str = "admin@example.com";

/// Observable host state
#[derive(Debug, Default)]
pub struct HostState {
    /// Installed package -> version
    pub packages: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    /// Link path -> target
    pub symlinks: BTreeMap<String, String>,
    pub enabled: BTreeSet<String>,
    pub active: BTreeSet<String>,
    pub databases: BTreeSet<String>,
    /// Databases holding the webmail schema
    pub schemas: BTreeSet<String>,
    /// Database user -> password
    pub db_users: BTreeMap<String, String>,
}

impl HostState {
    pub fn install(&mut self, package: &str) {
        self.packages.insert(package.to_string(), "1.0-1".to_string());
    }

    pub fn run_unit(&mut self, unit: &str) {
        self.enabled.insert(unit.to_string());
        self.active.insert(unit.to_string());
    }
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    stderr: String,
}

/// In-memory host answering the provisioner's commands
#[derive(Debug, Default)]
pub struct FakeSystem {
    state: Mutex<HostState>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<Failure>>,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Every command line run so far, privileged ones prefixed with `sudo`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn called(&self, fragment: &str) -> bool {
        self.calls().iter().any(|c| c.contains(fragment))
    }

    /// Position of the first call containing `fragment`
    pub fn position(&self, fragment: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(fragment))
    }

    /// Make every command whose line contains `pattern` exit 1 with `stderr`
    pub fn fail_when(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
        self.failures.lock().unwrap().push(Failure {
            pattern: pattern.into(),
            stderr: stderr.into(),
        });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    fn injected_failure(&self, line: &str) -> Option<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .find(|f| line.contains(&f.pattern))
            .map(|f| f.stderr.clone())
    }

    fn dispatch(&self, spec: &CommandSpec) -> (i32, String, String) {
        let program = spec.program().to_string_lossy().into_owned();
        let args: Vec<&str> = spec.arguments().iter().map(String::as_str).collect();
        let mut state = self.state();

        match program.as_str() {
            bin::DPKG_QUERY => match (args.get(1).copied(), args.get(2)) {
                (Some("-f=${Status}"), Some(package)) if state.packages.contains_key(*package) => {
                    ok("install ok installed")
                }
                (Some("-f=${Version}"), Some(package)) => match state.packages.get(*package) {
                    Some(version) => ok(version),
                    None => fail("dpkg-query: no packages found"),
                },
                _ => fail("dpkg-query: no packages found"),
            },
            bin::APT_GET => {
                let packages = args[1..].iter().filter(|a| !a.starts_with('-'));
                match args.first().copied() {
                    Some("install") => {
                        for package in packages {
                            state.install(package);
                        }
                        ok("")
                    }
                    Some("remove") => {
                        for package in packages {
                            state.packages.remove(*package);
                        }
                        ok("")
                    }
                    _ => fail("E: Invalid operation"),
                }
            }
            bin::SYSTEMCTL => systemctl(&mut state, &args),
            bin::TEST => {
                let path = args.get(1).copied().unwrap_or_default();
                let found = match args.first().copied() {
                    Some("-e") => {
                        state.files.contains_key(path) || state.symlinks.contains_key(path)
                    }
                    Some("-L") => state.symlinks.contains_key(path),
                    Some("-S") => {
                        php_socket_unit(path).is_some_and(|unit| state.active.contains(&unit))
                    }
                    _ => false,
                };
                if found { ok("") } else { (1, String::new(), String::new()) }
            }
            bin::CAT => match state.files.get(args[0]) {
                Some(content) => ok(content),
                None => fail(&format!("cat: {}: No such file or directory", args[0])),
            },
            bin::TEE => {
                state
                    .files
                    .insert(args[0].to_string(), spec.input().unwrap_or_default().to_string());
                ok(spec.input().unwrap_or_default())
            }
            bin::CHMOD | bin::CHOWN => {
                if state.files.contains_key(args[1]) {
                    ok("")
                } else {
                    fail("No such file or directory")
                }
            }
            bin::MV => {
                let (source, dest) = (args[2], args[3]);
                match state.files.remove(source) {
                    Some(content) => {
                        state.files.insert(dest.to_string(), content);
                        ok("")
                    }
                    None => fail("mv: cannot stat: No such file or directory"),
                }
            }
            bin::RM => {
                let path = args[2];
                state.files.remove(path);
                state.symlinks.remove(path);
                ok("")
            }
            bin::LN => {
                state.symlinks.insert(args[3].to_string(), args[2].to_string());
                ok("")
            }
            bin::A2ENCONF => {
                let link = format!("/etc/apache2/conf-enabled/{}.conf", args[0]);
                let target = format!("../conf-available/{}.conf", args[0]);
                state.symlinks.insert(link, target);
                ok("")
            }
            bin::A2DISCONF => {
                state.symlinks.remove(APACHE_CONF_ENABLED);
                ok("")
            }
            bin::NGINX | bin::APACHE2CTL => ok("syntax is ok"),
            bin::UNBOUND_CHECKCONF => ok("unbound-checkconf: no errors"),
            bin::DIG => {
                if state.active.contains("unbound.service") {
                    ok("127.0.0.1\n")
                } else {
                    let timeout = ";; connection timed out; no servers could be reached\n";
                    (9, timeout.to_string(), String::new())
                }
            }
            bin::MYSQL => mysql(&mut state, spec, &args),
            _ => (127, String::new(), format!("{}: command not found", program)),
        }
    }
}

impl CommandRunner for FakeSystem {
    fn run(&self, spec: &CommandSpec) -> mailsmith::Result<CommandResult> {
        let line = spec.display_line();
        let recorded = if spec.is_privileged() {
            format!("sudo {}", line)
        } else {
            line.clone()
        };
        self.calls.lock().unwrap().push(recorded);

        let (exit_code, stdout, stderr) = match self.injected_failure(&line) {
            Some(stderr) => (1, String::new(), stderr),
            None => self.dispatch(spec),
        };
        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
        })
    }
}

fn ok(stdout: &str) -> (i32, String, String) {
    (0, stdout.to_string(), String::new())
}

fn fail(stderr: &str) -> (i32, String, String) {
    (1, String::new(), stderr.to_string())
}

/// `/run/php/php8.2-fpm.sock` -> `php8.2-fpm.service`
fn php_socket_unit(path: &str) -> Option<String> {
    let name = path.strip_prefix("/run/php/")?.strip_suffix(".sock")?;
    Some(format!("{}.service", name))
}

fn systemctl(state: &mut HostState, args: &[&str]) -> (i32, String, String) {
    match args {
        ["is-active", "--quiet", unit] => {
            if state.active.contains(*unit) { ok("") } else { (3, String::new(), String::new()) }
        }
        ["is-enabled", "--quiet", unit] => {
            if state.enabled.contains(*unit) { ok("") } else { (1, String::new(), String::new()) }
        }
        ["enable", unit] => {
            state.enabled.insert(unit.to_string());
            ok("")
        }
        ["disable", unit] => {
            state.enabled.remove(*unit);
            ok("")
        }
        ["start", unit] | ["restart", unit] => {
            state.active.insert(unit.to_string());
            ok("")
        }
        ["stop", unit] => {
            state.active.remove(*unit);
            ok("")
        }
        ["reload", unit] => {
            if state.active.contains(*unit) {
                ok("")
            } else {
                fail(&format!("{} is not active, cannot reload.", unit))
            }
        }
        _ => fail("Unknown command verb"),
    }
}

fn mysql(state: &mut HostState, spec: &CommandSpec, args: &[&str]) -> (i32, String, String) {
    // Login as the webmail user
    if let Some((_, password)) = spec.environment().iter().find(|(k, _)| k == "MYSQL_PWD") {
        let user = args
            .iter()
            .find_map(|a| a.strip_prefix("--user="))
            .unwrap_or_default();
        let db = args.last().copied().unwrap_or_default();
        if state.db_users.get(user) != Some(password) {
            return fail(&format!(
                "ERROR 1045 (28000): Access denied for user '{}'@'localhost'",
                user
            ));
        }
        let visible = state.databases.contains(db) && state.schemas.contains(db);
        return ok(if visible { "1\n" } else { "0\n" });
    }

    // Schema import: mysql --batch DB -e "SOURCE ..."
    if args.contains(&"-e") {
        let db = args[1];
        if !state.databases.contains(db) {
            return fail(&format!("ERROR 1049 (42000): Unknown database '{}'", db));
        }
        if !state.schemas.insert(db.to_string()) {
            return fail("ERROR 1050 (42S01) at line 1: Table 'cache' already exists");
        }
        return ok("");
    }

    let sql = spec.input().unwrap_or_default();
    if sql.contains("information_schema.SCHEMATA") {
        let name = capture(r"SCHEMA_NAME = '([^']*)'", sql).unwrap_or_default();
        return ok(if state.databases.contains(&name) { "1\n" } else { "0\n" });
    }
    if let Some(db) = capture(r"DROP DATABASE IF EXISTS `([^`]+)`", sql) {
        state.databases.remove(&db);
        state.schemas.remove(&db);
        if let Some(user) = capture(r"DROP USER IF EXISTS '([^']+)'", sql) {
            state.db_users.remove(&user);
        }
        return ok("");
    }
    if let Some(db) = capture(r"CREATE DATABASE IF NOT EXISTS `([^`]+)`", sql) {
        state.databases.insert(db);
        let user = capture(r"ALTER USER '([^']+)'", sql);
        let password = capture(r"ALTER USER '[^']+'@'localhost' IDENTIFIED BY '([^']*)'", sql);
        if let (Some(user), Some(password)) = (user, password) {
            state.db_users.insert(user, password);
        }
        return ok("");
    }
    fail("ERROR 1064 (42000): You have an error in your SQL syntax")
}

fn capture(pattern: &str, haystack: &str) -> Option<String> {
    Regex::new(pattern)
        .unwrap()
        .captures(haystack)
        .map(|c| c[1].to_string())
}

/// A provisioner over `fake` with its locks in a fresh temp directory
///
/// Returns (Provisioner, TempDir) - keep the TempDir alive to prevent cleanup.
pub fn provisioner(fake: &Arc<FakeSystem>, web_server: WebServer) -> (Provisioner, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_lock_dir(temp_dir.path())
        .with_audit_log(Some(temp_dir.path().join("audit.jsonl")))
        .with_privilege_prefix(Vec::new())
        .with_web_server(web_server);
    let provisioner = Provisioner::new(config, fake.clone()).unwrap();
    (provisioner, temp_dir)
}
