// tests/webmail.rs

//! Webmail setup sessions against the in-memory host

mod common;

use common::{DEFAULT_ADMIN, DEFAULT_DOMAIN, FakeSystem, provisioner};
use mailsmith::config_writer::{
    APACHE_CONF, APACHE_CONF_ENABLED, NGINX_SITE, NGINX_SITE_ENABLED, NGINX_SNIPPET,
    ROUNDCUBE_CONFIG,
};
use mailsmith::runner::bin;
use mailsmith::{AuditOutcome, Error, WebServer, WebmailSetupRequest, WebmailState};

fn request(domain: &str) -> WebmailSetupRequest {
    WebmailSetupRequest {
        domain: domain.to_string(),
        admin_email: DEFAULT_ADMIN.to_string(),
        reconfigure: false,
    }
}

#[test]
fn test_fresh_nginx_setup() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);

    let response = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();

    assert!(response.success);
    assert_eq!(response.webmail_url, "https://mail.example.com/webmail");
    assert_eq!(response.web_server, WebServer::Nginx);
    assert!(
        response
            .dns_instructions
            .iter()
            .any(|r| r.contains("MX record: example.com -> mail.example.com"))
    );

    let state = fake.state();
    assert!(state.packages.contains_key("roundcube"));
    assert!(state.packages.contains_key("php8.2-fpm"));
    assert!(state.active.contains("php8.2-fpm.service"));
    assert!(state.active.contains("nginx.service"));
    assert!(state.databases.contains("roundcubemail"));
    assert!(state.schemas.contains("roundcubemail"));

    let config = &state.files[ROUNDCUBE_CONFIG];
    assert!(config.contains("ssl://mail.example.com:993"));
    assert!(config.contains(&state.db_users["roundcube"]));
    assert!(state.files.contains_key(NGINX_SNIPPET));
    assert!(state.files.contains_key(NGINX_SITE));
    assert_eq!(state.symlinks[NGINX_SITE_ENABLED], NGINX_SITE);
    // No staging files left behind
    assert!(!state.files.keys().any(|p| p.ends_with(".mailsmith-new")));
}

#[test]
fn test_config_tested_before_reload() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();

    let test = fake.position(&format!("{} -t", bin::NGINX)).unwrap();
    let reload = fake.position("systemctl reload nginx.service").unwrap();
    assert!(test < reload);
}

#[test]
fn test_secrets_never_on_command_line() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();

    let password = fake.state().db_users["roundcube"].clone();
    assert_eq!(password.len(), 32);
    assert!(fake.calls().iter().all(|c| !c.contains(&password)));
}

#[test]
fn test_status_after_setup() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);

    let before = provisioner.webmail_status();
    assert!(!before.installed);
    assert_eq!(before.status, WebmailState::NotInstalled);

    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();
    let status = provisioner.webmail_status();
    assert!(status.installed);
    assert_eq!(status.status, WebmailState::Configured);
    assert_eq!(status.domain.as_deref(), Some("example.com"));
    assert_eq!(status.url.as_deref(), Some("https://mail.example.com/webmail"));
    assert_eq!(status.version.as_deref(), Some("1.0-1"));
    assert!(!status.needs_reconfigure);
    assert!(status.missing.is_empty());
}

#[test]
fn test_lock_held_is_conflict_without_side_effects() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    let _held = provisioner.locks().try_acquire("webmail-setup").unwrap().unwrap();

    let err = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();

    assert!(matches!(err, Error::Conflict(ref msg) if msg.contains("in progress")));
    assert!(fake.calls().is_empty());
}

#[test]
fn test_failed_config_test_unwinds_webserver_only() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.fail_when(
        format!("{} -t", bin::NGINX),
        "nginx: [emerg] unknown directive \"fastcgi_pas\" in /etc/nginx/snippets/roundcube-webmail.conf:9",
    );

    let err = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();

    match err {
        Error::PhaseFailed { phase, detail } => {
            assert_eq!(phase, "test-webserver-config");
            assert!(detail.contains("unknown directive"));
        }
        other => panic!("expected phase failure, got {:?}", other),
    }

    let state = fake.state();
    // Web server wiring is gone
    assert!(!state.files.contains_key(NGINX_SNIPPET));
    assert!(!state.files.contains_key(NGINX_SITE));
    assert!(!state.symlinks.contains_key(NGINX_SITE_ENABLED));
    assert!(!state.active.contains("nginx.service"));
    assert!(!state.enabled.contains("nginx.service"));
    // Application sub-chain before the checkpoint is kept
    assert!(state.files.contains_key(ROUNDCUBE_CONFIG));
    assert!(state.databases.contains("roundcubemail"));
    assert!(state.packages.contains_key("roundcube"));
    drop(state);

    assert!(!fake.called("systemctl reload nginx.service"));
}

#[test]
fn test_failed_session_is_audited() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.fail_when(format!("{} -t", bin::NGINX), "nginx: [emerg] broken");

    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();

    let entries = provisioner.audit().recent(100);
    assert_eq!(entries[0].outcome, AuditOutcome::Started);
    assert!(entries.iter().all(|e| e.session_id == entries[0].session_id));
    let tail: Vec<_> = entries
        .iter()
        .skip_while(|e| e.outcome != AuditOutcome::Failed)
        .map(|e| (e.phase.as_deref().unwrap_or_default(), e.outcome))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("test-webserver-config", AuditOutcome::Failed),
            ("enable-webserver-snippet", AuditOutcome::RolledBack),
            ("write-webserver-snippet", AuditOutcome::RolledBack),
            ("activate-webserver", AuditOutcome::RolledBack),
        ]
    );

    // The same entries are appended to the audit file
    let path = provisioner.config().paths.audit_log.clone().unwrap();
    let lines = std::fs::read_to_string(path).unwrap();
    assert_eq!(lines.lines().count(), entries.len());
    assert!(lines.contains("\"outcome\":\"failed\""));
}

#[test]
fn test_retry_after_failure_completes() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.fail_when(format!("{} -t", bin::NGINX), "nginx: [emerg] broken");
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();

    fake.clear_failures();
    let status = provisioner.webmail_status();
    assert_eq!(status.status, WebmailState::Incomplete);
    assert!(status.needs_reconfigure);
    assert!(status.missing.contains(&"snippet".to_string()));

    // The schema is already there; the import is tolerated
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();
    assert_eq!(provisioner.webmail_status().status, WebmailState::Configured);
}

#[test]
fn test_retry_keeps_database_and_config_credentials_in_step() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.fail_when(format!("{} -t", bin::NGINX), "nginx: [emerg] broken");
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();
    let password = fake.state().db_users["roundcube"].clone();

    // The retry dies after the database step, unwinding the config write
    fake.clear_failures();
    fake.fail_when(bin::CHMOD, "chmod: changing permissions: Operation not permitted");
    let err = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();
    assert!(matches!(err, Error::PhaseFailed { ref phase, .. } if phase == "write-webmail-config"));

    let state = fake.state();
    assert_eq!(state.db_users["roundcube"], password);
    assert!(state.files[ROUNDCUBE_CONFIG].contains(&password));
}

#[test]
fn test_bare_domain_served_on_mail_host() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);

    let response = provisioner.setup_webmail(&request("example.com")).unwrap();

    assert_eq!(response.webmail_url, "https://mail.example.com/webmail");
    let status = provisioner.webmail_status();
    assert_eq!(status.url.as_deref(), Some(response.webmail_url.as_str()));
    assert_eq!(status.domain.as_deref(), Some("example.com"));
    assert!(fake.state().files[NGINX_SITE].contains("server_name mail.example.com;"));
}

#[test]
fn test_early_failure_removes_new_database() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.fail_when("--user=roundcube", "ERROR 1045 (28000): Access denied");

    let err = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();
    assert!(matches!(
        err,
        Error::PhaseFailed { ref phase, .. } if phase == "verify-database-access"
    ));

    let state = fake.state();
    assert!(!state.databases.contains("roundcubemail"));
    assert!(!state.db_users.contains_key("roundcube"));
    assert!(!state.files.contains_key(ROUNDCUBE_CONFIG));
    assert!(!state.packages.contains_key("roundcube"));
    assert!(!state.packages.contains_key("php8.2-fpm"));
    assert!(!state.active.contains("php8.2-fpm.service"));
}

#[test]
fn test_second_setup_is_conflict() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();
    fake.clear_calls();

    let err = provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap_err();

    assert!(matches!(err, Error::Conflict(ref msg) if msg.contains("already configured")));
    // Only probes ran
    assert!(!fake.called("apt-get"));
    assert!(!fake.called(bin::TEE));
    assert!(!fake.called(bin::MYSQL));
}

#[test]
fn test_reconfigure_touches_webserver_only() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    provisioner.setup_webmail(&request(DEFAULT_DOMAIN)).unwrap();
    let password = fake.state().db_users["roundcube"].clone();
    fake.clear_calls();

    let mut req = request(DEFAULT_DOMAIN);
    req.reconfigure = true;
    let response = provisioner.setup_webmail(&req).unwrap();

    assert!(response.success);
    assert!(!fake.called("apt-get install"));
    assert!(!fake.called(bin::MYSQL));
    assert!(!fake.called(&format!("{}.mailsmith-new", ROUNDCUBE_CONFIG)));
    assert!(fake.called(&format!("{} -t", bin::NGINX)));
    assert!(fake.called("systemctl reload nginx.service"));
    assert_eq!(fake.state().db_users["roundcube"], password);
}

#[test]
fn test_interrupted_install_replays_full_setup() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);
    fake.state().install("roundcube");

    let status = provisioner.webmail_status();
    assert_eq!(status.status, WebmailState::Incomplete);
    assert!(status.missing.contains(&"config".to_string()));

    let mut req = request(DEFAULT_DOMAIN);
    req.reconfigure = true;
    provisioner.setup_webmail(&req).unwrap();

    assert!(fake.called("apt-get install"));
    assert!(fake.state().databases.contains("roundcubemail"));
    assert_eq!(provisioner.webmail_status().status, WebmailState::Configured);
}

#[test]
fn test_apache_setup_displaces_nginx() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Apache);
    fake.state().run_unit("nginx.service");

    let response = provisioner.setup_webmail(&request("example.org")).unwrap();

    assert_eq!(response.web_server, WebServer::Apache);
    assert_eq!(response.dns_instructions.len(), 3);
    assert!(!fake.called("php8.2-fpm"));

    let state = fake.state();
    assert!(!state.active.contains("nginx.service"));
    assert!(!state.enabled.contains("nginx.service"));
    assert!(state.active.contains("apache2.service"));
    assert!(state.files.contains_key(APACHE_CONF));
    assert!(state.symlinks.contains_key(APACHE_CONF_ENABLED));
    drop(state);

    let stop_nginx = fake.position("systemctl stop nginx.service").unwrap();
    let start_apache = fake.position("systemctl start apache2.service").unwrap();
    assert!(stop_nginx < start_apache);
}

#[test]
fn test_apache_failure_restores_nginx() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Apache);
    fake.state().run_unit("nginx.service");
    fake.fail_when(format!("{} configtest", bin::APACHE2CTL), "AH00526: Syntax error");

    provisioner.setup_webmail(&request("example.org")).unwrap_err();

    let state = fake.state();
    assert!(state.active.contains("nginx.service"));
    assert!(state.enabled.contains("nginx.service"));
    assert!(!state.active.contains("apache2.service"));
    assert!(!state.files.contains_key(APACHE_CONF));
    assert!(!state.symlinks.contains_key(APACHE_CONF_ENABLED));
    drop(state);

    // Undone with the tool that disables confs, not the one that enables them
    let calls = fake.calls();
    let enable = calls.iter().position(|c| c.contains(bin::A2ENCONF)).unwrap();
    let disable = calls.iter().position(|c| c.contains(bin::A2DISCONF)).unwrap();
    assert!(enable < disable);
    assert_eq!(calls.iter().filter(|c| c.contains(bin::A2ENCONF)).count(), 1);
}

#[test]
fn test_invalid_input_runs_nothing() {
    let fake = FakeSystem::new();
    let (provisioner, _dir) = provisioner(&fake, WebServer::Nginx);

    let err = provisioner.setup_webmail(&request("exa mple.com; rm -rf /")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let mut req = request(DEFAULT_DOMAIN);
    req.admin_email = "not-an-email".to_string();
    let err = provisioner.setup_webmail(&req).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert!(fake.calls().is_empty());
}
