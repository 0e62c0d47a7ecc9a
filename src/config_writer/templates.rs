// src/config_writer/templates.rs

//! Rendered configuration files
//!
//! Every interpolated value is either validated upstream (domain, socket
//! path, forwarder address) or escaped for its target syntax
//! ([`php_escape`] for PHP single-quoted strings).

use crate::secrets::{DES_KEY_LEN, WebmailSecrets};
use crate::{Error, Result};
use std::fmt::Write;
use std::net::IpAddr;

/// Webroot of the Debian roundcube package
pub const ROUNDCUBE_WEBROOT: &str = "/var/lib/roundcube/public_html";

/// Escape for a PHP single-quoted string literal
///
/// Only `\\` and `\'` are escapes in that context.
pub fn php_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out
}

/// Inputs for `config.inc.php`
#[derive(Clone)]
pub struct RoundcubeSettings {
    pub domain: String,
    pub admin_email: String,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub des_key: String,
    pub product_name: String,
}

impl RoundcubeSettings {
    fn validate(&self) -> Result<()> {
        if self.des_key.len() != 24 {
            return Err(Error::Validation(format!(
                "des_key must be exactly 24 characters, got {}",
                self.des_key.len()
            )));
        }
        for (field, value) in [
            ("domain", &self.domain),
            ("db_host", &self.db_host),
            ("db_name", &self.db_name),
            ("db_user", &self.db_user),
            ("db_password", &self.db_password),
        ] {
            if value.is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

const TLS_VERIFY: &str = "array(
    'ssl' => array(
        'verify_peer'       => true,
        'verify_peer_name'  => true,
        'allow_self_signed' => false,
    ),
)";

/// Render Roundcube's `config.inc.php`
pub fn roundcube_config(settings: &RoundcubeSettings) -> Result<String> {
    settings.validate()?;

    let dsn = format!(
        "mysql://{}:{}@{}/{}",
        php_escape(&settings.db_user),
        php_escape(&settings.db_password),
        php_escape(&settings.db_host),
        php_escape(&settings.db_name),
    );
    let mail_host = php_escape(&format!("mail.{}", settings.domain));

    Ok(format!(
        "<?php

/* config.inc.php - generated by mailsmith
 * Do not edit; changes are overwritten on reconfiguration.
 */

// Database
$config['db_dsnw'] = '{dsn}';

// IMAP
$config['imap_host'] = 'ssl://{mail_host}:993';
$config['imap_conn_options'] = {tls};

// SMTP
$config['smtp_host'] = 'tls://{mail_host}:587';
$config['smtp_user'] = '%u';
$config['smtp_pass'] = '%p';
$config['smtp_conn_options'] = {tls};

// System
$config['support_url'] = 'mailto:{admin}';
$config['product_name'] = '{product}';
$config['des_key'] = '{des_key}';
$config['plugins'] = array(
    'archive',
    'zipdownload',
);

// User interface
$config['language'] = 'en_US';
$config['skin'] = 'elastic';
$config['draft_autosave'] = 60;
",
        dsn = dsn,
        mail_host = mail_host,
        tls = TLS_VERIFY,
        admin = php_escape(&settings.admin_email),
        product = php_escape(&settings.product_name),
        des_key = php_escape(&settings.des_key),
    ))
}

/// Inverse of [`php_escape`]
fn php_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match (c, chars.clone().next()) {
            ('\\', Some(next @ ('\\' | '\''))) => {
                out.push(next);
                chars.next();
            }
            (other, _) => out.push(other),
        }
    }
    out
}

/// Value of a `$config['key'] = '...';` line, unescaped
fn config_value(content: &str, key: &str) -> Option<String> {
    let prefix = format!("$config['{}'] = '", key);
    content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(prefix.as_str())?;
        let raw = rest.strip_suffix("';")?;
        Some(php_unescape(raw))
    })
}

/// Recover the credentials of `db_user` from a rendered `config.inc.php`
///
/// Returns `None` unless both the DSN password and a well-formed DES key
/// are present.
pub fn secrets_from_roundcube_config(content: &str, db_user: &str) -> Option<WebmailSecrets> {
    let dsn = config_value(content, "db_dsnw")?;
    let userinfo = dsn.strip_prefix("mysql://")?.rsplit_once('@')?.0;
    let password = userinfo.strip_prefix(db_user)?.strip_prefix(':')?;
    let des_key = config_value(content, "des_key")?;
    if password.is_empty() || des_key.chars().count() != DES_KEY_LEN {
        return None;
    }
    Some(WebmailSecrets {
        db_password: password.to_string(),
        des_key,
    })
}

/// Recover the webmail domain from a rendered `config.inc.php`
pub fn domain_from_roundcube_config(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("$config['imap_host'] = 'ssl://")?;
        let host = rest.split(':').next()?;
        Some(host.strip_prefix("mail.").unwrap_or(host).to_string())
    })
}

/// `location /webmail` block included by the nginx site
pub fn nginx_snippet(php_socket: &str) -> String {
    format!(
        "# Managed by mailsmith
location ^~ /webmail {{
    alias {root}/;
    index index.php;

    add_header X-Frame-Options \"SAMEORIGIN\" always;
    add_header X-Content-Type-Options \"nosniff\" always;
    add_header Referrer-Policy \"strict-origin-when-cross-origin\" always;

    location ~ ^/webmail/(config|temp|logs|bin|SQL)/ {{
        deny all;
    }}

    location ~ \\.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_param SCRIPT_FILENAME $request_filename;
        fastcgi_pass unix:{socket};
    }}
}}
",
        root = ROUNDCUBE_WEBROOT,
        socket = php_socket,
    )
}

/// nginx server block for the webmail domain
pub fn nginx_site(domain: &str) -> String {
    format!(
        "# Managed by mailsmith
server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

    include snippets/roundcube-webmail.conf;
}}
",
        domain = domain,
    )
}

/// Apache `conf-available` fragment served through mod_php
pub fn apache_conf() -> String {
    format!(
        "# Managed by mailsmith
Alias /webmail {root}

<Directory {root}>
    Options -Indexes +FollowSymLinks
    AllowOverride None
    Require all granted

    <IfModule mod_headers.c>
        Header always set X-Frame-Options \"SAMEORIGIN\"
        Header always set X-Content-Type-Options \"nosniff\"
        Header always set Referrer-Policy \"strict-origin-when-cross-origin\"
    </IfModule>
</Directory>
",
        root = ROUNDCUBE_WEBROOT,
    )
}

/// unbound forward zone sending every query to `forwarders`
pub fn unbound_forward(forwarders: &[IpAddr]) -> Result<String> {
    if forwarders.is_empty() {
        return Err(Error::Validation("at least one forwarder is required".to_string()));
    }
    let mut out = String::from("# Managed by mailsmith\nforward-zone:\n    name: \".\"\n");
    for addr in forwarders {
        // Infallible for String
        let _ = writeln!(out, "    forward-addr: {}", addr);
    }
    Ok(out)
}
