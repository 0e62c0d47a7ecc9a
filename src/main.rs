// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mailsmith::config::DEFAULT_CONFIG_PATH;
use mailsmith::{
    Config, DnsForwardRequest, Provisioner, ServiceEnableRequest, WebmailSetupRequest,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "mailsmithd")]
#[command(author, version, long_about = None)]
#[command(about = "Provision webmail, DNS forwarding and mail services")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    #[cfg(feature = "daemon")]
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Webmail operations
    #[command(subcommand)]
    Webmail(WebmailCommands),
    /// Service operations
    #[command(subcommand)]
    Services(ServicesCommands),
    /// DNS operations
    #[command(subcommand)]
    Dns(DnsCommands),
}

#[derive(Subcommand)]
enum WebmailCommands {
    /// Install and configure webmail
    Setup {
        /// Domain the webmail is served under
        #[arg(long)]
        domain: String,
        /// Roundcube support contact
        #[arg(long)]
        admin_email: String,
        /// Re-apply web server wiring on a configured install
        #[arg(long)]
        reconfigure: bool,
    },
    /// Show installation state
    Status,
}

#[derive(Subcommand)]
enum ServicesCommands {
    /// Enable or disable services (NAME, NAME=on, NAME=off)
    Enable {
        #[arg(required = true)]
        services: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DnsCommands {
    /// Run unbound locally, forwarding to upstream resolvers
    Forward(ForwardArgs),
}

#[derive(Args)]
struct ForwardArgs {
    /// Upstream resolver (repeatable; configured defaults when omitted)
    #[arg(long = "forwarder")]
    forwarders: Vec<String>,
    /// Restart postfix so it picks up the new resolver
    #[arg(long)]
    restart_postfix: bool,
    #[arg(long)]
    reconfigure: bool,
}

/// Parse `NAME`, `NAME=on` or `NAME=off`
fn parse_service_spec(spec: &str) -> Result<(String, bool)> {
    match spec.split_once('=') {
        None => Ok((spec.to_string(), true)),
        Some((name, state)) => {
            let enable = match state {
                "on" | "true" | "yes" => true,
                "off" | "false" | "no" => false,
                other => bail!("invalid state '{}' for {} (expected on or off)", other, name),
            };
            Ok((name.to_string(), enable))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber for logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        #[cfg(feature = "daemon")]
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
            runtime.block_on(mailsmith::daemon::run_daemon(config))?;
            Ok(())
        }
        Commands::Webmail(WebmailCommands::Setup {
            domain,
            admin_email,
            reconfigure,
        }) => {
            info!("Setting up webmail for {}", domain);
            let provisioner = Provisioner::from_config(config)?;
            let response = provisioner.setup_webmail(&WebmailSetupRequest {
                domain,
                admin_email,
                reconfigure,
            })?;
            print_json(&response)
        }
        Commands::Webmail(WebmailCommands::Status) => {
            let provisioner = Provisioner::from_config(config)?;
            print_json(&provisioner.webmail_status())
        }
        Commands::Services(ServicesCommands::Enable { services }) => {
            let services = services
                .iter()
                .map(|s| parse_service_spec(s))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let provisioner = Provisioner::from_config(config)?;
            let response = provisioner.enable_services(&ServiceEnableRequest { services })?;
            print_json(&response)?;
            if !response.all_ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Dns(DnsCommands::Forward(args)) => {
            let provisioner = Provisioner::from_config(config)?;
            let response = provisioner.setup_dns_forward(&DnsForwardRequest {
                forwarders: (!args.forwarders.is_empty()).then_some(args.forwarders),
                restart_postfix: args.restart_postfix,
                reconfigure: args.reconfigure,
            })?;
            print_json(&response)
        }
    }
}
