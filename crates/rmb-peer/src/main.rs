#![forbid(unsafe_code)]

use rmb_peer::config::{load_config, Cli, Commands};
use rmb_peer::connection::{authenticated_url, RelayAuth};
use rmb_peer::{Identity, PeerConfig};

use clap::Parser;
use std::io::IsTerminal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

/// Config file and environment, then command-line overrides.
fn effective_config(cli: &Cli) -> anyhow::Result<PeerConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if !cli.relays.is_empty() {
        config.relays.clone_from(&cli.relays);
    }
    if let Some(key_type) = cli.key_type {
        config.key_type = key_type;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    debug!(?config, "effective configuration");
    Ok(config)
}

fn print_field(label: &str, value: &str) {
    if tty() {
        println!("  {DIM}{label:<10}{RESET} {CYAN}{value}{RESET}");
    } else {
        println!("{label}: {value}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("failed to install rustls crypto provider, it may already be installed");
    }

    let cli = Cli::parse();
    init_tracing(&cli)?;

    match &cli.command {
        Commands::Keygen => {
            println!("{}", Identity::generate_phrase()?);
        }

        Commands::Keys { mnemonic } => {
            let config = effective_config(&cli)?;
            let identity = Identity::from_mnemonic(mnemonic, config.key_type)?;
            if tty() {
                println!();
                println!("  {BOLD}RMB identity{RESET}");
            }
            print_field("key type", identity.key_type().as_str());
            print_field("account", &hex::encode(identity.account_key()));
            print_field("e2e", &hex::encode(identity.e2e_key().public_key()));
        }

        Commands::Token {
            mnemonic,
            twin,
            session,
        } => {
            let config = effective_config(&cli)?;
            let identity = Identity::from_mnemonic(mnemonic, config.key_type)?;
            let auth = RelayAuth {
                signer: identity.signer().clone(),
                twin: *twin,
                session: session.clone().or(config.session.clone()),
            };
            info!(twin, relays = config.relays.len(), "issuing relay tokens");
            for relay in &config.relays {
                println!("{}", authenticated_url(relay, &auth, config.token_ttl_s)?);
            }
        }

        Commands::Check => {
            let config = effective_config(&cli)?;
            let relay = rmb_peer::peer::relay_record(&config.relays)?;
            print_field("relays", &config.relays.join(", "));
            print_field("record", &relay);
            print_field("key type", config.key_type.as_str());
            print_field("session", config.session.as_deref().unwrap_or("-"));
            print_field(
                "e2e",
                if config.encryption.enabled {
                    "enabled"
                } else {
                    "disabled"
                },
            );
            print_field("timeout", &format!("{}s", config.rpc.call_timeout_s));
        }
    }

    Ok(())
}
