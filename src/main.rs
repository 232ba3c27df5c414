//! Command line interface for NCC-05 endpoint directories. Runs an in-memory
//! relay, generates identities, and publishes or resolves encrypted endpoint
//! records.

mod client;
mod config;
mod discovery;
mod envelope;
mod error;
mod event;
mod message;
mod nip44;
mod publisher;
mod relay_list;
mod resolver;
mod server;
mod storage;
mod ws;

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use config::Settings;
use discovery::EndpointConfig;
use envelope::Policy;
use event::{Keys, Signer};
use publisher::PublishOptions;
use relay_list::RelayList;
use resolver::ResolveOptions;
use storage::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "ncc05",
    author,
    version,
    about = "Encrypted endpoint directory over Nostr relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the relay's HTTP and WebSocket services.
    Serve,
    /// Generate a new identity.
    Keygen {
        /// Store the secret key as `SECRET_KEY` in the env file.
        #[arg(long)]
        save: bool,
    },
    /// Publish this host's endpoints as a directory record.
    Publish(PublishArgs),
    /// Fetch and decode an identity's directory record.
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct PublishArgs {
    /// Advertise this IPv4 or IPv6 address instead of detecting one.
    #[arg(long)]
    ip: Option<String>,
    /// Ask an external service for the public IP when none is found locally.
    #[arg(long)]
    discover_ip: bool,
    /// Advertise a `.onion` host.
    #[arg(long)]
    onion: Option<String>,
    /// Tor hidden service directory containing a `hostname` file.
    #[arg(long)]
    onion_dir: Option<PathBuf>,
    /// Port advertised with every address (defaults to `ENDPOINT_PORT`).
    #[arg(long)]
    port: Option<u16>,
    /// Relay to submit to; repeatable (defaults to `RELAYS`).
    #[arg(long = "relay")]
    relays: Vec<String>,
    /// Also publish a relay list with these comma-separated relays.
    #[arg(long, value_delimiter = ',')]
    relay_list: Vec<String>,
    #[arg(long)]
    identifier: Option<String>,
    #[arg(long, default_value = publisher::DEFAULT_NOTES)]
    notes: String,
    /// Publish the payload unencrypted.
    #[arg(long, conflicts_with_all = ["to", "recipients"])]
    plain: bool,
    /// Encrypt for this public key instead of yourself.
    #[arg(long, conflicts_with = "recipients")]
    to: Option<String>,
    /// Group-wrap for these comma-separated public keys.
    #[arg(long, value_delimiter = ',')]
    recipients: Vec<String>,
}

impl PublishArgs {
    fn policy(&self) -> Policy {
        if self.plain {
            Policy::Plain
        } else if !self.recipients.is_empty() {
            Policy::GroupWrap {
                recipients: self.recipients.clone(),
            }
        } else {
            Policy::Direct {
                target: self.to.clone(),
            }
        }
    }
}

#[derive(Args)]
struct ResolveArgs {
    /// Identity to resolve (defaults to your own).
    #[arg(long)]
    pubkey: Option<String>,
    /// Relay to query; repeatable (defaults to `BOOTSTRAP_RELAY`).
    #[arg(long = "relay")]
    relays: Vec<String>,
    /// Follow the identity's relay list.
    #[arg(long)]
    gossip: bool,
    #[arg(long)]
    identifier: Option<String>,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    config::ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Serve => {
            let store = Store::new(cfg.verify_sig);
            let http_addr: SocketAddr = cfg.bind_http.parse().context("BIND_HTTP")?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse().context("BIND_WS")?;
            tokio::try_join!(
                server::serve_http(http_addr, store.clone(), std::future::pending()),
                ws::serve_ws(ws_addr, store, std::future::pending())
            )?;
        }
        Commands::Keygen { save } => {
            let keys = Keys::generate();
            if save {
                config::write_env_var(&cli.env, "SECRET_KEY", &keys.secret_hex())?;
                tracing::info!("secret key saved to {}", cli.env);
            } else {
                println!("secret key: {}", keys.secret_hex());
            }
            println!("public key: {}", keys.public_key());
        }
        Commands::Publish(args) => publish(&cfg, args).await?,
        Commands::Resolve(args) => resolve(&cfg, args).await?,
    }
    Ok(())
}

fn load_keys(cfg: &Settings) -> anyhow::Result<Keys> {
    let hex = cfg
        .secret_key
        .as_deref()
        .ok_or_else(|| anyhow!("SECRET_KEY is not set; run `ncc05 keygen --save`"))?;
    Ok(Keys::parse(hex)?)
}

async fn publish(cfg: &Settings, args: PublishArgs) -> anyhow::Result<()> {
    let keys = load_keys(cfg)?;
    let policy = args.policy();
    let opts = PublishOptions {
        relays: if args.relays.is_empty() {
            cfg.relays.clone()
        } else {
            args.relays
        },
        identifier: args.identifier.unwrap_or_else(|| cfg.identifier.clone()),
        ttl: cfg.ttl,
        notes: args.notes,
        timeout: cfg.timeout,
        socks_proxy: cfg.tor_socks.clone(),
    };
    if !args.relay_list.is_empty() {
        let list = RelayList::from_urls(&args.relay_list);
        if list.entries.is_empty() {
            bail!("--relay-list has no usable ws:// or wss:// urls");
        }
        publisher::publish_relay_list(&keys, &list, &opts).await?;
    }
    let endpoints = EndpointConfig {
        ip: args.ip,
        discover_ip: args.discover_ip,
        onion: args.onion,
        onion_dir: args.onion_dir,
        port: args.port.unwrap_or(cfg.endpoint_port),
    };
    let publication = publisher::publish(&keys, &endpoints, &policy, &opts).await?;
    tracing::info!(accepted_by = ?publication.accepted_by, "published");
    println!("{}", publication.event_id);
    Ok(())
}

async fn resolve(cfg: &Settings, args: ResolveArgs) -> anyhow::Result<()> {
    let keys = cfg.secret_key.as_deref().map(Keys::parse).transpose()?;
    let target = match (args.pubkey, &keys) {
        (Some(pk), _) => pk,
        (None, Some(keys)) => keys.public_key(),
        (None, None) => bail!("--pubkey is required without SECRET_KEY"),
    };
    let identifier = args.identifier.unwrap_or_else(|| cfg.identifier.clone());
    let opts = ResolveOptions {
        bootstrap: if args.relays.is_empty() {
            vec![cfg.bootstrap_relay.clone()]
        } else {
            args.relays
        },
        gossip: args.gossip,
        timeout: cfg.timeout,
        socks_proxy: cfg.tor_socks.clone(),
    };
    match resolver::resolve(keys.as_ref(), &target, &identifier, &opts).await? {
        Some(resolution) => {
            tracing::info!(id = %resolution.event.id, relays = ?resolution.relays, "resolved");
            println!("{}", serde_json::to_string_pretty(&resolution.payload)?);
            Ok(())
        }
        None => bail!("no record found for {target} under {identifier:?}"),
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
