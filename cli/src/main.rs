//! yamf — microservice fabric CLI.
//!
//! Serving subcommands:
//! - `yamf registry`: run the authoritative registry process
//! - `yamf gateway`: run the public edge, pulling state from the registry
//!
//! Thin client subcommands, talking directly to the registry URL:
//! - `yamf call <service> [payload]`, `yamf publish <channel> [message]`,
//!   `yamf lookup <service|*>`, `yamf health`

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use yamf::wire::header;
use yamf::{Command as Verb, FabricClient, FabricConfig, Gateway, Payload, Registry};

/// yamf — polyglot microservice fabric over plain HTTP.
#[derive(Parser)]
#[command(
    name = "yamf",
    version,
    about = "yamf — registry, gateway, and client tooling for the microservice fabric"
)]
struct Cli {
    /// Path to yamf.toml [default: ./yamf.toml or ~/.config/yamf/yamf.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry process
    Registry {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:7654")]
        bind: String,
    },
    /// Run the gateway process
    Gateway {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:7600")]
        bind: String,
    },
    /// Call a service by name via the registry
    Call {
        /// Target service name
        service: String,
        /// Payload: JSON when it parses, plain text otherwise
        payload: Option<String>,
        /// End-user auth token, for services guarded by an auth-service
        #[arg(long)]
        auth_token: Option<String>,
    },
    /// Publish a message to a pub/sub channel via the registry
    Publish {
        /// Channel name
        channel: String,
        /// Message: JSON when it parses, plain text otherwise
        message: Option<String>,
    },
    /// Look up a service location, or `*` for the full directory
    Lookup {
        /// Service name or `*`
        service: String,
    },
    /// Register an HTTP route for a service (trailing `*` makes it a prefix route)
    Route {
        /// Target service name
        service: String,
        /// URL path, e.g. `/api/echo` or `/files/*`
        path: String,
        /// Declared payload type for the route
        #[arg(long)]
        datatype: Option<String>,
    },
    /// Dump the registry's full state snapshot
    Pull,
    /// Check registry health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the root token for graceful shutdown.
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Registry { bind } => {
            let handle = Registry::start(config, &bind, cancel.clone())
                .await
                .map_err(|e| anyhow::anyhow!("failed to start registry: {e}"))?;
            eprintln!("registry listening on {}", handle.url());
            cancel.cancelled().await;
            handle.shutdown().await;
        }
        Commands::Gateway { bind } => {
            let handle = Gateway::start(config, &bind, cancel.clone())
                .await
                .map_err(|e| anyhow::anyhow!("failed to start gateway: {e}"))?;
            eprintln!("gateway listening on {} as {}", handle.url(), handle.location);
            cancel.cancelled().await;
            handle.shutdown().await;
        }
        Commands::Call { service, payload, auth_token } => {
            let client = FabricClient::new(config)?;
            let mut headers = vec![(header::SERVICE_NAME, service.as_str())];
            if let Some(token) = auth_token.as_deref() {
                headers.push((header::AUTH_TOKEN, token));
            }
            let response = client
                .registry_command(Verb::ServiceCall, &headers, &parse_payload(payload))
                .await?;
            print_payload(response);
        }
        Commands::Publish { channel, message } => {
            let client = FabricClient::new(config)?;
            let response = client
                .registry_command(
                    Verb::PubsubPublish,
                    &[(header::PUBSUB_CHANNEL, channel.as_str())],
                    &parse_payload(message),
                )
                .await?;
            print_payload(response);
        }
        Commands::Lookup { service } => {
            let client = FabricClient::new(config)?;
            let response = client
                .registry_command(
                    Verb::ServiceLookup,
                    &[(header::SERVICE_NAME, service.as_str())],
                    &Payload::Empty,
                )
                .await?;
            print_payload(response);
        }
        Commands::Route { service, path, datatype } => {
            let client = FabricClient::new(config)?;
            let mut headers = vec![
                (header::SERVICE_NAME, service.as_str()),
                (header::ROUTE_PATH, path.as_str()),
            ];
            if let Some(datatype) = datatype.as_deref() {
                headers.push((header::ROUTE_DATATYPE, datatype));
            }
            let response = client
                .registry_command(Verb::RouteRegister, &headers, &Payload::Empty)
                .await?;
            print_payload(response);
        }
        Commands::Pull => {
            let client = FabricClient::new(config)?;
            let response = client
                .registry_command(Verb::RegistryPull, &[], &Payload::Empty)
                .await?;
            print_payload(response);
        }
        Commands::Health => {
            let client = FabricClient::new(config)?;
            let response = client
                .registry_command(Verb::Health, &[], &Payload::Empty)
                .await?;
            print_payload(response);
        }
    }

    Ok(())
}

/// Resolve and load configuration: explicit --config, else ./yamf.toml,
/// else ~/.config/yamf/yamf.toml, else environment only.
fn load_config(explicit: Option<&Path>) -> Result<FabricConfig> {
    if let Some(path) = explicit {
        return FabricConfig::from_env_and_file(path)
            .map_err(|e| anyhow::anyhow!("config error: {e}"));
    }

    let local = Path::new("yamf.toml");
    if local.exists() {
        return FabricConfig::from_env_and_file(local)
            .map_err(|e| anyhow::anyhow!("config error: {e}"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("yamf").join("yamf.toml");
        if xdg.exists() {
            return FabricConfig::from_env_and_file(&xdg)
                .map_err(|e| anyhow::anyhow!("config error: {e}"));
        }
    }

    Ok(FabricConfig::from_env())
}

/// CLI argument to wire payload: JSON when it parses, plain text otherwise.
fn parse_payload(arg: Option<String>) -> Payload {
    match arg {
        None => Payload::Empty,
        Some(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(text),
        },
    }
}

fn print_payload(payload: Payload) {
    match payload {
        Payload::Json(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
        }
        Payload::Text(text) => println!("{text}"),
        Payload::Binary(bytes) => {
            use std::io::Write;
            std::io::stdout().write_all(&bytes).ok();
        }
        Payload::Empty => {}
    }
}
