use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::time::Duration;
use tonic::metadata::{AsciiMetadataKey, MetadataMap, MetadataValue};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rategate::config::{GateConfig, IdentitySource};
use rategate::grpc::{internal_status, Admission, CallContext, CallGate};

#[derive(Debug, Parser)]
#[command(name = "rategate", version, about = "Fixed-window rate limiting gate for gRPC")]
struct Cli {
    /// Gate configuration file (YAML), overridable with RATEGATE__* variables
    #[arg(short, long, default_value = "rategate.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration and print the declared rules
    Validate,
    /// Send a sequence of calls through the configured gate
    Simulate {
        /// Method identifier, e.g. /pkg.Echo/Say
        #[arg(long)]
        method: String,
        /// Identity token (metadata value or peer IP, depending on the identity source)
        #[arg(long, default_value = "anonymous")]
        identity: String,
        /// Payload field as name=value, repeatable
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        /// Number of calls to send
        #[arg(long, default_value_t = 10)]
        calls: u32,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config, "Starting rategate");

    let config = GateConfig::load(&cli.config)?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            method,
            identity,
            fields,
            calls,
            interval_ms,
        } => simulate(&config, &method, &identity, fields, calls, interval_ms).await,
    }
}

fn validate(config: &GateConfig) -> anyhow::Result<()> {
    println!("namespace: {}", config.namespace);
    println!("evaluation: {:?}", config.evaluation);
    println!("store: {:?}", config.store.backend);

    println!("global rules:");
    for rule in config.global_rules()? {
        println!("  {rule}");
    }

    let methods = config.method_rules()?;
    let mut names: Vec<&String> = methods.keys().collect();
    names.sort();
    for name in names {
        println!("{name}:");
        for rule in &methods[name] {
            println!("  {rule}");
        }
    }

    println!("configuration is valid");
    Ok(())
}

async fn simulate(
    config: &GateConfig,
    method: &str,
    identity: &str,
    fields: Vec<(String, String)>,
    calls: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let gate = CallGate::from_config(config).await?;

    let mut metadata = MetadataMap::new();
    if let (IdentitySource::Metadata, Some(header)) =
        (config.identity.source, config.identity.header.as_deref())
    {
        let key = AsciiMetadataKey::from_bytes(header.to_ascii_lowercase().as_bytes())?;
        metadata.insert(key, MetadataValue::try_from(identity)?);
    }

    let mut call = CallContext::new(method, &metadata);
    if config.identity.source == IdentitySource::Peer {
        call = call.with_remote_addr(std::net::SocketAddr::new(identity.parse()?, 0));
    }

    let payload: Map<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let mut admitted = 0;
    for n in 1..=calls {
        match gate.admit(&call, &payload).await {
            Ok(Admission::Proceed) => {
                admitted += 1;
                println!("call {n}: proceed");
            }
            Ok(rejected) => println!("call {n}: rejected ({})", rejected.rule_names().join(", ")),
            Err(e) => println!("call {n}: failed ({})", internal_status(&e).message()),
        }

        if interval_ms > 0 && n < calls {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    println!("{admitted}/{calls} calls admitted");
    Ok(())
}
