use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshkit::{Agent, Component, Tool, local_registry};
use meshkit_backend::{BackendConnector, RedisConnector};
use meshkit_bootstrap::{CliOverrides, DiscoveryProvider, MeshConfig, init_logging, shutdown_token};
use meshkit_registry::{ComponentType, Discovery, DiscoveryFilter, catalog};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

/// Meshkit node - runs one tool or agent and inspects the registry
#[derive(Parser)]
#[command(name = "meshkit-node")]
#[command(version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the advertised HTTP endpoint (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use the in-process registry instead of Redis
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the configured component and run until a shutdown signal
    Run,
    /// Validate configuration and exit
    Check,
    /// Query the registry and print matching records as JSON
    Discover(DiscoverArgs),
}

#[derive(Args)]
struct DiscoverArgs {
    /// Component type (tool or agent)
    #[arg(long = "type")]
    component_type: Option<ComponentType>,

    /// Exact service name
    #[arg(long)]
    name: Option<String>,

    /// Required capability; repeat to require several
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Metadata predicate as key=value; the value is parsed as JSON when possible
    #[arg(long = "metadata", value_parser = parse_metadata)]
    metadata: Vec<(String, Value)>,

    /// Print the capability catalog instead of raw records
    #[arg(long)]
    catalog: bool,
}

impl DiscoverArgs {
    fn filter(&self) -> DiscoveryFilter {
        let mut filter = DiscoveryFilter::new().with_capabilities(self.capabilities.iter().cloned());
        if let Some(component_type) = self.component_type {
            filter = filter.by_type(component_type);
        }
        if let Some(name) = &self.name {
            filter = filter.by_name(name.clone());
        }
        for (key, value) in &self.metadata {
            filter = filter.with_metadata(key.clone(), value.clone());
        }
        filter
    }
}

fn parse_metadata(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty metadata key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.trim().to_owned(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // defaults -> YAML -> env (MESHKIT__*) -> CLI overrides
    let mut config = MeshConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        verbose: cli.verbose,
        port: cli.port,
        mock: cli.mock,
    });
    config.validate()?;

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let span = init_logging(
        &config.logging,
        config.component.component_type,
        &config.component.name,
    )?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_component(config).instrument(span).await,
        Commands::Check => check_config(&config),
        Commands::Discover(args) => discover(&config, &args).instrument(span).await,
    }
}

fn check_config(config: &MeshConfig) -> Result<()> {
    tracing::info!("configuration is valid");
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

async fn run_component(config: MeshConfig) -> Result<()> {
    let name = config.component.name.clone();
    let mut component: Box<dyn Component> = match config.component.component_type {
        ComponentType::Tool => Box::new(Tool::new(name)),
        ComponentType::Agent => Box::new(Agent::new(name)),
    };
    component.configure(&config)?;

    let cancel = shutdown_token();
    component.start(cancel.clone()).await?;
    tracing::info!(
        state = ?component.state(),
        health_url = %component.health_url(),
        "component running, waiting for shutdown signal"
    );

    cancel.cancelled().await;
    component.shutdown().await?;
    Ok(())
}

async fn discover(config: &MeshConfig, args: &DiscoverArgs) -> Result<()> {
    let connector: Box<dyn BackendConnector> = match config.discovery.provider {
        DiscoveryProvider::Mock => Box::new(local_registry(&config.backend.namespace)),
        DiscoveryProvider::Redis => Box::new(RedisConnector::new(config.backend.clone())),
    };
    let backend = connector
        .connect()
        .await
        .context("failed to connect to the registry")?;

    let found = Discovery::new(Arc::clone(&backend))
        .discover(&args.filter())
        .await;
    backend.close().await;
    let records = found?;
    tracing::debug!(count = records.len(), "discovery finished");

    if args.catalog {
        print!("{}", catalog(&records).to_prompt());
    } else {
        println!("{}", serde_json::to_string_pretty(&records)?);
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn metadata_values_parse_as_json_when_possible() {
        assert_eq!(
            parse_metadata("replicas=3").unwrap(),
            ("replicas".to_owned(), Value::from(3))
        );
        assert_eq!(
            parse_metadata("region=eu-west").unwrap(),
            ("region".to_owned(), Value::from("eu-west"))
        );
        assert!(parse_metadata("novalue").is_err());
        assert!(parse_metadata("=x").is_err());
    }

    #[test]
    fn discover_args_build_filter() {
        let cli = Cli::parse_from([
            "meshkit-node",
            "discover",
            "--type",
            "tool",
            "--capability",
            "forecast",
            "--capability",
            "forecast",
            "--metadata",
            "region=eu",
        ]);
        let Some(Commands::Discover(args)) = cli.command else {
            panic!("expected discover");
        };
        let filter = args.filter();
        assert_eq!(filter.component_type, Some(ComponentType::Tool));
        assert_eq!(filter.capabilities, vec!["forecast".to_owned()]);
        assert_eq!(filter.metadata["region"], "eu");
    }
}
