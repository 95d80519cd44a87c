use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use warden::config::WardenConfig;
use warden::limits::LimitsManifest;
use warden::ExecutionContext;

/// Warden: hierarchical token-bucket limits for sandboxed execution
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Inspect and validate execution limits", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the registered limits
    Limits {
        /// Print the limits as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a limits manifest and show the resulting limits
    Check {
        /// Path to the manifest
        manifest: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = WardenConfig::load(args.config.as_deref())
        .with_context(|| "Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;
    debug!(?config, "Configuration loaded");

    let registry = config.registry();

    match args.command {
        Commands::Limits { json } => {
            let mut limits = Vec::new();
            registry.for_each_registered_limit(|name, info| {
                limits.push((name.to_string(), info));
                Ok::<_, anyhow::Error>(())
            })?;

            if json {
                let entries: Vec<_> = limits
                    .iter()
                    .map(|(name, info)| json!({ "name": name, "kind": info.kind, "minimum": info.minimum }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for (name, info) in &limits {
                    println!("{:<40} {:<10} min={}", name, info.kind, info.minimum);
                }
            }
        }
        Commands::Check { manifest } => {
            let manifest = LimitsManifest::from_file(&manifest)
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
            let limits = manifest.to_limits(&registry)?;

            // Building a context checks the limits can be instantiated together.
            let ctx = ExecutionContext::new(&registry, config.context_config(limits))?;
            info!(context = %ctx.id(), limits = manifest.len(), "Manifest is valid");

            for limit in ctx.limits() {
                println!("{}", limit);
            }
        }
    }

    Ok(())
}

fn init_tracing(config: &WardenConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config
            .log
            .level
            .parse::<Level>()
            .with_context(|| format!("Invalid log level '{}'", config.log.level))?
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}
