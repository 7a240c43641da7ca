use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use compuerta::config::{Config, ConfigError};
use compuerta::shard::ShardRouter;
use compuerta::utils::format_bytes;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "compuerta")]
#[command(about = "Routing and resiliency middleware for relational databases")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Compuerta Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration files
    Config {
        /// Configuration mode (replicated or sharded)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show how generated keys spread over the configured shards
    Distribution {
        /// Path to configuration file with a shard section
        #[arg(short, long)]
        config: PathBuf,
        /// Number of keys to route
        #[arg(short, long, default_value_t = 10_000)]
        keys: usize,
        /// Key prefix
        #[arg(long, default_value = "key")]
        prefix: String,
    },
    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { mode, output } => {
            generate_config(mode, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Distribution {
            config,
            keys,
            prefix,
        } => {
            show_distribution(config, keys, &prefix)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  compuerta validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            if let Some(primary) = &config.pool.primary {
                println!("  Primary: {} ({:?})", primary.endpoint(), primary.dialect);
            }
            println!("  Replicas: {} instances", config.pool.replicas.len());
            for (i, replica) in config.pool.replicas.iter().enumerate() {
                println!(
                    "    {}: {} {} weight={}",
                    i + 1,
                    replica.name,
                    replica.database.endpoint(),
                    replica.weight
                );
            }
            println!("  Backups: {} instances", config.pool.backups.len());
            println!("  Replica strategy: {:?}", config.replica.strategy);
            if let Some(shard) = &config.shard {
                println!(
                    "  Shards: {} ({:?}, {:?})",
                    shard.shards.len(),
                    shard.strategy,
                    shard.hash_function
                );
            }
            if config.cache.enabled {
                println!(
                    "  Cache: enabled, {} budget",
                    format_bytes(config.cache.max_size_bytes as u64)
                );
            } else {
                println!("  Cache: disabled");
            }

            init_logging(&config)?;
            info!(path = ?config_path, "configuration validated");
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_distribution(
    config_path: PathBuf,
    keys: usize,
    prefix: &str,
) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    let shard = config
        .shard
        .as_ref()
        .context("configuration has no shard section")?;

    let mut router = ShardRouter::new(shard.strategy, shard.hash_function, shard.virtual_nodes);
    for entry in &shard.shards {
        router.add_shard(entry.id, &entry.name)?;
    }
    for range in &shard.ranges {
        router.add_range(&range.min, &range.max, range.shard_id)?;
    }
    for lookup in &shard.lookups {
        router.add_lookup(&lookup.key, lookup.shard_id)?;
    }

    let counts = router.distribution((0..keys).map(|i| format!("{prefix}-{i}")));
    let routed: usize = counts.values().sum();
    println!(
        "Routed {} of {} keys with {:?} ({:?})",
        routed, keys, shard.strategy, shard.hash_function
    );
    for entry in &shard.shards {
        let count = counts.get(&entry.id).copied().unwrap_or(0);
        let share = if keys == 0 {
            0.0
        } else {
            count as f64 * 100.0 / keys as f64
        };
        println!("  {:>4} {:<16} {:>8} {:>6.2}%", entry.id, entry.name, count, share);
    }

    Ok(())
}

fn show_version() {
    println!("compuerta v{}", env!("CARGO_PKG_VERSION"));
    println!("Routing and resiliency middleware for relational databases");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Primary/replica/backup pooling with health checks");
    println!("  • Lag-aware replica load balancing with failover and recovery");
    println!("  • Hash, consistent-hash, range and lookup sharding");
    println!("  • Query result caching with table invalidation");
    println!("  • Managed transactions with savepoints and retry");
}

/// `RUST_LOG` overrides the configured level
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
