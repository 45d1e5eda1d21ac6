use clap::{Parser, Subcommand};
use log::info;
use portico::config::{Config, ConfigError};
use portico::Proxy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "A protocol-aware transparent proxy for Valkey/Redis Cluster")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/portico.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_proxy(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);

    info!("starting portico v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration loaded from {:?}", config_path);
    info!("startup nodes: {:?}", config.cluster.startup_nodes);
    info!("listening on {}", config.server.listen_addr);

    let proxy = Proxy::new(config);
    if let Err(e) = proxy.run().await {
        return Err(format!("failed to run portico: {}", e).into());
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your cluster and run:");
    println!("  portico run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max connections: {}", config.server.max_connections);
            println!("  Read preference: {}", config.cluster.read_preference);
            println!(
                "  Startup nodes: {} instances",
                config.cluster.startup_nodes.len()
            );
            for (i, node) in config.cluster.startup_nodes.iter().enumerate() {
                println!("    {}: {}", i + 1, node);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("portico v{}", env!("CARGO_PKG_VERSION"));
    println!("A protocol-aware transparent proxy for Valkey/Redis Cluster");
    println!();
    println!("Features:");
    println!("  • Slot-based routing with CRC16 hash tags");
    println!("  • Transparent MOVED/ASK redirection handling");
    println!("  • Multi-key scatter and fan-out command coalescing");
    println!("  • Pipelining with strict per-client response ordering");
    println!("  • Replica read preferences with liveness filtering");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("logging initialized at level: {:?}", log_level);
}
