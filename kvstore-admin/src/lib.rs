// Process bootstrap: flag parsing, config-file loading, logging setup.
// Mirrors `main.go`'s `parseFlags`/`config.ParseFile` split, but pushed
// through `clap` derive and `serde`/`toml` instead of hand-rolled flag
// checks and a bespoke decoder.

use std::fs;
use std::path::Path;

use clap::Parser;

use kvstore_base::{err, Result};
use kvstore_topology::ShardingConfig;

/// Command-line flags for a single node. `--db-location` and `--shard` are
/// required; the rest have defaults matching the original deployment.
#[derive(Debug, Parser)]
#[command(name = "kvstore", about = "Sharded, replicated key-value store node")]
pub struct Cli {
    /// Path for the embedded storage engine's data.
    #[arg(long = "db-location")]
    pub db_location: String,

    /// Listen address for the node-to-node RPC surface.
    #[arg(long = "http-addr", default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Path to the sharding config file.
    #[arg(long = "config-file", default_value = "sharding.toml")]
    pub config_file: String,

    /// The name of the shard this process runs as.
    #[arg(long)]
    pub shard: String,

    /// Path to the consensus module's environment file.
    #[arg(long)]
    pub env: String,
}

/// Loads and validates the sharding config from `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<ShardingConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| err(format!("reading config file {}: {e}", path.display())))?;
    ShardingConfig::from_toml_str(&text)
}

/// Installs the `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` filter; call once, at process start.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
