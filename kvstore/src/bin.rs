use clap::Parser;
use kvstore_admin::{init_logging, Cli};

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = kvstore::run(cli).await {
        tracing::error!(target: "kvstore", "fatal: {e}");
        std::process::exit(1);
    }
}
