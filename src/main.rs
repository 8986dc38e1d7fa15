//! exportd: resumable background exports
//!
//! # Usage
//!
//! ```bash
//! # Run the service against MongoDB
//! exportd serve --uri mongodb://localhost:27017
//!
//! # Export from a records file in-process and follow progress
//! exportd --backend memory --records tasks.json export -f json --watch -o out.json
//! ```

use tracing_subscriber::EnvFilter;

use exportd::cli::CliInterface;
use exportd::error::Result;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = CliInterface::new()?;
    initialize_logging(&cli);
    cli.run().await
}

/// Initialize logging from `RUST_LOG`, falling back to the configured level
fn initialize_logging(cli: &CliInterface) {
    let level = cli.config().logging.level.to_tracing_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
