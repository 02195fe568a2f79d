mod cli;

use clap::Parser;
use tracing::{debug, error};
use tunnel_core::logging;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Load before logging so the file's log level applies; errors are reported below
    let config = cli.load_config();
    let _guard = logging::init_logging(cli.log_options(config.as_ref().ok()));

    debug!("Starting flow tunnel CLI");

    if let Err(err) = cli::run(cli, config).await {
        error!("CLI error: {}", err);
        std::process::exit(1);
    }
}
