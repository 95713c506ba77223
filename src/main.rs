use statebroker::{
    arguments::{is_help_requested, print_help},
    logger::{self, LogTag},
};

/// Main entry point for statebroker
///
/// Starts the broker with the configured demo topics and the WebSocket
/// transport, then runs until SIGINT or SIGTERM.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    // Check for help request first (before any other processing)
    if is_help_requested() {
        print_help();
        return Ok(());
    }

    logger::info(
        LogTag::System,
        &format!("statebroker v{} starting up...", env!("CARGO_PKG_VERSION")),
    );

    if let Err(e) = statebroker::run::run_broker().await {
        logger::error(LogTag::System, &format!("Broker failed: {:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
