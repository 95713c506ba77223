/// Centralized argument handling for the state broker
///
/// Features:
/// - Centralized CMD_ARGS storage with thread-safe access
/// - Debug flag checking functions per module
/// - Value lookup for `--flag value` style options
use once_cell::sync::Lazy;
use std::env;
use std::sync::Mutex;

/// Global command-line arguments storage
/// Thread-safe singleton that stores arguments for access throughout the application
pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Sets the global command-line arguments
/// Used by tests to override the default env::args() collection
pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Gets a copy of the current command-line arguments
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => {
            // Fallback to env::args if mutex is poisoned
            env::args().collect()
        }
    }
}

/// Checks if a specific argument is present in the command line
pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Gets the value of a command-line argument that follows a flag
/// Returns None if the flag is not found or has no value
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

// =============================================================================
// DEBUG FLAG CHECKING FUNCTIONS
// =============================================================================

/// Broker dispatch debug mode
pub fn is_debug_broker_enabled() -> bool {
    has_arg("--debug-broker") || has_arg("--debug-all")
}

/// Liveness (ping/pong/RTT) debug mode
pub fn is_debug_liveness_enabled() -> bool {
    has_arg("--debug-liveness") || has_arg("--debug-all")
}

/// Socket transport debug mode
pub fn is_debug_transport_enabled() -> bool {
    has_arg("--debug-transport") || has_arg("--debug-all")
}

// =============================================================================
// OPTIONS
// =============================================================================

/// Config file path override (--config <path>)
pub fn config_path_override() -> Option<String> {
    get_arg_value("--config")
}

/// Bind port override (--port <port>)
pub fn port_override() -> Option<u16> {
    get_arg_value("--port").and_then(|p| p.parse().ok())
}

pub fn is_help_requested() -> bool {
    has_arg("--help") || has_arg("-h")
}

/// Print usage information
pub fn print_help() {
    println!("statebroker - real-time multiplexed state synchronization broker");
    println!();
    println!("USAGE:");
    println!("    statebroker [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <path>       TOML config file (default: data/config.toml)");
    println!("    --port <port>         Override webserver port");
    println!("    --debug-<module>      Debug logs for broker|liveness|transport|topics|webserver|demo");
    println!("    --debug-all           Debug logs for every module");
    println!("    --log-level <level>   error|warning|info|verbose");
    println!("    --log-tags <a,b>      Only show these tags (errors always shown)");
    println!("    --verbose             Verbose output");
    println!("    --quiet               Warnings and errors only");
    println!("    -h, --help            Show this help");
}
