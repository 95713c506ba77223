/// Configuration system
///
/// - `macros`: the `config_struct!` definition macro
/// - `schemas`: every config struct with its defaults
/// - `utils`: loading from TOML and global accessors
pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::{BrokerConfig, Config, DemoConfig, WebserverConfig};
pub use utils::{get_config_clone, load_config_from_path, read_config_file, with_config};
