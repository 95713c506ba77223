pub mod arguments;
pub mod broker;
pub mod config;
pub mod demo;
pub mod errors; // Structured error handling
pub mod logger;
pub mod run;

#[cfg(feature = "web")]
pub mod webserver;
