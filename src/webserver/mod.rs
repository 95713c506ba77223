/// WebSocket transport for the broker
///
/// - `server`: axum listener lifecycle and graceful shutdown
/// - `routes`: `/ws/<topic>` upgrade endpoint and JSON status routes
/// - `connection`: one task per socket, bridging it to the dispatch loop
/// - `state`: shared state handed to every route handler
mod server;

pub mod connection;
pub mod routes;
pub mod state;

// Public API for starting/stopping the webserver
pub use server::{serve, shutdown, start_server};
pub use state::AppState;
