mod listen;
mod requests_logging;
mod routes;
mod server;
mod state;

pub use requests_logging::RequestsLoggingLevel;
pub use server::{make_app, run_server, serve};
pub use state::{ServerConfig, ServerState};
