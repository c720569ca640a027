//! Gateway server implementation

pub mod auth;
pub mod env;
pub mod params;
pub mod proxy;
mod router;
pub mod security;
mod server;

pub use auth::{CallerAuth, auth_middleware};
pub use proxy::{HttpToolCall, ToolCallBody, ToolProxy};
pub use router::{AppState, create_router};
pub use server::Gateway;
