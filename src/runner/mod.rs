//! Function runner
//!
//! A small HTTP server that executes user code packages. `--init` unpacks
//! the package into a read-only work dir; afterwards every authenticated
//! call forks the language entrypoint, which answers over a named pipe.

pub mod auth;
pub mod bootstrap;
pub mod idle;
pub mod ipc;
pub mod server;
pub mod service;
pub mod sys;

pub use auth::{AuthContext, auth_middleware};
pub use bootstrap::{BootstrapConfig, BootstrapError, Language, Program, initialize};
pub use server::{RunnerOptions, router, run};
pub use service::{CallRequest, DEFAULT_CALL_TIMEOUT, FunctionService};
