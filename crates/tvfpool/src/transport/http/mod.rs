//! HTTP transport: routes over `PoolService` and the server loop.

mod routes;
mod server;

pub use routes::{ContinueSessionRequest, CreateSessionRequest, ResizeRequest, routes};
pub use server::{ServerConfig, ShutdownReason, serve};
