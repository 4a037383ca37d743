// HTTP streaming gateway for files held in a sharded, session-authenticated chat backend.

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod handle;
pub mod server;
pub mod source;
pub mod store;

pub use config::GatewayConfig;
pub use error::{BackendError, GatewayError, GatewayResult, StoreError};
pub use server::{GatewayServer, StreamingGateway};
