// HTTP surface: stream and download routes, operational endpoints.

pub mod gateway;
pub mod handler;
pub mod range;
pub mod status;

pub use gateway::{Disposition, StreamingGateway};
pub use handler::{router, GatewayServer, SharedGateway};
