// Backend access: the transport contract, object references and the HTTP bridge transport.

pub mod http_bridge;
pub mod location;
pub mod traits;
