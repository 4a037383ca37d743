// Streaming core: descriptor caching, shard sessions, range planning, chunk streaming, quota.

pub mod cache;
pub mod governor;
pub mod planner;
pub mod session;
pub mod streamer;
