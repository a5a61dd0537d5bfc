//! The relational store client: connection pool, `ChannelResolver` (§4.B),
//! `StatusEngine` (§4.E).

mod pool;
mod resolver;
mod status_engine;

pub use pool::{CourierDbPool, PoolConfig};
pub use resolver::ChannelResolver;
pub use status_engine::{compute_status_change, ExistingMsgRow, StatusEngine, StatusEngineConfig};
