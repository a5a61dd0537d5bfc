//! The coordination store abstraction (§9 Design Notes): `QueueStore`.
//!
//! The source calls Redis-compatible primitives directly; this crate defines
//! the interface and two backends — an in-memory one for tests, a
//! Valkey/Redis-protocol one for production.

mod memory;
mod redis_store;
mod store;

pub use memory::InMemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::{QueueStore, QueueTier};
