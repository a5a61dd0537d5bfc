//! The wide-column event store (§6) and the Spooler (§4.G) that shields it
//! from transient outages.

mod spooler;
mod store;

pub use spooler::Spooler;
pub use store::{DynamoEventStore, EventStore, InMemoryEventStore};
