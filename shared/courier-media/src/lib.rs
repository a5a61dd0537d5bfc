//! MediaCache — two-tier cache mapping `(channel, source-media-URL) ->
//! provider-media-id` so media uploads to providers are deduplicated.

mod cache;
mod tier1;

pub use cache::{MediaCache, MediaUploader};
pub use tier1::{InMemoryTier1Store, RedisTier1Store, Tier1Store};
