//! ChannelLog — the per-request scratchpad that captures HTTP traces and
//! structured errors for every user-visible operation, with redaction of
//! secret material on finalization.

mod backend;
mod channel_log;

pub use backend::{LogBackend, NullLogBackend, TracingLogBackend};
pub use channel_log::{codes, ChannelLog, ChannelLogType, FinalizedChannelLog};
