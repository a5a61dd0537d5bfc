//! Courier Core - shared domain types and service infrastructure
//!
//! This crate provides:
//! - The uniform contracts (Channel, MsgIn, MsgOut, StatusUpdate, Handler, ...)
//!   that bind the routing, status, dispatch and logging subsystems together
//! - The handler-facing error taxonomy
//! - Crate-boundary error handling for infrastructure calls
//! - Configuration management
//! - The standard service trait all binaries implement

pub mod config;
pub mod contracts;
pub mod error;
pub mod service;

pub use config::CourierConfig;
pub use contracts::*;
pub use error::{CourierError, Result};
pub use service::{CourierService, DependencyStatus, HealthStatus, MicroserviceRuntime, ReadinessStatus};
