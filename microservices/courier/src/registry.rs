//! HandlerRegistry (§4.C): an explicit, immutable-at-steady-state mapping
//! from channel-type code to handler. Handlers no longer self-register via
//! package initializers; the binary builds the list once at startup and
//! hands it to the registry constructor.

use courier_core::{CourierError, HandlerDescriptor, Result};
use std::collections::HashMap;

pub struct HandlerRegistry {
    by_type: HashMap<&'static str, HandlerDescriptor>,
}

impl HandlerRegistry {
    /// Builds the registry from an explicit list of descriptors. Two
    /// descriptors registering the same channel-type code is a startup error
    /// (§8 invariant 7), not a runtime condition.
    pub fn new(descriptors: Vec<HandlerDescriptor>) -> Result<Self> {
        let mut by_type = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if by_type.contains_key(descriptor.channel_type) {
                return Err(CourierError::Config(format!(
                    "duplicate handler registration for channel type {}",
                    descriptor.channel_type
                )));
            }
            by_type.insert(descriptor.channel_type, descriptor);
        }
        Ok(Self { by_type })
    }

    pub fn get(&self, channel_type: &str) -> Option<&HandlerDescriptor> {
        self.by_type.get(channel_type)
    }

    pub fn channel_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_type.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.by_type.values()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
