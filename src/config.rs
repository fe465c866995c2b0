//! Stack and interface configuration

use serde::{Deserialize, Serialize};

use crate::error::TapError;

const DEFAULT_FRAME_QUEUE_DEPTH: usize = 256;
const DEFAULT_DELIVERY_QUEUE_DEPTH: usize = 1024;

/// Buffer bounds for a [`TapStack`](crate::TapStack)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Frames each reader may hold before new frames are dropped
    pub frame_queue_depth: usize,
    /// Frames waiting for their deferred hand-off to an interface
    pub delivery_queue_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            delivery_queue_depth: DEFAULT_DELIVERY_QUEUE_DEPTH,
        }
    }
}

impl StackConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, TapError> {
        Ok(toml::from_str(input)?)
    }

    pub(crate) fn frame_queue_depth(&self) -> usize {
        self.frame_queue_depth.max(1)
    }

    pub(crate) fn delivery_queue_depth(&self) -> usize {
        self.delivery_queue_depth.max(1)
    }
}

/// Options for [`TapStack::create`](crate::TapStack::create)
///
/// A missing `mac` is generated; a missing `ip` (CIDR notation) leaves the
/// interface without an IPv4 address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceOptions {
    pub mac: Option<String>,
    pub ip: Option<String>,
}

impl InterfaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn ip(mut self, cidr: impl Into<String>) -> Self {
        self.ip = Some(cidr.into());
        self
    }
}
