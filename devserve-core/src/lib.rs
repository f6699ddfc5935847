//! Core types and algorithms for devserve: configuration, the server
//! registry, deterministic port allocation, template resolution, drift
//! detection, CI detection and name generation.

pub mod ci;
pub mod config;
pub mod drift;
pub mod error;
pub mod names;
pub mod ports;
pub mod registry;
pub mod template;

pub use config::{GlobalConfig, LoadOptions, PortRange, Protocol, RefreshPolicy};
pub use drift::{ConfigKey, ConfigSnapshot, DriftResult, DriftedValue};
pub use error::{Error, Result};
pub use ports::{CiPortLease, PortAllocator, PortAssignment};
pub use registry::{ListFilter, Registry, ServerEntry, ServerPatch};
pub use template::TemplateVars;
