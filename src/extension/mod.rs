//! Extensions built on the engine's packet and task contract.
//!
//! - **Endpoint**: request/response calls routed through the broker
//! - **Registry**: shared single-value registers with change notification

pub mod endpoint;
pub mod registry;

pub use endpoint::{EndpointExtension, EndpointType, Invocation};
pub use registry::{Registry, RegistryExtension, RegistryType};
