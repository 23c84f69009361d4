//! Real-time transport: wire protocol, socket handling, connection registry

pub mod handler;
pub mod protocol;
pub mod registry;

pub use registry::ConnectionRegistry;
