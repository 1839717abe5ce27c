//! Backend module - Service descriptors, HTTP transport, and registry

pub mod http_backend;
pub mod registry;
pub mod traits;
