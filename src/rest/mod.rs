//! HTTP transport for the resource cache.

mod client;
pub mod endpoint;
mod registry;

pub use client::{HttpTransport, HttpTransportBuilder};
pub use registry::{HttpStore, ResourceRegistry};
