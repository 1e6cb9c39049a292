//! Client-side cache store for REST collection resources.
//!
//! [`cache::ResourceStore`] keeps items fetched from one collection endpoint
//! in an id-keyed map referenced by named cache slots, coalesces identical
//! in-flight requests and keeps slots consistent as items are created, updated
//! and deleted. [`rest::HttpTransport`] is the bundled HTTP transport.

pub mod cache;
pub mod config;
pub mod logging;
pub mod rest;
