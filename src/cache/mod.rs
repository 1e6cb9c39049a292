//! Client-side cache for REST collection resources.
//!
//! This module provides a transport-agnostic store that:
//! - Keeps one id-keyed item map shared by any number of named cache slots
//! - Reuses a slot only while it was fetched with identical parameters
//! - Coalesces identical in-flight loads and finds onto one network call
//! - Tracks pagination per slot and keeps slots consistent on create/delete
//! - Evicts items no slot references after every load

mod error;
mod key;
mod layer;
mod resolvers;
mod storage;
#[cfg(test)]
mod testing;
mod traits;

pub use error::UpstreamError;
pub use key::{render_value, serialize_params, FetchKey, FetchKind, Params};
pub use layer::{Query, ResourceStore, ALL, CURRENT};
pub use resolvers::FieldResolvers;
pub use storage::{merge_record, CacheSlot, StoreSnapshot};
pub use traits::{Flag, ItemId, Pagination, Resolvers, StoreEvent, Transport};
