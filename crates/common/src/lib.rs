//! Shared building blocks for the storage node: the runtime abstraction,
//! knobs, error reporting, key paths and the contracts of the catalog and
//! storage environment that index maintenance consumes.

pub mod backoff;
pub mod catalog;
pub mod errors;
pub mod key;
pub mod knobs;
pub mod kv_store;
pub mod runtime;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
