//! Adapters: in-memory ledger and metadata store, capability providers and
//! the monitoring HTTP surface.

pub mod http;
pub mod memory;
pub mod providers;
