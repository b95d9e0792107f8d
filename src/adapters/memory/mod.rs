//! In-memory reference adapters.

pub mod ledger;
pub mod metadata_store;

pub use ledger::InMemoryLedger;
pub use metadata_store::InMemoryMetadataStore;
