//! Ports (interfaces) the engine depends on.

pub mod capability_provider;
pub mod ledger;
pub mod metadata_store;
pub mod task_handler;

pub use capability_provider::{
    CapabilityProvider, ChatMessage, ChatRole, GenerationOptions, ProviderError, ProviderResult,
};
pub use ledger::{LedgerError, LedgerGateway, LedgerResult, TaskSubscription};
pub use metadata_store::{ContentId, MetadataError, MetadataResult, MetadataStore, MetadataStoreExt};
pub use task_handler::{handler_fn, ExecutionContext, FnTaskHandler, TaskHandler};
