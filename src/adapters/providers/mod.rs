//! Capability provider implementations.

pub mod mock;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

pub use mock::MockProvider;
pub use openai::{OpenAiConfig, OpenAiProvider};

use crate::domain::models::ProviderConfig;
use crate::domain::ports::{CapabilityProvider, ProviderResult};

/// Build a provider from its configuration entry.
pub fn build_provider(
    name: &str,
    config: &ProviderConfig,
) -> ProviderResult<Arc<dyn CapabilityProvider>> {
    match config {
        ProviderConfig::Mock { canned_response } => {
            let provider = match canned_response {
                Some(text) => MockProvider::new(name).with_canned_response(text.clone()),
                None => MockProvider::new(name),
            };
            Ok(Arc::new(provider))
        }
        ProviderConfig::Openai {
            base_url,
            model,
            embedding_model,
            api_key,
            timeout_secs,
        } => {
            let config = OpenAiConfig {
                name: name.to_string(),
                api_key: api_key.clone(),
                base_url: base_url.clone(),
                model: model.clone(),
                embedding_model: embedding_model.clone(),
                timeout_secs: *timeout_secs,
            };
            Ok(Arc::new(OpenAiProvider::new(config)?))
        }
    }
}

/// Build every configured provider, keyed by name.
pub fn build_providers(
    configs: &HashMap<String, ProviderConfig>,
) -> ProviderResult<HashMap<String, Arc<dyn CapabilityProvider>>> {
    configs
        .iter()
        .map(|(name, config)| Ok((name.clone(), build_provider(name, config)?)))
        .collect()
}
