//! Model providers — registry, the uniform client contract, and the two
//! wire dialects.

pub mod anthropic;
pub mod openai_compat;
pub mod registry;
pub mod sse;
pub mod traits;

pub use registry::{Dialect, ProviderConfig, ProviderRegistry};
pub use traits::{
    api_error, Cancelled, ChatObserver, ChatOutcome, FinishReason, ModelClient, NullObserver,
};

use anthropic::AnthropicClient;
use openai_compat::OpenAiCompatClient;

use std::sync::Arc;

/// Factory: build the right client for a provider config and model.
///
/// `base_url_override` lets an agent config point the same provider at a
/// different endpoint (e.g. a local proxy).
pub fn create_client(
    config: &ProviderConfig,
    model: &str,
    base_url_override: Option<&str>,
) -> Arc<dyn ModelClient> {
    let base_url = base_url_override.unwrap_or(&config.base_url);
    match config.dialect {
        Dialect::OpenAi => Arc::new(OpenAiCompatClient::new(
            &config.name,
            base_url,
            Some(&config.credential),
            model,
        )),
        Dialect::Anthropic => Arc::new(AnthropicClient::new(
            base_url,
            Some(&config.credential),
            model,
        )),
    }
}

/// Client construction as a seam: the gateway asks the factory, never the
/// wire clients directly, so a double can stand in for the network.
pub trait ClientFactory: Send + Sync {
    fn client_for(
        &self,
        provider: &ProviderConfig,
        model: &str,
        base_url_override: Option<&str>,
    ) -> Arc<dyn ModelClient>;
}

/// The production factory: real HTTP clients per dialect.
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn client_for(
        &self,
        provider: &ProviderConfig,
        model: &str,
        base_url_override: Option<&str>,
    ) -> Arc<dyn ModelClient> {
        create_client(provider, model, base_url_override)
    }
}
