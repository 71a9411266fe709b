//! Model provider layer.
//!
//! A [`ModelProvider`] is the engine's only window onto a model runner.
//! Two variants ship: the local HTTP provider and a deterministic stub
//! for tests. The retry driver wraps either with the configured
//! exponential-backoff schedule.

pub mod cancel;
pub mod local;
pub mod retry;
pub mod stub;
pub mod traits;

pub use cancel::CancelToken;
pub use local::LocalProvider;
pub use retry::{complete_with_retry, RetryPolicy};
pub use stub::StubProvider;
pub use traits::{Completion, CompletionRequest, ModelProvider, ProviderError, Usage};

use std::sync::Arc;

use ork_domain::config::{ProviderConfig, ProviderKind};

/// Construct the configured provider (composition-root helper).
pub fn from_config(config: &ProviderConfig) -> Arc<dyn ModelProvider> {
    match config.kind {
        ProviderKind::Local => Arc::new(LocalProvider::new(
            &config.endpoint,
            config.concurrency,
        )),
        ProviderKind::Stub => Arc::new(StubProvider::completing_done()),
    }
}
