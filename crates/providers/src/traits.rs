//! The provider contract and its request/response types.

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Stop sequences. Empty = provider default.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A completed model response.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed provider failures. `Unreachable` and `Timeout` are transient
/// (retried per policy); `Rejected` fails fast.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider timeout: {0}")]
    Timeout(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_) | ProviderError::Timeout(_))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every model adapter implements.
///
/// `complete` must honour the cancellation token promptly: an in-flight
/// call aborts with [`ProviderError::Cancelled`] once the token fires.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError>;

    /// Cheap liveness probe.
    async fn health(&self) -> Result<(), ProviderError>;

    /// Stable identifier for audit events.
    fn provider_id(&self) -> &str;
}
