//! Local model runner over HTTP.
//!
//! Speaks a minimal completions wire format:
//! `POST {endpoint}/v1/completions` with the serialized request, expects
//! `{"text": ..., "usage": {"prompt_tokens": n, "completion_tokens": n}}`.
//! A semaphore caps in-flight calls (default 1 for single-GPU runners).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::traits::{Completion, CompletionRequest, ModelProvider, ProviderError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct LocalProvider {
    client: reqwest::Client,
    endpoint: String,
    permits: Arc<Semaphore>,
    id: String,
}

impl LocalProvider {
    pub fn new(endpoint: &str, concurrency: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            id: format!("local:{endpoint}"),
        }
    }

    fn classify(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() {
            ProviderError::Unreachable(e.to_string())
        } else {
            ProviderError::Unreachable(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for LocalProvider {
    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError> {
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ProviderError::Unreachable("provider shut down".into()))?
            }
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let url = format!("{}/v1/completions", self.endpoint);
        let send = self.client.post(&url).json(req).send();

        let response = tokio::select! {
            res = send => res.map_err(Self::classify)?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unreachable(format!("{status}: {message}")));
        }

        let completion = tokio::select! {
            body = response.json::<Completion>() => body.map_err(Self::classify)?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        tracing::debug!(
            provider = %self.id,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "completion received"
        );
        Ok(completion)
    }

    async fn health(&self) -> Result<(), ProviderError> {
        let url = format!("{}/health", self.endpoint);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(Self::classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Unreachable(format!(
                "health returned {}",
                response.status()
            )))
        }
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
