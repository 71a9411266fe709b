//! Deterministic stub provider for tests and dry runs.
//!
//! Plays back a script of canned results in order; when the script runs
//! out, the last entry repeats. Records every prompt it was given.

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::traits::{Completion, CompletionRequest, ModelProvider, ProviderError, Usage};

type StubResult = Result<Completion, ProviderError>;

pub struct StubProvider {
    script: Mutex<Vec<StubResult>>,
    cursor: Mutex<usize>,
    prompts: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn new(script: Vec<StubResult>) -> Self {
        Self {
            script: Mutex::new(script),
            cursor: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A stub that always answers with a bare DONE declaration.
    pub fn completing_done() -> Self {
        Self::new(vec![Ok(Self::completion(
            r#"{"call_id":"c1","tool":"set_status","args":{"to":"DONE"}}"#,
        ))])
    }

    pub fn completion(text: &str) -> Completion {
        Completion {
            text: text.to_owned(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
            },
        }
    }

    /// Prompts observed so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        *self.cursor.lock()
    }
}

#[async_trait::async_trait]
impl ModelProvider for StubProvider {
    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.prompts.lock().push(req.prompt.clone());

        let script = self.script.lock();
        let mut cursor = self.cursor.lock();
        let index = (*cursor).min(script.len().saturating_sub(1));
        *cursor += 1;
        script
            .get(index)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Unreachable("empty stub script".into())))
    }

    async fn health(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn provider_id(&self) -> &str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_plays_in_order_then_repeats() {
        let stub = StubProvider::new(vec![
            Err(ProviderError::Unreachable("refused".into())),
            Ok(StubProvider::completion("ok")),
        ]);
        let cancel = CancelToken::new();
        let req = CompletionRequest {
            prompt: "p".into(),
            ..Default::default()
        };

        assert!(stub.complete(&req, &cancel).await.is_err());
        assert_eq!(stub.complete(&req, &cancel).await.unwrap().text, "ok");
        // Past the end: last entry repeats.
        assert_eq!(stub.complete(&req, &cancel).await.unwrap().text, "ok");
        assert_eq!(stub.call_count(), 3);
        assert_eq!(stub.prompts().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_call() {
        let stub = StubProvider::completing_done();
        let cancel = CancelToken::new();
        cancel.cancel();
        let req = CompletionRequest::default();
        assert!(matches!(
            stub.complete(&req, &cancel).await,
            Err(ProviderError::Cancelled)
        ));
    }
}
