//! The capability handle tools run against.
//!
//! Tools never see the engine; the executor hands them this narrow
//! surface instead. File writes are sandboxed (re-validated here, on top
//! of the gate's check) and atomic: content lands in a per-turn temp file
//! that is renamed into place.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;

use ork_domain::error::{Error, Result};
use ork_governance::gate::resolve_sandboxed;
use ork_repository::CardStore;

pub struct ToolEffects {
    sandbox_root: PathBuf,
    store: Arc<CardStore>,
}

impl ToolEffects {
    pub fn new(sandbox_root: PathBuf, store: Arc<CardStore>) -> Self {
        Self {
            sandbox_root,
            store,
        }
    }

    pub fn sandbox_root(&self) -> &std::path::Path {
        &self.sandbox_root
    }

    /// Write a file under the sandbox root. The requested path is
    /// re-resolved here so no caller can bypass containment, then written
    /// via temp-and-rename keyed by the turn id (no torn files, and no
    /// two turns share a temp path).
    pub async fn write_file(&self, requested: &str, content: &str, turn_id: &str) -> Result<PathBuf> {
        let resolved = resolve_sandboxed(&self.sandbox_root, requested)
            .map_err(|v| Error::Other(format!("sandbox refused '{requested}': {v}")))?;

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = resolved.with_extension(format!("{turn_id}.tmp"));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &resolved).await?;

        tracing::debug!(path = %resolved.display(), bytes = content.len(), "tool wrote file");
        Ok(resolved)
    }

    /// Read another card's snapshot, serialized for the model.
    pub fn read_card(&self, card_id: &str) -> Result<String> {
        let card = self
            .store
            .get_card(card_id)
            .map_err(|_| Error::CardNotFound(card_id.to_owned()))?;
        Ok(serde_json::to_string(&card)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ork_governance::StateMachine;

    use super::*;

    fn effects(dir: &std::path::Path) -> ToolEffects {
        let store = Arc::new(
            CardStore::open_in_memory(Arc::new(StateMachine::standard())).unwrap(),
        );
        ToolEffects::new(dir.to_path_buf(), store)
    }

    #[tokio::test]
    async fn write_lands_inside_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let fx = effects(dir.path());
        let path = fx
            .write_file("reports/out.md", "hello", "turn-1")
            .await
            .unwrap();
        assert!(path.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        // No temp droppings left behind.
        let count = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn traversal_is_refused_with_no_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let fx = effects(dir.path());
        assert!(fx
            .write_file("../../outside.txt", "x", "turn-1")
            .await
            .is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn read_card_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let fx = effects(dir.path());
        assert!(matches!(
            fx.read_card("missing"),
            Err(Error::CardNotFound(_))
        ));
    }
}
