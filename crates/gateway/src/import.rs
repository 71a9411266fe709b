//! Card import with legacy migration.
//!
//! Reads a JSON array of cards (possibly exported from the legacy
//! system: `rock`/`epic`/`issue` kinds, `High`/`Medium`/`Low` priority
//! labels) and inserts them with kinds and priorities migrated.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;

use ork_domain::card::{Card, CardKind, CardStatus, Priority, WaitReason};
use ork_domain::error::{Error, Result};
use ork_repository::CardStore;

/// A card as it appears in an import file, before migration.
#[derive(Debug, Deserialize)]
struct RawCard {
    id: String,
    kind: String,
    #[serde(default)]
    parent_id: Option<String>,
    title: String,
    #[serde(default = "d_status")]
    status: String,
    role: String,
    #[serde(default = "d_priority")]
    priority: serde_json::Value,
    #[serde(default)]
    depends_on: BTreeSet<String>,
    #[serde(default)]
    wait_reason: Option<String>,
    #[serde(default)]
    requirements_ref: Option<String>,
    #[serde(default)]
    verification_ref: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

fn d_status() -> String {
    "NEW".into()
}
fn d_priority() -> serde_json::Value {
    serde_json::json!(2.0)
}

/// Import a card file into the store. Returns how many cards landed.
///
/// Cards insert first and dependency edges second, so a file may
/// reference cards defined later in the same file.
pub fn import_file(store: &CardStore, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)?;
    let raw_cards: Vec<RawCard> = serde_json::from_str(&raw)?;

    let mut cards = Vec::with_capacity(raw_cards.len());
    for raw in raw_cards {
        let card = migrate(raw)?;
        if !card.wait_reason_consistent() {
            return Err(Error::ConfigInvalid(format!(
                "card '{}': wait_reason must be present iff status is blocked-class",
                card.id
            )));
        }
        cards.push(card);
    }

    for card in &cards {
        let mut bare = card.clone();
        bare.depends_on.clear();
        store
            .insert_card(&bare)
            .map_err(|e| Error::Other(format!("inserting '{}': {e}", card.id)))?;
    }
    for card in &cards {
        for dep in &card.depends_on {
            store
                .add_dependency(&card.id, dep)
                .map_err(|e| Error::Other(format!("dependency '{}' -> '{dep}': {e}", card.id)))?;
        }
    }

    tracing::info!(count = cards.len(), path = %path.display(), "cards imported");
    Ok(cards.len())
}

fn migrate(raw: RawCard) -> Result<Card> {
    let now = Utc::now();
    Ok(Card {
        kind: CardKind::parse(&raw.kind)?,
        status: CardStatus::parse(&raw.status)?,
        priority: Priority::migrate(&raw.priority)?,
        wait_reason: raw
            .wait_reason
            .as_deref()
            .map(WaitReason::parse)
            .transpose()?,
        id: raw.id,
        parent_id: raw.parent_id,
        title: raw.title,
        role: raw.role,
        depends_on: raw.depends_on,
        requirements_ref: raw.requirements_ref,
        verification_ref: raw.verification_ref,
        metadata: raw.metadata,
        created_at: now,
        updated_at: now,
    })
}
