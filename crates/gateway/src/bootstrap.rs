//! The composition root.
//!
//! Builds the repository, governance, dialect, provider, and engine
//! pieces from a workspace directory and wires them together. No global
//! mutable state: everything the surfaces need hangs off [`AppState`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use ork_dialect::{standard_tools, PromptCompiler};
use ork_domain::clock::SystemClock;
use ork_domain::config::{Config, WorkspaceLayout};
use ork_domain::error::Error;
use ork_domain::role::{BoundaryPolicy, Dialect, Role};
use ork_engine::{
    CriticalPathSelector, Diagnostician, SessionRegistry, ToolEffects, TractionLoop,
    TurnExecutor, Verifier,
};
use ork_governance::{StateMachine, ToolGate};
use ork_providers::RetryPolicy;
use ork_repository::{CardStore, SessionLedger};

use crate::state::AppState;

/// Build the full application from a workspace directory.
pub fn build(workspace: &Path) -> anyhow::Result<AppState> {
    build_with(workspace, |_| {})
}

/// Build with a CLI-level config override (e.g. `--timeout`).
pub fn build_with(
    workspace: &Path,
    override_config: impl FnOnce(&mut Config),
) -> anyhow::Result<AppState> {
    if !workspace.exists() {
        return Err(Error::WorkspaceMissing(workspace.display().to_string()).into());
    }
    let layout = WorkspaceLayout::new(workspace);
    layout.ensure_dirs().context("creating workspace layout")?;

    let mut config = Config::load(workspace).context("loading orket.json")?;
    override_config(&mut config);
    config.validate().context("validating config")?;
    let config = Arc::new(config);
    let clock = Arc::new(SystemClock);

    // ── Storage ──────────────────────────────────────────────────────
    let machine = Arc::new(StateMachine::standard());
    let store = Arc::new(
        CardStore::open(&layout.cards_db(), machine).context("opening cards.db")?,
    );
    let ledger = Arc::new(
        SessionLedger::open(&layout.ledger_db()).context("opening ledger.db")?,
    );
    // Crash recovery: close out sessions a previous process left dangling.
    ledger
        .mark_interrupted_sessions(chrono::Utc::now())
        .context("recovering dangling sessions")?;

    // ── Assets ───────────────────────────────────────────────────────
    let roles = load_roles(&layout).context("loading role assets")?;
    let dialect = load_dialect(&layout).context("loading dialect asset")?;
    let ethos = load_ethos(&layout);
    tracing::info!(
        roles = roles.len(),
        dialect = %dialect.dialect_id,
        ethos = ethos.is_some(),
        "assets loaded"
    );

    // ── Provider ─────────────────────────────────────────────────────
    let provider = ork_providers::from_config(&config.provider);
    tracing::info!(provider = provider.provider_id(), "model provider ready");

    // ── Governance ───────────────────────────────────────────────────
    let gate = Arc::new(
        ToolGate::new(
            &config.forbidden_file_patterns,
            config.complexity_gate_threshold,
            true,
        )
        .context("compiling forbidden file patterns")?,
    );

    // ── Engine ───────────────────────────────────────────────────────
    let retry = RetryPolicy::from(&config.retry);
    let executor = TurnExecutor::new(
        store.clone(),
        ledger.clone(),
        provider,
        PromptCompiler::new(config.context_max_chars, ethos),
        gate,
        ToolEffects::new(layout.agent_out(), store.clone()),
        roles,
        dialect,
        standard_tools(),
        retry,
        Duration::from_secs(config.turn_timeout_secs),
        clock.clone(),
    );

    let registry = Arc::new(SessionRegistry::new());
    let traction = Arc::new(TractionLoop::new(
        store.clone(),
        ledger.clone(),
        executor,
        CriticalPathSelector::new(config.dependency_fanout_factor),
        Diagnostician::new(config.bottleneck_thresholds.clone()),
        registry.clone(),
        Verifier::new(layout.verifier()),
        clock,
        retry,
        config.checkpoint_every_turns,
        config.max_transient_attempts,
    ));

    // ── Webhook secret (env only — no secrets in config files) ───────
    let webhook_secret = match std::env::var("ORKET_WEBHOOK_SECRET") {
        Ok(secret) if !secret.is_empty() => {
            tracing::info!("webhook signature verification enabled");
            Some(Arc::new(secret.into_bytes()))
        }
        _ => {
            tracing::warn!(
                "ORKET_WEBHOOK_SECRET not set — webhook intake will reject all deliveries"
            );
            None
        }
    };

    Ok(AppState {
        config,
        store,
        ledger,
        registry,
        traction,
        webhook_secret,
    })
}

/// Load `roles/*.json`; an empty directory falls back to the built-in
/// seats so a fresh workspace can run.
fn load_roles(layout: &WorkspaceLayout) -> anyhow::Result<HashMap<String, Role>> {
    let mut roles = HashMap::new();
    let dir = layout.roles();
    if dir.exists() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let role: Role = serde_json::from_str(&raw)
                .with_context(|| format!("parsing role asset {}", path.display()))?;
            roles.insert(role.role_id.clone(), role);
        }
    }
    if roles.is_empty() {
        for role in builtin_roles() {
            roles.insert(role.role_id.clone(), role);
        }
    }
    Ok(roles)
}

pub fn builtin_roles() -> Vec<Role> {
    let all_tools = ["write_file", "read_card", "set_status"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    vec![
        Role {
            role_id: "builder".into(),
            system_prompt: "You are the builder seat. You implement the card in front of you \
                            and nothing else."
                .into(),
            tools_allowed: all_tools,
            boundary_policy: BoundaryPolicy::Unrestricted,
        },
        Role {
            role_id: "reviewer".into(),
            system_prompt: "You are the reviewer seat. You judge finished work against its \
                            requirements."
                .into(),
            tools_allowed: ["read_card", "set_status"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            boundary_policy: BoundaryPolicy::Unrestricted,
        },
        Role {
            role_id: "lead_architect".into(),
            system_prompt: "You are the lead architect seat. You shape the work and keep the \
                            component boundaries honest."
                .into(),
            tools_allowed: ["write_file", "read_card", "set_status"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            boundary_policy: BoundaryPolicy::Managers,
        },
    ]
}

/// Load `dialects/active.json`, falling back to the plain-JSON built-in.
fn load_dialect(layout: &WorkspaceLayout) -> anyhow::Result<Dialect> {
    let path = layout.dialects().join("active.json");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let dialect: Dialect = serde_json::from_str(&raw)
            .with_context(|| format!("parsing dialect asset {}", path.display()))?;
        Ok(dialect)
    } else {
        Ok(Dialect::plain_json())
    }
}

fn load_ethos(layout: &WorkspaceLayout) -> Option<String> {
    std::fs::read_to_string(layout.root.join("ethos.md")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_scaffolds_a_fresh_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let state = build(dir.path()).unwrap();
        assert!(dir.path().join("cards.db").exists());
        assert!(dir.path().join("ledger.db").exists());
        assert!(dir.path().join("agent_out").is_dir());
        assert!(dir.path().join("verifier").is_dir());
        assert_eq!(state.registry.active_count(), 0);
    }

    #[test]
    fn missing_workspace_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(build(&missing).is_err());
    }

    #[test]
    fn custom_role_assets_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        std::fs::write(
            layout.roles().join("scribe.json"),
            serde_json::json!({
                "role_id": "scribe",
                "system_prompt": "You write things down.",
                "tools_allowed": ["write_file", "set_status"],
            })
            .to_string(),
        )
        .unwrap();

        let roles = load_roles(&layout).unwrap();
        assert_eq!(roles.len(), 1);
        assert!(roles.contains_key("scribe"));
    }
}
