//! Typed organization-level configuration.
//!
//! Loaded from `orket.json` at the workspace root. Every field has a
//! serde default so a missing file means "all defaults". Environment
//! variables carry only secrets and the workspace path override — no
//! behavioural flags hide in env.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bottleneck_thresholds: BottleneckThresholds,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "d_complexity_gate")]
    pub complexity_gate_threshold: usize,
    /// Dependency-fanout weight factor for the critical path selector.
    #[serde(default = "d_fanout_factor")]
    pub dependency_fanout_factor: f64,
    /// Hard cap on the prompt context window, in characters.
    #[serde(default = "d_context_max_chars")]
    pub context_max_chars: usize,
    /// Per-turn timeout in seconds.
    #[serde(default = "d_turn_timeout")]
    pub turn_timeout_secs: u64,
    /// Checkpoint the session ledger every this many turns.
    #[serde(default = "d_checkpoint_every")]
    pub checkpoint_every_turns: u32,
    /// Transient-failure requeue budget per card.
    #[serde(default = "d_max_transient")]
    pub max_transient_attempts: u32,
    /// Forbidden file patterns (regexes matched against the relative path).
    #[serde(default = "d_forbidden_types")]
    pub forbidden_file_patterns: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bottleneck thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckThresholds {
    #[serde(default = "d_3")]
    pub resource_normal: usize,
    #[serde(default = "d_10")]
    pub resource_warning: usize,
    #[serde(default = "d_11")]
    pub resource_critical: usize,
    #[serde(default = "d_half")]
    pub dependency_warning_pct: f64,
    #[serde(default = "d_1")]
    pub human_attention_threshold: usize,
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self {
            resource_normal: 3,
            resource_warning: 10,
            resource_critical: 11,
            dependency_warning_pct: 0.5,
            human_attention_threshold: 1,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "d_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "d_endpoint")]
    pub endpoint: String,
    /// Concurrent in-flight completions (1 for single-GPU local runners).
    #[serde(default = "d_1")]
    pub concurrency: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            endpoint: d_endpoint(),
            concurrency: 1,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_1000")]
    pub base_ms: u64,
    #[serde(default = "d_factor")]
    pub factor: f64,
    #[serde(default = "d_30000")]
    pub cap_ms: u64,
    #[serde(default = "d_5")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 30_000,
            max_attempts: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load `orket.json` from the workspace root; missing file means
    /// all-defaults, malformed file is fatal.
    pub fn load(workspace: &Path) -> Result<Config> {
        let path = workspace.join("orket.json");
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.bottleneck_thresholds;
        if t.resource_normal > t.resource_warning {
            return Err(Error::ConfigInvalid(
                "bottleneck_thresholds: resource_normal must be <= resource_warning".into(),
            ));
        }
        if !(0.0..=1.0).contains(&t.dependency_warning_pct) {
            return Err(Error::ConfigInvalid(
                "bottleneck_thresholds: dependency_warning_pct must be in [0, 1]".into(),
            ));
        }
        if self.retry.factor < 1.0 {
            return Err(Error::ConfigInvalid("retry.factor must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::ConfigInvalid("retry.max_attempts must be >= 1".into()));
        }
        if self.provider.concurrency == 0 {
            return Err(Error::ConfigInvalid("provider.concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known paths inside a workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn cards_db(&self) -> PathBuf {
        self.root.join("cards.db")
    }

    pub fn ledger_db(&self) -> PathBuf {
        self.root.join("ledger.db")
    }

    /// Sandbox root for tool-call outputs.
    pub fn agent_out(&self) -> PathBuf {
        self.root.join("agent_out")
    }

    /// Verification sandbox — write-forbidden to agents.
    pub fn verifier(&self) -> PathBuf {
        self.root.join("verifier")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn roles(&self) -> PathBuf {
        self.root.join("roles")
    }

    pub fn dialects(&self) -> PathBuf {
        self.root.join("dialects")
    }

    /// Create the directory skeleton. The database files are created by
    /// the stores on open.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.agent_out(),
            self.verifier(),
            self.logs(),
            self.roles(),
            self.dialects(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_1() -> usize {
    1
}
fn d_3() -> usize {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> usize {
    10
}
fn d_11() -> usize {
    11
}
fn d_half() -> f64 {
    0.5
}
fn d_1000() -> u64 {
    1000
}
fn d_30000() -> u64 {
    30_000
}
fn d_factor() -> f64 {
    2.0
}
fn d_complexity_gate() -> usize {
    7
}
fn d_fanout_factor() -> f64 {
    0.5
}
fn d_context_max_chars() -> usize {
    16_000
}
fn d_turn_timeout() -> u64 {
    300
}
fn d_checkpoint_every() -> u32 {
    10
}
fn d_max_transient() -> u32 {
    3
}
fn d_forbidden_types() -> Vec<String> {
    vec![
        r"\.(exe|dll|so|dylib)$".into(),
        r"\.(pem|key|p12)$".into(),
        r"(^|/)\.env(\.|$)".into(),
    ]
}
fn d_provider_kind() -> ProviderKind {
    ProviderKind::Local
}
fn d_endpoint() -> String {
    "http://127.0.0.1:8080".into()
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    7430
}
