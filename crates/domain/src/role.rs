//! Role and dialect assets.
//!
//! Roles are declarative persona files loaded from the workspace; dialects
//! are model-specific grammar templates. Both are plain data here — the
//! dialect crate owns compilation and parsing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// iDesign component category a role is allowed to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// May write any category.
    Unrestricted,
    Managers,
    Engines,
    Accessors,
    Utilities,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        BoundaryPolicy::Unrestricted
    }
}

/// A declarative persona asset: who the seat is and what it may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: String,
    pub system_prompt: String,
    /// Tool names this role may invoke.
    pub tools_allowed: BTreeSet<String>,
    #[serde(default)]
    pub boundary_policy: BoundaryPolicy,
}

/// Model-specific grammar template.
///
/// `system_wrapper` must contain the `{system}` placeholder; the tool-call
/// syntax selects which parser grammar applies to the model's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialect {
    pub dialect_id: String,
    pub system_wrapper: String,
    pub tool_call_syntax: ToolCallSyntax,
}

/// The two wire grammars a model may emit tool calls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallSyntax {
    /// One JSON object per line: `{"call_id": ..., "tool": ..., "args": {...}}`.
    PlainJson,
    /// `<tool_call>...</tool_call>` blocks containing the same JSON object.
    Tagged,
}

impl Dialect {
    /// Built-in dialect for models that emit bare JSON lines.
    pub fn plain_json() -> Self {
        Self {
            dialect_id: "plain_json".into(),
            system_wrapper: "{system}".into(),
            tool_call_syntax: ToolCallSyntax::PlainJson,
        }
    }

    /// Built-in dialect for models trained on tagged tool blocks.
    pub fn tagged() -> Self {
        Self {
            dialect_id: "tagged".into(),
            system_wrapper: "<|system|>\n{system}\n<|end|>".into(),
            tool_call_syntax: ToolCallSyntax::Tagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_dialects_have_system_placeholder() {
        assert!(Dialect::plain_json().system_wrapper.contains("{system}"));
        assert!(Dialect::tagged().system_wrapper.contains("{system}"));
    }

    #[test]
    fn role_round_trips_through_json() {
        let role = Role {
            role_id: "lead_architect".into(),
            system_prompt: "You are the lead architect.".into(),
            tools_allowed: ["write_file", "set_status"].iter().map(|s| s.to_string()).collect(),
            boundary_policy: BoundaryPolicy::Managers,
        };
        let json = serde_json::to_string(&role).unwrap();
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role_id, role.role_id);
        assert_eq!(back.tools_allowed, role.tools_allowed);
        assert_eq!(back.boundary_policy, BoundaryPolicy::Managers);
    }
}
