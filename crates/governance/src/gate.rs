//! The tool gate — validates every tool call before side effects occur.
//!
//! Checks run in a fixed order, first failure wins:
//!   1. tool allow-list for the acting role
//!   2. path sandbox (canonicalize-and-descendant, never string prefix)
//!   3. iDesign boundary rules (when enabled)
//!   4. forbidden file types (workspace deny list)
//!
//! The gate returns a structured [`Violation`] — callers match on
//! [`ViolationCode`], never on the message text.

use std::path::{Component, Path, PathBuf};

use regex::RegexSet;
use serde::Serialize;

use ork_domain::role::{BoundaryPolicy, Role};
use ork_domain::session::ToolCall;

use crate::idesign::ComponentCategory;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Violation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    ToolNotAllowed,
    AbsolutePath,
    PathEscape,
    ComponentNaming,
    ComplexityGate,
    ForbiddenFileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Warning,
    Error,
}

/// A structured gate failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[error("{code:?}: {message}")]
pub struct Violation {
    pub code: ViolationCode,
    pub severity: ViolationSeverity,
    pub message: String,
    pub path: Option<PathBuf>,
}

impl Violation {
    fn error(code: ViolationCode, message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            code,
            severity: ViolationSeverity::Error,
            message: message.into(),
            path,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a requested path inside the sandbox root, or refuse.
///
/// 1. Rejects absolute paths and raw `..` components before resolution.
/// 2. Canonicalizes the root, joins the request, then canonicalizes the
///    longest existing ancestor and re-appends the remaining tail.
/// 3. Containment is checked on the resolved path (descendant semantics,
///    correct in the presence of symlinks and filesystem normalization).
pub fn resolve_sandboxed(root: &Path, requested: &str) -> Result<PathBuf, Violation> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(Violation::error(
            ViolationCode::AbsolutePath,
            format!("absolute paths are not allowed (got '{requested}')"),
            Some(requested_path.to_path_buf()),
        ));
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Violation::error(
                ViolationCode::PathEscape,
                "path must not contain '..' components",
                Some(requested_path.to_path_buf()),
            ));
        }
    }

    let canonical_root = root.canonicalize().map_err(|e| {
        Violation::error(
            ViolationCode::PathEscape,
            format!("cannot resolve sandbox root '{}': {e}", root.display()),
            None,
        )
    })?;

    let candidate = canonical_root.join(requested_path);

    // Canonicalize the longest existing ancestor, then re-append the tail
    // that does not exist yet.
    let resolved = if candidate.exists() {
        candidate.canonicalize().map_err(|e| {
            Violation::error(
                ViolationCode::PathEscape,
                format!("cannot resolve '{}': {e}", candidate.display()),
                Some(candidate.clone()),
            )
        })?
    } else {
        let mut existing = candidate.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        tail.push(name);
                    }
                    existing = parent;
                }
                None => break,
            }
        }
        let mut resolved = existing.canonicalize().map_err(|e| {
            Violation::error(
                ViolationCode::PathEscape,
                format!("cannot resolve ancestor of '{}': {e}", candidate.display()),
                Some(candidate.clone()),
            )
        })?;
        for part in tail.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(Violation::error(
            ViolationCode::PathEscape,
            format!("path '{requested}' resolves outside the sandbox root"),
            Some(resolved),
        ));
    }

    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-review context the executor supplies.
pub struct GateContext<'a> {
    pub role: &'a Role,
    /// Agent-output sandbox root.
    pub sandbox_root: &'a Path,
    /// Child-task count of the card's owning initiative (complexity gate).
    pub initiative_child_count: usize,
}

pub struct ToolGate {
    forbidden: RegexSet,
    complexity_gate_threshold: usize,
    idesign_enabled: bool,
}

impl ToolGate {
    pub fn new(
        forbidden_patterns: &[String],
        complexity_gate_threshold: usize,
        idesign_enabled: bool,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            forbidden: RegexSet::new(forbidden_patterns)?,
            complexity_gate_threshold,
            idesign_enabled,
        })
    }

    /// Review one tool call. First failing check wins.
    pub fn review(&self, call: &ToolCall, ctx: &GateContext<'_>) -> Result<(), Violation> {
        // 1. Tool allow-list.
        if !ctx.role.tools_allowed.contains(&call.tool_name) {
            return Err(Violation::error(
                ViolationCode::ToolNotAllowed,
                format!(
                    "tool '{}' is not allowed for role '{}'",
                    call.tool_name, ctx.role.role_id
                ),
                None,
            ));
        }

        // 2–4. Path-bearing arguments.
        for requested in path_arguments(&call.arguments) {
            let resolved = resolve_sandboxed(ctx.sandbox_root, requested)?;
            let relative = resolved
                .strip_prefix(ctx.sandbox_root.canonicalize().unwrap_or_else(|_| ctx.sandbox_root.to_path_buf()))
                .unwrap_or(&resolved)
                .to_path_buf();

            if self.idesign_enabled {
                self.check_idesign(&relative, ctx)?;
            }

            let rel_str = relative.to_string_lossy();
            if self.forbidden.is_match(&rel_str) {
                return Err(Violation::error(
                    ViolationCode::ForbiddenFileType,
                    format!("file type of '{rel_str}' is forbidden by workspace policy"),
                    Some(relative),
                ));
            }
        }

        Ok(())
    }

    /// iDesign boundary rules for one categorized (or uncategorized) write.
    ///
    /// Enforcement is forward-only: a tree already over the threshold does
    /// not retro-flag existing files, only new uncategorized writes fail.
    fn check_idesign(&self, relative: &Path, ctx: &GateContext<'_>) -> Result<(), Violation> {
        match ComponentCategory::infer(relative) {
            Some(category) => {
                if !category.stem_conforms(relative) {
                    return Err(Violation::error(
                        ViolationCode::ComponentNaming,
                        format!(
                            "files under {}/ must be named *{}",
                            category.segment(),
                            category.stem_suffix()
                        ),
                        Some(relative.to_path_buf()),
                    ));
                }
                // A category-restricted role may only write its own category.
                let allowed = match ctx.role.boundary_policy {
                    BoundaryPolicy::Unrestricted => true,
                    BoundaryPolicy::Managers => category == ComponentCategory::Managers,
                    BoundaryPolicy::Engines => category == ComponentCategory::Engines,
                    BoundaryPolicy::Accessors => category == ComponentCategory::Accessors,
                    BoundaryPolicy::Utilities => category == ComponentCategory::Utilities,
                };
                if !allowed {
                    return Err(Violation::error(
                        ViolationCode::ComponentNaming,
                        format!(
                            "role '{}' may not write {} components",
                            ctx.role.role_id,
                            category.segment()
                        ),
                        Some(relative.to_path_buf()),
                    ));
                }
                Ok(())
            }
            None => {
                if ctx.initiative_child_count > self.complexity_gate_threshold {
                    return Err(Violation::error(
                        ViolationCode::ComplexityGate,
                        format!(
                            "initiative has {} child tasks (> {}): writes must use the \
                             Manager/Engine/Accessor split",
                            ctx.initiative_child_count, self.complexity_gate_threshold
                        ),
                        Some(relative.to_path_buf()),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Extract the path-bearing argument values of a tool call.
///
/// Convention: tools declare path arguments under `path`, `source`, or
/// `destination`.
fn path_arguments(arguments: &serde_json::Value) -> Vec<&str> {
    const PATH_KEYS: [&str; 3] = ["path", "source", "destination"];
    let mut out = Vec::new();
    if let Some(map) = arguments.as_object() {
        for key in PATH_KEYS {
            if let Some(value) = map.get(key).and_then(|v| v.as_str()) {
                out.push(value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn role(tools: &[&str], policy: BoundaryPolicy) -> Role {
        Role {
            role_id: "builder".into(),
            system_prompt: String::new(),
            tools_allowed: tools.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            boundary_policy: policy,
        }
    }

    fn call(tool: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            call_id: "c1".into(),
            tool_name: tool.into(),
            arguments: args,
        }
    }

    fn gate() -> ToolGate {
        ToolGate::new(
            &[r"\.(exe|dll)$".to_string(), r"(^|/)\.env$".to_string()],
            7,
            true,
        )
        .unwrap()
    }

    #[test]
    fn denies_tool_outside_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(&call("delete_file", serde_json::json!({})), &ctx)
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::ToolNotAllowed);
    }

    #[test]
    fn path_traversal_is_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call(
                    "write_file",
                    serde_json::json!({"path": "../../etc/passwd", "content": "x"}),
                ),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::PathEscape);
    }

    #[test]
    fn absolute_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call("write_file", serde_json::json!({"path": "/etc/passwd"})),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::AbsolutePath);
    }

    #[test]
    fn symlink_escape_is_caught_after_resolution() {
        let outside = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.path().join("leak")).unwrap();

        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: sandbox.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call("write_file", serde_json::json!({"path": "leak/secret.txt"})),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::PathEscape);
    }

    #[test]
    fn in_sandbox_write_passes() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        assert!(gate()
            .review(
                &call("write_file", serde_json::json!({"path": "out/report.md"})),
                &ctx,
            )
            .is_ok());
    }

    #[test]
    fn forbidden_file_type_denied() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call("write_file", serde_json::json!({"path": "payload.exe"})),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::ForbiddenFileType);
    }

    #[test]
    fn idesign_naming_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call(
                    "write_file",
                    serde_json::json!({"path": "Managers/order_service.cs"}),
                ),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::ComponentNaming);

        assert!(gate()
            .review(
                &call(
                    "write_file",
                    serde_json::json!({"path": "Managers/OrderManager.cs"}),
                ),
                &ctx,
            )
            .is_ok());
    }

    #[test]
    fn boundary_policy_restricts_category() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Engines);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 0,
        };
        let v = gate()
            .review(
                &call(
                    "write_file",
                    serde_json::json!({"path": "Managers/OrderManager.cs"}),
                ),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::ComponentNaming);
    }

    #[test]
    fn complexity_gate_requires_split_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let r = role(&["write_file"], BoundaryPolicy::Unrestricted);
        let ctx = GateContext {
            role: &r,
            sandbox_root: dir.path(),
            initiative_child_count: 8,
        };
        let v = gate()
            .review(
                &call("write_file", serde_json::json!({"path": "notes.md"})),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(v.code, ViolationCode::ComplexityGate);

        // Categorized writes stay fine over the threshold.
        assert!(gate()
            .review(
                &call(
                    "write_file",
                    serde_json::json!({"path": "Engines/PricingEngine.cs"}),
                ),
                &ctx,
            )
            .is_ok());
    }
}
