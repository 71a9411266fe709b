//! Prompt compilation.
//!
//! Role intent is composed before dialect wrapping, so one role yields
//! different wire bytes but equivalent semantics across model dialects.
//! Compilation is byte-deterministic: identical inputs produce identical
//! output, which makes prompt digests meaningful in the audit ledger.

use ork_domain::card::Card;
use ork_domain::digest::sha256_hex;
use ork_domain::role::{Dialect, Role};

use crate::tools::ToolSpec;

/// One entry of the recent-session context window.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    /// Entry kind (`turn`, `checkpoint`, `diagnostic`, ...). Checkpoint
    /// entries are boundary markers and survive elision.
    pub kind: String,
    pub text: String,
}

/// A compiled wire-format prompt plus its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPrompt {
    pub text: String,
    /// SHA-256 hex of `text` — stored on the turn record.
    pub digest: String,
}

pub struct PromptCompiler {
    /// Cap on the rendered context window, in characters.
    context_max_chars: usize,
    /// Organization ethos injected into every system block, verbatim.
    ethos: Option<String>,
}

impl PromptCompiler {
    pub fn new(context_max_chars: usize, ethos: Option<String>) -> Self {
        Self {
            context_max_chars,
            ethos,
        }
    }

    /// Compile the full prompt for one turn.
    pub fn compile(
        &self,
        role: &Role,
        dialect: &Dialect,
        card: &Card,
        recent: &[ContextEntry],
        tools: &[ToolSpec],
    ) -> CompiledPrompt {
        let mut system = role.system_prompt.trim_end().to_owned();
        if let Some(ethos) = &self.ethos {
            system.push_str("\n\n## Ethos\n");
            system.push_str(ethos.trim_end());
        }
        let wire_system = dialect.system_wrapper.replace("{system}", &system);

        let mut text = String::new();
        text.push_str(&wire_system);
        text.push_str("\n\n");

        // ── Card snapshot ────────────────────────────────────────────
        text.push_str("## Card\n");
        text.push_str(&format!("id: {}\n", card.id));
        text.push_str(&format!("kind: {}\n", card.kind.as_str()));
        text.push_str(&format!("title: {}\n", card.title));
        text.push_str(&format!("status: {}\n", card.status.as_str()));
        text.push_str(&format!("priority: {}\n", card.priority.0));
        if let Some(parent) = &card.parent_id {
            text.push_str(&format!("parent: {parent}\n"));
        }
        if let Some(req) = &card.requirements_ref {
            text.push_str(&format!("requirements: {req}\n"));
        }
        if let Some(ver) = &card.verification_ref {
            text.push_str(&format!("verification: {ver}\n"));
        }

        // ── Tools ────────────────────────────────────────────────────
        text.push_str("\n## Tools\n");
        for tool in tools {
            text.push_str(&format!(
                "- {}({}): {}\n",
                tool.name,
                tool.required_args.join(", "),
                tool.description
            ));
        }
        text.push_str(&syntax_instructions(dialect));

        // ── Recent session window ────────────────────────────────────
        let window = render_window(recent, self.context_max_chars);
        if !window.is_empty() {
            text.push_str("\n## Recent activity\n");
            text.push_str(&window);
        }

        text.push_str(
            "\n## Instructions\n\
             Work the card. Emit tool calls in the declared syntax and \
             finish by declaring the card's next status with set_status.\n",
        );

        let digest = sha256_hex(text.as_bytes());
        CompiledPrompt { text, digest }
    }
}

fn syntax_instructions(dialect: &Dialect) -> String {
    use ork_domain::role::ToolCallSyntax;
    match dialect.tool_call_syntax {
        ToolCallSyntax::PlainJson => {
            "Emit each call as one JSON line: \
             {\"call_id\": \"...\", \"tool\": \"...\", \"args\": {...}}\n"
                .to_owned()
        }
        ToolCallSyntax::Tagged => {
            "Emit each call as <tool_call>{\"call_id\": \"...\", \
             \"tool\": \"...\", \"args\": {...}}</tool_call>\n"
                .to_owned()
        }
    }
}

/// Render the bounded context window: newest entries win, oldest elided
/// first, checkpoint boundary markers always survive, and an elision
/// marker records how many entries were dropped.
fn render_window(recent: &[ContextEntry], max_chars: usize) -> String {
    if recent.is_empty() {
        return String::new();
    }

    // Walk from newest to oldest, keeping entries while they fit.
    let mut kept = vec![false; recent.len()];
    let mut used = 0usize;
    for (i, entry) in recent.iter().enumerate().rev() {
        let cost = entry.text.len() + 1;
        if used + cost <= max_chars {
            kept[i] = true;
            used += cost;
        }
    }
    // Boundary markers are preserved regardless of age.
    for (i, entry) in recent.iter().enumerate() {
        if entry.kind == "checkpoint" {
            kept[i] = true;
        }
    }

    let elided = kept.iter().filter(|k| !**k).count();
    let mut out = String::new();
    if elided > 0 {
        out.push_str(&format!("[elided {elided} earlier entries]\n"));
    }
    for (i, entry) in recent.iter().enumerate() {
        if kept[i] {
            out.push_str(&format!("[{}] {}\n", entry.kind, entry.text));
        }
    }
    out
}
