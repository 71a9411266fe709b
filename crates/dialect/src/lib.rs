//! Dialect layer: prompt compilation and tool-call parsing.
//!
//! The compiler folds role persona, ethos, card context, and the recent
//! session window into the model's wire format; the parser extracts the
//! model's tool calls back out. Both are pure and deterministic — the
//! same inputs always produce the same bytes and the same call list.

pub mod compiler;
pub mod parser;
pub mod tools;

pub use compiler::{CompiledPrompt, ContextEntry, PromptCompiler};
pub use parser::{parse, serialize, Parsed, ParseIssue};
pub use tools::{standard_tools, ToolSpec};
