//! Tool specifications known to the dialect layer.
//!
//! The parser validates call names and required arguments against these;
//! the compiler renders them into the prompt's tool section.

/// Declarative shape of one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required_args: &'static [&'static str],
}

/// The standard Orket toolset.
///
/// `set_status` is how a turn declares its intended transition; the
/// executor interprets it rather than applying it as a side effect.
pub fn standard_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "write_file",
            description: "Write a file under the agent output root.",
            required_args: &["path", "content"],
        },
        ToolSpec {
            name: "read_card",
            description: "Read another card's snapshot by id.",
            required_args: &["card_id"],
        },
        ToolSpec {
            name: "set_status",
            description: "Declare the card's next status (and wait_reason when blocking).",
            required_args: &["to"],
        },
    ]
}

impl ToolSpec {
    pub fn find<'a>(specs: &'a [ToolSpec], name: &str) -> Option<&'a ToolSpec> {
        specs.iter().find(|s| s.name == name)
    }
}
