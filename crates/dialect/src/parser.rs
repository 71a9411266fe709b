//! Tool-call extraction from raw model output.
//!
//! `parse` is total: it never fails, every problem surfaces as a typed
//! [`ParseIssue`]. For a given `(raw_text, dialect)` the result is
//! identical across calls. `serialize` is the inverse for well-formed
//! lists (`parse(serialize(calls)) == calls` per dialect).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use ork_domain::role::{Dialect, ToolCallSyntax};
use ork_domain::session::ToolCall;

use crate::tools::ToolSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed parse problems. Stable SCREAMING_SNAKE codes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParseIssue {
    EmptyOutput,
    MalformedCall { snippet: String },
    UnknownTool { name: String },
    DuplicateCallId { call_id: String },
    MissingRequiredArg { tool: String, arg: String },
}

/// Parse result: extracted calls plus every issue encountered.
#[derive(Debug, Clone, Default)]
pub struct Parsed {
    pub calls: Vec<ToolCall>,
    pub issues: Vec<ParseIssue>,
}

impl Parsed {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The JSON object both dialects carry, field order fixed for
/// deterministic serialization.
#[derive(Debug, Serialize, Deserialize)]
struct WireCall {
    call_id: String,
    tool: String,
    args: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract structured tool calls from raw model output.
pub fn parse(raw: &str, dialect: &Dialect, known_tools: &[ToolSpec]) -> Parsed {
    if raw.trim().is_empty() {
        return Parsed {
            calls: Vec::new(),
            issues: vec![ParseIssue::EmptyOutput],
        };
    }

    let candidates: Vec<String> = match dialect.tool_call_syntax {
        ToolCallSyntax::PlainJson => raw
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .map(str::to_owned)
            .collect(),
        ToolCallSyntax::Tagged => extract_tagged_blocks(raw),
    };

    let mut parsed = Parsed::default();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for candidate in candidates {
        let wire: WireCall = match serde_json::from_str(&candidate) {
            Ok(w) => w,
            Err(_) => {
                parsed.issues.push(ParseIssue::MalformedCall {
                    snippet: truncate(&candidate, 120),
                });
                continue;
            }
        };

        if !seen_ids.insert(wire.call_id.clone()) {
            parsed.issues.push(ParseIssue::DuplicateCallId {
                call_id: wire.call_id,
            });
            continue;
        }

        let Some(spec) = ToolSpec::find(known_tools, &wire.tool) else {
            parsed.issues.push(ParseIssue::UnknownTool { name: wire.tool });
            continue;
        };

        let args_obj = wire.args.as_object();
        let missing = spec
            .required_args
            .iter()
            .find(|arg| args_obj.map_or(true, |o| !o.contains_key(**arg)));
        if let Some(arg) = missing {
            parsed.issues.push(ParseIssue::MissingRequiredArg {
                tool: spec.name.to_owned(),
                arg: (*arg).to_owned(),
            });
            continue;
        }

        parsed.calls.push(ToolCall {
            call_id: wire.call_id,
            tool_name: wire.tool,
            arguments: wire.args,
        });
    }

    parsed
}

/// Serialize a call list back into the dialect's wire form.
pub fn serialize(calls: &[ToolCall], dialect: &Dialect) -> String {
    let lines: Vec<String> = calls
        .iter()
        .map(|call| {
            let wire = WireCall {
                call_id: call.call_id.clone(),
                tool: call.tool_name.clone(),
                args: call.arguments.clone(),
            };
            let json = serde_json::to_string(&wire).unwrap_or_default();
            match dialect.tool_call_syntax {
                ToolCallSyntax::PlainJson => json,
                ToolCallSyntax::Tagged => format!("<tool_call>{json}</tool_call>"),
            }
        })
        .collect();
    lines.join("\n")
}

fn extract_tagged_blocks(raw: &str) -> Vec<String> {
    const OPEN: &str = "<tool_call>";
    const CLOSE: &str = "</tool_call>";

    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        match after.find(CLOSE) {
            Some(end) => {
                out.push(after[..end].trim().to_owned());
                rest = &after[end + CLOSE.len()..];
            }
            None => {
                // Unterminated block: surface the remainder as one candidate
                // so it reports as malformed rather than vanishing.
                out.push(after.trim().to_owned());
                break;
            }
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::standard_tools;

    fn call(id: &str, tool: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: tool.into(),
            arguments: args,
        }
    }

    #[test]
    fn empty_output_is_a_typed_issue() {
        let parsed = parse("   \n  ", &Dialect::plain_json(), &standard_tools());
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.issues, vec![ParseIssue::EmptyOutput]);
    }

    #[test]
    fn plain_json_lines_parse_around_prose() {
        let raw = concat!(
            "I will write the summary now.\n",
            r#"{"call_id":"c1","tool":"write_file","args":{"path":"out.md","content":"hi"}}"#,
            "\n",
            r#"{"call_id":"c2","tool":"set_status","args":{"to":"DONE"}}"#,
            "\nDone.",
        );
        let parsed = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert!(parsed.is_clean());
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[0].tool_name, "write_file");
        assert_eq!(parsed.calls[1].tool_name, "set_status");
    }

    #[test]
    fn tagged_blocks_parse() {
        let raw = concat!(
            "thinking...\n",
            r#"<tool_call>{"call_id":"c1","tool":"read_card","args":{"card_id":"T2"}}</tool_call>"#,
            "\ntrailing prose",
        );
        let parsed = parse(raw, &Dialect::tagged(), &standard_tools());
        assert!(parsed.is_clean());
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].arguments["card_id"], "T2");
    }

    #[test]
    fn malformed_json_is_reported_not_raised() {
        let raw = r#"{"call_id": "c1", "tool": "write_file", args}"#;
        let parsed = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert!(parsed.calls.is_empty());
        assert!(matches!(
            parsed.issues[0],
            ParseIssue::MalformedCall { .. }
        ));
    }

    #[test]
    fn unknown_tool_reported() {
        let raw = r#"{"call_id":"c1","tool":"format_disk","args":{}}"#;
        let parsed = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert_eq!(
            parsed.issues,
            vec![ParseIssue::UnknownTool {
                name: "format_disk".into()
            }]
        );
    }

    #[test]
    fn duplicate_call_ids_reported_once_kept_once() {
        let raw = concat!(
            r#"{"call_id":"c1","tool":"set_status","args":{"to":"DONE"}}"#,
            "\n",
            r#"{"call_id":"c1","tool":"set_status","args":{"to":"FAILED"}}"#,
        );
        let parsed = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(
            parsed.issues,
            vec![ParseIssue::DuplicateCallId {
                call_id: "c1".into()
            }]
        );
    }

    #[test]
    fn missing_required_arg_reported() {
        let raw = r#"{"call_id":"c1","tool":"write_file","args":{"path":"out.md"}}"#;
        let parsed = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert_eq!(
            parsed.issues,
            vec![ParseIssue::MissingRequiredArg {
                tool: "write_file".into(),
                arg: "content".into()
            }]
        );
    }

    #[test]
    fn round_trip_both_dialects() {
        let calls = vec![
            call(
                "c1",
                "write_file",
                serde_json::json!({"path": "a.md", "content": "x"}),
            ),
            call("c2", "set_status", serde_json::json!({"to": "DONE"})),
        ];
        for dialect in [Dialect::plain_json(), Dialect::tagged()] {
            let wire = serialize(&calls, &dialect);
            let parsed = parse(&wire, &dialect, &standard_tools());
            assert!(parsed.is_clean(), "dialect {}", dialect.dialect_id);
            assert_eq!(parsed.calls, calls);
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let raw = concat!(
            "prose\n",
            r#"{"call_id":"c1","tool":"set_status","args":{"to":"DONE"}}"#,
            "\n",
            r#"{"call_id":"c1","tool":"set_status","args":{"to":"DONE"}}"#,
        );
        let a = parse(raw, &Dialect::plain_json(), &standard_tools());
        let b = parse(raw, &Dialect::plain_json(), &standard_tools());
        assert_eq!(a.calls, b.calls);
        assert_eq!(a.issues, b.issues);
    }

    #[test]
    fn unterminated_tagged_block_is_malformed() {
        let raw = r#"<tool_call>{"call_id":"c1","tool":"set_status""#;
        let parsed = parse(raw, &Dialect::tagged(), &standard_tools());
        assert!(parsed.calls.is_empty());
        assert!(matches!(
            parsed.issues[0],
            ParseIssue::MalformedCall { .. }
        ));
    }
}
