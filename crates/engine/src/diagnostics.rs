//! Bottleneck diagnostics.
//!
//! Classifies the workspace posture for operators. Advisory only — the
//! selector never consults this.

use std::collections::HashMap;

use serde::Serialize;

use ork_domain::card::WaitReason;
use ork_domain::config::BottleneckThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub dominant_reason: Option<WaitReason>,
    pub action_hint: String,
    pub blocked_total: usize,
    pub active_turns: usize,
}

pub struct Diagnostician {
    thresholds: BottleneckThresholds,
}

impl Diagnostician {
    pub fn new(thresholds: BottleneckThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify the current posture from blocked-card counts and the
    /// number of turns in flight.
    pub fn assess(
        &self,
        by_reason: &HashMap<WaitReason, usize>,
        active_turns: usize,
    ) -> Diagnostic {
        let t = &self.thresholds;
        let blocked_total: usize = by_reason.values().sum();
        let dependency_count = by_reason.get(&WaitReason::Dependency).copied().unwrap_or(0);
        let input_count = by_reason.get(&WaitReason::Input).copied().unwrap_or(0);

        // Base severity from queue depth.
        let mut severity = if blocked_total <= t.resource_normal {
            Severity::Ok
        } else if blocked_total <= t.resource_warning {
            Severity::Warning
        } else {
            Severity::Critical
        };
        let mut idle = false;

        // Blocked but idle overrides the counts entirely.
        if blocked_total > 0 && active_turns == 0 {
            severity = Severity::Critical;
            idle = true;
        }

        // Dominant reason: largest bucket, ties broken by fixed enum order.
        let mut dominant = dominant_by_count(by_reason);

        // Human attention: any INPUT wait at or over the attention
        // threshold is at least a warning and takes the dominant slot.
        if input_count > 0 && blocked_total >= t.human_attention_threshold {
            severity = severity.max(Severity::Warning);
            dominant = Some(WaitReason::Input);
        }
        // Dependency skew: a mostly-DEPENDENCY queue is at least a warning.
        else if blocked_total > 0
            && (dependency_count as f64 / blocked_total as f64) > t.dependency_warning_pct
        {
            severity = severity.max(Severity::Warning);
            dominant = Some(WaitReason::Dependency);
        }

        let action_hint = hint(severity, dominant, idle, blocked_total);
        Diagnostic {
            severity,
            dominant_reason: dominant,
            action_hint,
            blocked_total,
            active_turns,
        }
    }
}

fn dominant_by_count(by_reason: &HashMap<WaitReason, usize>) -> Option<WaitReason> {
    const ORDER: [WaitReason; 4] = [
        WaitReason::Resource,
        WaitReason::Dependency,
        WaitReason::Review,
        WaitReason::Input,
    ];
    ORDER
        .iter()
        .filter_map(|r| by_reason.get(r).map(|n| (*r, *n)))
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(_, n)| *n)
        .map(|(r, _)| r)
}

fn hint(
    severity: Severity,
    dominant: Option<WaitReason>,
    idle: bool,
    blocked_total: usize,
) -> String {
    if severity == Severity::Ok {
        return "healthy".into();
    }

    let posture = if idle {
        format!("blocked but idle: {blocked_total} card(s) wait with no turn in flight")
    } else if severity == Severity::Critical {
        format!("chronic bottleneck: {blocked_total} card(s) blocked")
    } else {
        format!("queue building: {blocked_total} card(s) blocked")
    };

    let advice = match dominant {
        Some(WaitReason::Resource) => {
            "add executor capacity or raise the provider concurrency cap"
        }
        Some(WaitReason::Dependency) => "untangle the dependency chain on the critical path",
        Some(WaitReason::Review) => "clear the review queue",
        Some(WaitReason::Input) => "a human decision is needed — answer the waiting card(s)",
        None => "inspect the blocked cards",
    };

    format!("{posture}; {advice}")
}
