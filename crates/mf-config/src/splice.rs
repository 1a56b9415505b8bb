//! Splice compiled dynamic rules into `route.rules`.
//!
//! Matching must see the sniffed domain, so compiled rules go right after the
//! sniffing stage and before anything else (hijack-dns, catch-alls).

use crate::rules::CompiledRule;
use crate::template::Template;
use serde::Serialize;
use serde_json::{json, Value};

/// Where the sniffing stage ended up and how many rules were inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpliceReport {
    pub sniff_index: usize,
    pub sniff_synthesized: bool,
    pub inserted: usize,
}

/// Index of the first rule whose action is `sniff`.
pub fn find_sniff(rules: &[Value]) -> Option<usize> {
    rules.iter().position(is_sniff)
}

pub fn is_sniff(rule: &Value) -> bool {
    rule.get("action").and_then(Value::as_str) == Some("sniff")
}

/// Insert `compiled` directly after the sniff rule, synthesizing one at index 0
/// when the list has none.
pub fn splice_rules(rules: &mut Vec<Value>, compiled: &[CompiledRule]) -> SpliceReport {
    let (sniff_index, sniff_synthesized) = match find_sniff(rules) {
        Some(idx) => (idx, false),
        None => {
            rules.insert(0, json!({"action": "sniff"}));
            (0, true)
        }
    };
    let at = sniff_index + 1;
    rules.splice(at..at, compiled.iter().map(CompiledRule::to_value));
    SpliceReport {
        sniff_index,
        sniff_synthesized,
        inserted: compiled.len(),
    }
}

/// [`splice_rules`] on the template's `route.rules`.
pub fn splice_into(tpl: &mut Template, compiled: &[CompiledRule]) -> SpliceReport {
    let report = splice_rules(tpl.route_rules_mut(), compiled);
    if report.sniff_synthesized {
        tracing::info!("template has no sniff rule; synthesized one at position 0");
    }
    tracing::debug!(
        inserted = report.inserted,
        at = report.sniff_index + 1,
        "dynamic rules spliced after sniff"
    );
    report
}
