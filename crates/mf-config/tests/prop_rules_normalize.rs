// crates/mf-config/tests/prop_rules_normalize.rs
use mf_config::json_norm::{normalize_value, to_canonical_string};
use mf_config::rules::{compile, RuleSource};
use proptest::prelude::*;
use serde_json::json;

fn first_occurrence_order(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        let v = v.trim();
        if !v.is_empty() && !out.iter().any(|o| o == v) {
            out.push(v.to_string());
        }
    }
    out
}

fn domain_like() -> impl Strategy<Value = String> {
    // Small alphabet so duplicates are common.
    "[a-d]{1,3}\\.(com|net)"
}

// Property test: structured sources normalize to unique, first-seen ordered fields
proptest! {
    #[test]
    fn json_fields_unique_in_first_seen_order(
        domains in prop::collection::vec(domain_like(), 0..24),
        suffixes in prop::collection::vec(domain_like(), 0..24),
    ) {
        let text = json!({"domain": domains, "domain_suffix": suffixes}).to_string();
        let rules = compile(&RuleSource::Json(text)).unwrap();
        prop_assert_eq!(&rules.domain, &first_occurrence_order(&domains));
        prop_assert_eq!(&rules.domain_suffix, &first_occurrence_order(&suffixes));
    }
}

// Property test: the `rules` list form concatenates before deduplicating
proptest! {
    #[test]
    fn rules_list_concatenates_then_dedups(
        a in prop::collection::vec(domain_like(), 0..12),
        b in prop::collection::vec(domain_like(), 0..12),
    ) {
        let text = json!({"rules": [{"domain_suffix": a}, {"domain_suffix": b}]}).to_string();
        let rules = compile(&RuleSource::Json(text)).unwrap();
        let joined: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
        prop_assert_eq!(&rules.domain_suffix, &first_occurrence_order(&joined));
    }
}

// Property test: canonical output does not depend on key insertion order
proptest! {
    #[test]
    fn canonical_string_ignores_key_order(keys in prop::collection::btree_set("[a-z]{1,6}", 1..10)) {
        let forward: serde_json::Map<String, serde_json::Value> =
            keys.iter().map(|k| (k.clone(), json!(k.len()))).collect();
        let backward: serde_json::Map<String, serde_json::Value> =
            keys.iter().rev().map(|k| (k.clone(), json!(k.len()))).collect();
        let a = to_canonical_string(&serde_json::Value::Object(forward)).unwrap();
        let b = to_canonical_string(&serde_json::Value::Object(backward)).unwrap();
        prop_assert_eq!(a, b);
    }
}

#[test]
fn normalize_is_idempotent_on_nested_documents() {
    let v = json!({"route": {"rules": [{"z": 1, "a": {"y": 2, "b": 3}}]}, "log": {}});
    let once = normalize_value(v);
    assert_eq!(normalize_value(once.clone()), once);
}
