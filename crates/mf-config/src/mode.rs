//! Rule / global routing mode rewrite.
//! 规则模式 / 全局模式
//!
//! - Rule: only rules targeting the primary egress survive; everything else
//!   goes direct and resolves through the local DNS server.
//! - Global: China destinations (`geoip-cn`) go direct; everything else is
//!   proxied and resolved remotely.
//!
//! Both modes keep the sniff rule first, so dynamic rules still follow it.

use crate::patch::AppliedPatch;
use crate::splice::is_sniff;
use crate::template::Template;
use crate::{RoutingMode, DIRECT_OUTBOUND};
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub const CHINA_RULE_SET: &str = "geoip-cn";
pub const LOCAL_DNS: &str = "local-dns";
pub const REMOTE_DNS: &str = "google-dns";

/// Rewrite `route`, `dns` and the direct outbound for `mode`.
pub fn apply_routing_mode(tpl: &mut Template, mode: RoutingMode, primary: &str) -> AppliedPatch {
    let existing = std::mem::take(tpl.route_rules_mut());
    let has_china_set = route_declares_rule_set(tpl, CHINA_RULE_SET);

    let rules = match mode {
        RoutingMode::Rule => rule_mode_rules(existing, primary),
        RoutingMode::Global => global_mode_rules(existing, has_china_set),
    };
    let final_outbound = match mode {
        RoutingMode::Rule => DIRECT_OUTBOUND,
        RoutingMode::Global => primary,
    };
    let proxy_domains = match mode {
        RoutingMode::Rule => Some(proxy_domains(&rules, primary)),
        RoutingMode::Global => None,
    };
    *tpl.route_rules_mut() = rules;
    tpl.route_mut()
        .insert("final".into(), Value::from(final_outbound));

    if let Some(dns) = tpl.existing_section_mut("dns") {
        let mut dns_rules = china_local_dns_rules();
        match proxy_domains {
            Some((domain, suffix)) => {
                dns.insert("final".into(), Value::from(LOCAL_DNS));
                if !domain.is_empty() {
                    dns_rules.push(json!({"action": "route", "domain": domain, "server": REMOTE_DNS}));
                }
                if !suffix.is_empty() {
                    dns_rules.push(
                        json!({"action": "route", "domain_suffix": suffix, "server": REMOTE_DNS}),
                    );
                }
            }
            None => {
                dns.insert("final".into(), Value::from(REMOTE_DNS));
            }
        }
        dns.insert("rules".into(), Value::Array(dns_rules));
    }

    // Direct traffic stays on IPv4; networks without usable IPv6 otherwise fail with "no route to host".
    if let Some(direct) = tpl.outbounds_mut().and_then(|obs| {
        obs.iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|o| o.get("tag").and_then(Value::as_str) == Some(DIRECT_OUTBOUND))
    }) {
        direct.insert("domain_strategy".into(), Value::from("ipv4_only"));
    }

    AppliedPatch::RoutingMode { mode }
}

fn rule_mode_rules(existing: Vec<Value>, primary: &str) -> Vec<Value> {
    let mut sniff = None;
    let mut routed = Vec::new();
    let mut action_only = Vec::new();
    for rule in existing {
        if is_sniff(&rule) {
            if sniff.is_none() {
                sniff = Some(rule);
            }
            continue;
        }
        if is_action_only(&rule) {
            action_only.push(rule);
            continue;
        }
        if references_rule_set(&rule, CHINA_RULE_SET) {
            continue;
        }
        if rule.get("outbound").and_then(Value::as_str) == Some(primary) {
            routed.push(rule);
        }
    }
    let mut out = vec![sniff.unwrap_or_else(|| json!({"action": "sniff"}))];
    out.extend(routed);
    out.extend(action_only);
    out
}

fn global_mode_rules(existing: Vec<Value>, has_china_set: bool) -> Vec<Value> {
    let mut sniff = None;
    let mut action_only = Vec::new();
    for rule in existing {
        if is_sniff(&rule) {
            if sniff.is_none() {
                sniff = Some(rule);
            }
        } else if is_action_only(&rule) {
            action_only.push(rule);
        }
    }
    let mut out = vec![sniff.unwrap_or_else(|| json!({"action": "sniff"}))];
    if has_china_set {
        out.push(json!({"rule_set": CHINA_RULE_SET, "outbound": DIRECT_OUTBOUND}));
    }
    out.extend(action_only);
    out
}

/// An `action` rule that routes nowhere (hijack-dns, reject, ...).
fn is_action_only(rule: &Value) -> bool {
    rule.get("action").and_then(Value::as_str).is_some() && rule.get("outbound").is_none()
}

fn references_rule_set(rule: &Value, tag: &str) -> bool {
    match rule.get("rule_set") {
        Some(Value::String(s)) => s == tag,
        Some(Value::Array(list)) => list.iter().any(|v| v.as_str() == Some(tag)),
        _ => false,
    }
}

fn route_declares_rule_set(tpl: &Template, tag: &str) -> bool {
    tpl.route()
        .get("rule_set")
        .and_then(Value::as_array)
        .is_some_and(|sets| sets.iter().any(|s| s.get("tag").and_then(Value::as_str) == Some(tag)))
}

/// Sorted unique `domain` and `domain_suffix` values of rules routed to `primary`.
fn proxy_domains(rules: &[Value], primary: &str) -> (Vec<String>, Vec<String>) {
    let mut domain = BTreeSet::new();
    let mut suffix = BTreeSet::new();
    let strings = |v: Option<&Value>| -> Vec<String> {
        v.and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };
    for rule in rules {
        if rule.get("outbound").and_then(Value::as_str) != Some(primary) {
            continue;
        }
        domain.extend(strings(rule.get("domain")));
        suffix.extend(strings(rule.get("domain_suffix")));
    }
    (domain.into_iter().collect(), suffix.into_iter().collect())
}

fn china_local_dns_rules() -> Vec<Value> {
    vec![
        json!({"action": "route", "domain_suffix": [".cn"], "server": LOCAL_DNS, "strategy": "ipv4_only"}),
        json!({
            "action": "route",
            "domain_suffix": [".qq.com", ".weixinbridge.com"],
            "server": LOCAL_DNS,
            "strategy": "ipv4_only"
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Template {
        Template::from_value(json!({
            "dns": {"servers": [{"tag": "local-dns"}, {"tag": "google-dns"}], "final": "x"},
            "route": {
                "rule_set": [{"type": "local", "tag": "geoip-cn", "path": "/g"}],
                "rules": [
                    {"action": "sniff"},
                    {"domain": ["a.com"], "outbound": "proxy"},
                    {"domain_suffix": [".b.com", ".a.com"], "outbound": "proxy"},
                    {"rule_set": "geoip-cn", "outbound": "direct"},
                    {"domain": ["c.com"], "outbound": "direct"},
                    {"protocol": "dns", "action": "hijack-dns"}
                ]
            },
            "outbounds": [{"type": "direct", "tag": "direct"}, {"type": "selector", "tag": "proxy", "outbounds": []}]
        }))
        .unwrap()
    }

    #[test]
    fn rule_mode_keeps_proxy_rules_then_actions() {
        let mut t = base();
        apply_routing_mode(&mut t, RoutingMode::Rule, "proxy");
        let v = t.into_value();
        let rules = v["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0], json!({"action": "sniff"}));
        assert_eq!(rules[1]["domain"], json!(["a.com"]));
        assert_eq!(rules[3]["action"], "hijack-dns");
        assert_eq!(v["route"]["final"], "direct");
        assert_eq!(v["dns"]["final"], "local-dns");
        let dns_rules = v["dns"]["rules"].as_array().unwrap();
        assert_eq!(dns_rules.len(), 4);
        assert_eq!(dns_rules[3]["domain_suffix"], json!([".a.com", ".b.com"]));
        assert_eq!(dns_rules[3]["server"], "google-dns");
        assert_eq!(v["outbounds"][0]["domain_strategy"], "ipv4_only");
    }

    #[test]
    fn global_mode_routes_china_direct() {
        let mut t = base();
        let p = apply_routing_mode(&mut t, RoutingMode::Global, "proxy");
        assert_eq!(p, AppliedPatch::RoutingMode { mode: RoutingMode::Global });
        let v = t.into_value();
        assert_eq!(
            v["route"]["rules"],
            json!([
                {"action": "sniff"},
                {"rule_set": "geoip-cn", "outbound": "direct"},
                {"protocol": "dns", "action": "hijack-dns"}
            ])
        );
        assert_eq!(v["route"]["final"], "proxy");
        assert_eq!(v["dns"]["final"], "google-dns");
        assert_eq!(v["dns"]["rules"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn global_mode_without_china_set_skips_geoip_rule() {
        let mut t = Template::from_value(json!({"route": {"rules": []}})).unwrap();
        apply_routing_mode(&mut t, RoutingMode::Global, "proxy");
        assert_eq!(t.route()["rules"], json!([{"action": "sniff"}]));
        assert!(t.as_map().get("dns").is_none());
    }
}
