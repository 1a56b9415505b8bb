//! Preference and compatibility patches.
//! 偏好与兼容性补丁
//!
//! Each patch mutates the [`Template`] and reports what it did as an
//! [`AppliedPatch`], so degradations are visible to callers and tests instead
//! of being silent document edits.

use crate::template::Template;
use crate::{LogOverride, RoutingMode};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One mutation applied while building the engine document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "patch", rename_all = "snake_case")]
pub enum AppliedPatch {
    /// Persisted preferred outbound applied to a selector group.
    PreferredOutbound { group: String, outbound: String },
    /// Preflight replaced an unreachable default.
    DefaultRepaired {
        group: String,
        from: Option<String>,
        to: String,
        rtt_ms: u64,
    },
    /// A tun inbound's stack was forced to the guaranteed-available one.
    TunStackForced {
        inbound: Option<String>,
        from: Option<String>,
        to: String,
    },
    /// A remote rule-set now points at a bundled local file.
    RuleSetLocalized { tag: String, path: PathBuf },
    /// A remote rule-set without local equivalent was dropped, together with
    /// the inbound exclusion references and route rules pointing at it.
    RuleSetRemoved {
        tag: String,
        exclusions_stripped: usize,
        rules_dropped: usize,
    },
    /// `route.final` was absent and got the default outbound.
    FinalDefaulted { outbound: String },
    LogOverridden,
    RoutingMode { mode: RoutingMode },
}

impl AppliedPatch {
    /// Patches that change routing behavior relative to the template.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Self::DefaultRepaired { .. } | Self::TunStackForced { .. } | Self::RuleSetRemoved { .. }
        )
    }

    /// Log at `warn` for degradations, `info` otherwise.
    pub fn log(&self) {
        if self.is_degradation() {
            tracing::warn!(patch = %self, "degraded engine config");
        } else {
            tracing::info!(patch = %self, "patched engine config");
        }
    }
}

impl fmt::Display for AppliedPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreferredOutbound { group, outbound } => {
                write!(f, "selector `{group}` default set to preferred `{outbound}`")
            }
            Self::DefaultRepaired {
                group,
                from,
                to,
                rtt_ms,
            } => write!(
                f,
                "selector `{group}` default `{}` unreachable, repaired to `{to}` ({rtt_ms} ms)",
                from.as_deref().unwrap_or("-")
            ),
            Self::TunStackForced { inbound, from, to } => write!(
                f,
                "tun inbound `{}` stack `{}` forced to `{to}`",
                inbound.as_deref().unwrap_or("-"),
                from.as_deref().unwrap_or("-")
            ),
            Self::RuleSetLocalized { tag, path } => {
                write!(f, "rule-set `{tag}` uses bundled {}", path.display())
            }
            Self::RuleSetRemoved {
                tag,
                exclusions_stripped,
                rules_dropped,
            } => write!(
                f,
                "remote rule-set `{tag}` removed ({exclusions_stripped} inbound exclusion refs stripped, {rules_dropped} route rules dropped)"
            ),
            Self::FinalDefaulted { outbound } => write!(f, "route.final defaulted to `{outbound}`"),
            Self::LogOverridden => f.write_str("log section overridden"),
            Self::RoutingMode { mode } => write!(f, "routing mode `{mode}` applied"),
        }
    }
}

/// Point allow-listed selector groups at the persisted preferred outbound when
/// it is one of their candidates.
pub fn apply_preferred_outbound(
    tpl: &mut Template,
    groups: &[String],
    preferred: Option<&str>,
) -> Vec<AppliedPatch> {
    let Some(preferred) = preferred.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let targets: Vec<String> = tpl
        .selector_groups()
        .into_iter()
        .filter(|g| groups.contains(&g.tag) && g.contains(preferred))
        .map(|g| g.tag)
        .collect();

    let mut applied = Vec::new();
    for group in targets {
        if tpl.set_selector_default(&group, preferred).is_some() {
            applied.push(AppliedPatch::PreferredOutbound {
                group,
                outbound: preferred.to_string(),
            });
        }
    }
    applied
}

/// Force every `tun` inbound onto `stack`. Never fails.
pub fn force_tun_stack(tpl: &mut Template, stack: &str) -> Vec<AppliedPatch> {
    let Some(inbounds) = tpl.inbounds_mut() else {
        return Vec::new();
    };
    let mut applied = Vec::new();
    for inbound in inbounds.iter_mut().filter_map(Value::as_object_mut) {
        if inbound.get("type").and_then(Value::as_str) != Some("tun") {
            continue;
        }
        let from = inbound.get("stack").and_then(Value::as_str).map(str::to_string);
        if from.as_deref() == Some(stack) {
            continue;
        }
        inbound.insert("stack".into(), Value::from(stack));
        applied.push(AppliedPatch::TunStackForced {
            inbound: inbound.get("tag").and_then(Value::as_str).map(str::to_string),
            from,
            to: stack.to_string(),
        });
    }
    applied
}

/// Replace known remote rule-sets with bundled local files, or drop them.
///
/// Dropping also strips the tag from every inbound `route_exclude_address_set`
/// and every top-level `route.rules` entry's `rule_set`. An emptied exclusion
/// list is removed; a route rule left with no rule-set is dropped.
pub fn fallback_remote_rule_sets(
    tpl: &mut Template,
    known: &[String],
    assets: &BTreeMap<String, PathBuf>,
) -> Vec<AppliedPatch> {
    let mut applied = Vec::new();
    let mut removed = Vec::new();

    if let Some(rule_sets) = tpl
        .route_mut()
        .get_mut("rule_set")
        .and_then(Value::as_array_mut)
    {
        for tag in known {
            let Some(idx) = rule_sets.iter().position(|rs| is_remote_rule_set(rs, tag)) else {
                continue;
            };
            match assets.get(tag) {
                Some(path) => {
                    rule_sets[idx] = json!({
                        "type": "local",
                        "tag": tag,
                        "format": "binary",
                        "path": path.to_string_lossy(),
                    });
                    applied.push(AppliedPatch::RuleSetLocalized {
                        tag: tag.clone(),
                        path: path.clone(),
                    });
                }
                None => {
                    rule_sets.remove(idx);
                    removed.push(tag.clone());
                }
            }
        }
    }

    for tag in removed {
        let exclusions_stripped = strip_exclusion_refs(tpl, &tag);
        let rules_dropped = drop_route_rule_refs(tpl, &tag);
        applied.push(AppliedPatch::RuleSetRemoved {
            tag,
            exclusions_stripped,
            rules_dropped,
        });
    }
    applied
}

fn is_remote_rule_set(rs: &Value, tag: &str) -> bool {
    rs.get("tag").and_then(Value::as_str) == Some(tag)
        && rs.get("type").and_then(Value::as_str) == Some("remote")
}

fn strip_exclusion_refs(tpl: &mut Template, tag: &str) -> usize {
    let Some(inbounds) = tpl.inbounds_mut() else {
        return 0;
    };
    let mut stripped = 0;
    for inbound in inbounds.iter_mut().filter_map(Value::as_object_mut) {
        let Some(refs) = inbound.get_mut("route_exclude_address_set") else {
            continue;
        };
        let (removed, emptied) = remove_tag_ref(refs, tag);
        stripped += removed;
        if emptied {
            inbound.remove("route_exclude_address_set");
        }
    }
    stripped
}

fn drop_route_rule_refs(tpl: &mut Template, tag: &str) -> usize {
    let Some(rules) = tpl.route_mut().get_mut("rules").and_then(Value::as_array_mut) else {
        return 0;
    };
    let before = rules.len();
    rules.retain_mut(|rule| {
        let Some(refs) = rule.get_mut("rule_set") else {
            return true;
        };
        let (_, emptied) = remove_tag_ref(refs, tag);
        !emptied
    });
    let dropped = before - rules.len();
    if dropped > 0 {
        tracing::debug!(tag, dropped, "route rules referencing removed rule-set dropped");
    }
    dropped
}

/// Remove `tag` from a tag reference written as a string or a list of strings.
/// Returns how many entries matched and whether nothing is left.
fn remove_tag_ref(refs: &mut Value, tag: &str) -> (usize, bool) {
    match refs {
        Value::String(s) if s.as_str() == tag => (1, true),
        Value::Array(list) => {
            let before = list.len();
            list.retain(|v| v.as_str() != Some(tag));
            let removed = before - list.len();
            (removed, removed > 0 && list.is_empty())
        }
        _ => (0, false),
    }
}

/// Write `route.final` when the template leaves it unset.
pub fn ensure_final(tpl: &mut Template, default_final: &str) -> Option<AppliedPatch> {
    let route = tpl.route_mut();
    if route.get("final").and_then(Value::as_str).is_some() {
        return None;
    }
    route.insert("final".into(), Value::from(default_final));
    Some(AppliedPatch::FinalDefaulted {
        outbound: default_final.to_string(),
    })
}

/// Merge forced values into the `log` section.
pub fn apply_log_override(tpl: &mut Template, ov: &LogOverride) -> Option<AppliedPatch> {
    if ov.is_empty() {
        return None;
    }
    let log = tpl.section_mut("log");
    if let Some(level) = &ov.level {
        log.insert("level".into(), Value::from(level.as_str()));
    }
    if let Some(output) = &ov.output {
        log.insert("output".into(), Value::from(output.as_str()));
    }
    if let Some(ts) = ov.timestamp {
        log.insert("timestamp".into(), Value::from(ts));
    }
    Some(AppliedPatch::LogOverridden)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpl(v: Value) -> Template {
        Template::from_value(v).unwrap()
    }

    fn groups() -> Vec<String> {
        vec!["proxy".into(), "auto".into()]
    }

    #[test]
    fn preferred_outbound_applies_to_allow_listed_selectors() {
        let mut t = tpl(json!({
            "route": {},
            "outbounds": [
                {"type": "selector", "tag": "proxy", "outbounds": ["a", "b"], "default": "a"},
                {"type": "selector", "tag": "other", "outbounds": ["a", "b"], "default": "a"}
            ]
        }));
        let applied = apply_preferred_outbound(&mut t, &groups(), Some("b"));
        assert_eq!(applied.len(), 1);
        assert_eq!(t.selector_group("proxy").unwrap().default.as_deref(), Some("b"));
        assert_eq!(t.selector_group("other").unwrap().default.as_deref(), Some("a"));
    }

    #[test]
    fn preferred_outbound_not_in_candidates_is_noop() {
        let mut t = tpl(json!({
            "route": {},
            "outbounds": [{"type": "selector", "tag": "proxy", "outbounds": ["a"], "default": "a"}]
        }));
        assert!(apply_preferred_outbound(&mut t, &groups(), Some("zzz")).is_empty());
        assert!(apply_preferred_outbound(&mut t, &groups(), None).is_empty());
        assert_eq!(t.selector_group("proxy").unwrap().default.as_deref(), Some("a"));
    }

    #[test]
    fn tun_stack_forced_only_when_different() {
        let mut t = tpl(json!({
            "route": {},
            "inbounds": [
                {"type": "tun", "tag": "tun-in", "stack": "gvisor"},
                {"type": "tun", "tag": "tun-2", "stack": "system"},
                {"type": "mixed", "tag": "mixed-in", "stack": "gvisor"}
            ]
        }));
        let applied = force_tun_stack(&mut t, "system");
        assert_eq!(
            applied,
            vec![AppliedPatch::TunStackForced {
                inbound: Some("tun-in".into()),
                from: Some("gvisor".into()),
                to: "system".into()
            }]
        );
        assert!(applied[0].is_degradation());
        let v = t.into_value();
        assert_eq!(v["inbounds"][0]["stack"], "system");
        assert_eq!(v["inbounds"][2]["stack"], "gvisor");
    }

    fn geoip_template() -> Template {
        tpl(json!({
            "route": {"rule_set": [
                {"type": "remote", "tag": "geoip-cn", "format": "binary", "url": "https://x/geoip-cn.srs"},
                {"type": "local", "tag": "mine", "path": "/x"}
            ]},
            "inbounds": [{"type": "tun", "route_exclude_address_set": ["geoip-cn"]}]
        }))
    }

    #[test]
    fn remote_rule_set_localized_when_asset_bundled() {
        let mut t = geoip_template();
        let mut assets = BTreeMap::new();
        assets.insert("geoip-cn".to_string(), PathBuf::from("/assets/geoip-cn.srs"));
        let applied = fallback_remote_rule_sets(&mut t, &["geoip-cn".into()], &assets);
        assert!(matches!(applied[0], AppliedPatch::RuleSetLocalized { .. }));
        let v = t.into_value();
        assert_eq!(
            v["route"]["rule_set"][0],
            json!({"type": "local", "tag": "geoip-cn", "format": "binary", "path": "/assets/geoip-cn.srs"})
        );
        assert_eq!(v["inbounds"][0]["route_exclude_address_set"], json!(["geoip-cn"]));
    }

    #[test]
    fn remote_rule_set_removed_with_exclusion_refs() {
        let mut t = geoip_template();
        let applied = fallback_remote_rule_sets(&mut t, &["geoip-cn".into()], &BTreeMap::new());
        assert_eq!(
            applied,
            vec![AppliedPatch::RuleSetRemoved {
                tag: "geoip-cn".into(),
                exclusions_stripped: 1,
                rules_dropped: 0
            }]
        );
        let v = t.into_value();
        assert_eq!(v["route"]["rule_set"].as_array().unwrap().len(), 1);
        assert!(v["inbounds"][0].get("route_exclude_address_set").is_none());
    }

    #[test]
    fn removed_rule_set_drops_route_rules_and_string_refs() {
        let mut t = tpl(json!({
            "route": {
                "rule_set": [
                    {"type": "remote", "tag": "geoip-cn", "format": "binary", "url": "https://x/geoip-cn.srs"},
                    {"type": "local", "tag": "mine", "path": "/x"}
                ],
                "rules": [
                    {"action": "sniff"},
                    {"rule_set": "geoip-cn", "outbound": "direct"},
                    {"rule_set": ["geoip-cn", "mine"], "outbound": "direct"},
                    {"rule_set": ["mine"], "outbound": "proxy"}
                ]
            },
            "inbounds": [
                {"type": "tun", "route_exclude_address_set": "geoip-cn"},
                {"type": "tun", "route_exclude_address_set": "mine"}
            ]
        }));
        let applied = fallback_remote_rule_sets(&mut t, &["geoip-cn".into()], &BTreeMap::new());
        assert_eq!(
            applied,
            vec![AppliedPatch::RuleSetRemoved {
                tag: "geoip-cn".into(),
                exclusions_stripped: 1,
                rules_dropped: 1
            }]
        );
        let v = t.into_value();
        assert_eq!(
            v["route"]["rules"],
            json!([
                {"action": "sniff"},
                {"rule_set": ["mine"], "outbound": "direct"},
                {"rule_set": ["mine"], "outbound": "proxy"}
            ])
        );
        assert!(v["inbounds"][0].get("route_exclude_address_set").is_none());
        assert_eq!(v["inbounds"][1]["route_exclude_address_set"], "mine");
    }

    #[test]
    fn final_defaulted_only_when_absent() {
        let mut t = tpl(json!({"route": {}}));
        assert!(ensure_final(&mut t, "proxy").is_some());
        assert!(ensure_final(&mut t, "direct").is_none());
        assert_eq!(t.route()["final"], "proxy");
    }

    #[test]
    fn log_override_merges_fields() {
        let mut t = tpl(json!({"route": {}, "log": {"level": "info", "disabled": false}}));
        let ov = LogOverride {
            level: Some("debug".into()),
            output: None,
            timestamp: Some(true),
        };
        assert_eq!(apply_log_override(&mut t, &ov), Some(AppliedPatch::LogOverridden));
        let v = t.into_value();
        assert_eq!(v["log"], json!({"level": "debug", "disabled": false, "timestamp": true}));
    }

    #[test]
    fn patch_serializes_with_tag() {
        let p = AppliedPatch::FinalDefaulted {
            outbound: "proxy".into(),
        };
        assert_eq!(
            serde_json::to_value(&p).unwrap(),
            json!({"patch": "final_defaulted", "outbound": "proxy"})
        );
    }
}
