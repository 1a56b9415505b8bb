//! RuleSet → engine match rules.

use super::{unique_preserving_order, RuleSet, RuleType};
use serde_json::{Map, Value};

/// The single match condition carried by a compiled rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    IpCidr(Vec<String>),
    Domain(Vec<String>),
    DomainSuffix(Vec<String>),
    DomainRegex(Vec<String>),
}

impl RuleMatch {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::IpCidr(_) => RuleType::IpCidr,
            Self::Domain(_) => RuleType::Domain,
            Self::DomainSuffix(_) => RuleType::DomainSuffix,
            Self::DomainRegex(_) => RuleType::DomainRegex,
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            Self::IpCidr(v) | Self::Domain(v) | Self::DomainSuffix(v) | Self::DomainRegex(v) => v,
        }
    }
}

/// One engine route rule: exactly one match field plus the outbound tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub matcher: RuleMatch,
    pub outbound: String,
}

impl CompiledRule {
    /// Engine JSON form, e.g. `{"domain_suffix": [".a.com"], "outbound": "proxy"}`.
    pub fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert(
            self.matcher.rule_type().field().to_string(),
            Value::from(self.matcher.values().to_vec()),
        );
        m.insert("outbound".to_string(), Value::from(self.outbound.clone()));
        Value::Object(m)
    }
}

/// Compile a rule set; every emitted rule uses `outbound_tag`.
///
/// Order is fixed: ip_cidr, domain, (exact domain for bare suffixes), domain_suffix,
/// domain_regex. Engine suffix matching without a leading dot only hits the
/// literal domain, so suffixes are emitted dot-prefixed and bare suffixes also
/// get an exact-domain rule to keep matching the apex domain.
pub fn to_engine_rules(rules: &RuleSet, outbound_tag: &str) -> Vec<CompiledRule> {
    let rule = |matcher| CompiledRule {
        matcher,
        outbound: outbound_tag.to_string(),
    };
    let mut out = Vec::with_capacity(5);

    if !rules.ip_cidr.is_empty() {
        out.push(rule(RuleMatch::IpCidr(rules.ip_cidr.clone())));
    }
    if !rules.domain.is_empty() {
        out.push(rule(RuleMatch::Domain(rules.domain.clone())));
    }
    if !rules.domain_suffix.is_empty() {
        let bare: Vec<String> = rules
            .domain_suffix
            .iter()
            .filter(|s| !s.starts_with('.'))
            .cloned()
            .collect();
        let mut dotted: Vec<String> = rules
            .domain_suffix
            .iter()
            .map(|s| {
                if s.starts_with('.') {
                    s.clone()
                } else {
                    format!(".{s}")
                }
            })
            .collect();
        // `a.com` and `.a.com` both survive normalization but share one dotted form.
        unique_preserving_order(&mut dotted);
        if !bare.is_empty() {
            tracing::debug!(
                count = bare.len(),
                outbound = outbound_tag,
                "bare domain_suffix entries also emitted as exact domain"
            );
            out.push(rule(RuleMatch::Domain(bare)));
        }
        out.push(rule(RuleMatch::DomainSuffix(dotted)));
    }
    if !rules.domain_regex.is_empty() {
        out.push(rule(RuleMatch::DomainRegex(rules.domain_regex.clone())));
    }
    out
}
