//! Dynamic routing rules.
//! 动态路由规则
//!
//! Rule sources (structured JSON or line-oriented text) are parsed into a
//! [`RuleSet`] and compiled into engine match rules that all point at one
//! outbound tag.
//!
//! `Raw rule source` -> `parse` -> `normalize (dedup, keep order)` -> `compile`

mod compile;
mod parse;

use mf_types::RuleError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub use compile::{CompiledRule, RuleMatch};
pub use parse::{is_ip_or_cidr, parse_json, parse_text};

/// File names looked up in the shared data directory, in priority order.
pub const RULES_JSON_FILE: &str = "routing_rules.json";
pub const RULES_TEXT_FILE: &str = "routing_rules.txt";

/// The four dynamic rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    IpCidr,
    Domain,
    DomainSuffix,
    DomainRegex,
}

impl RuleType {
    /// Normalize a type token (`ip`, `cidr`, `domain_suffix`, `regex`, ...).
    pub fn parse(token: &str) -> Result<Self, RuleError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "ip" | "cidr" | "ip_cidr" | "ip-cidr" => Ok(Self::IpCidr),
            "domain" => Ok(Self::Domain),
            "suffix" | "domain_suffix" | "domain-suffix" => Ok(Self::DomainSuffix),
            "regex" | "domain_regex" | "domain-regex" => Ok(Self::DomainRegex),
            _ => Err(RuleError::InvalidRuleType(token.trim().to_string())),
        }
    }

    /// Engine field name for this kind.
    pub fn field(&self) -> &'static str {
        match self {
            Self::IpCidr => "ip_cidr",
            Self::Domain => "domain",
            Self::DomainSuffix => "domain_suffix",
            Self::DomainRegex => "domain_regex",
        }
    }

    pub const ALL: [RuleType; 4] = [
        RuleType::IpCidr,
        RuleType::Domain,
        RuleType::DomainSuffix,
        RuleType::DomainRegex,
    ];
}

/// Normalized collection of dynamic routing directives.
///
/// After [`RuleSet::normalize`] no field holds duplicates and every field keeps
/// first-seen order, so generated rules are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub ip_cidr: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_regex: Vec<String>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.ip_cidr.is_empty()
            && self.domain.is_empty()
            && self.domain_suffix.is_empty()
            && self.domain_regex.is_empty()
    }

    /// Total number of entries across all fields.
    pub fn len(&self) -> usize {
        self.ip_cidr.len() + self.domain.len() + self.domain_suffix.len() + self.domain_regex.len()
    }

    pub fn field(&self, ty: RuleType) -> &[String] {
        match ty {
            RuleType::IpCidr => &self.ip_cidr,
            RuleType::Domain => &self.domain,
            RuleType::DomainSuffix => &self.domain_suffix,
            RuleType::DomainRegex => &self.domain_regex,
        }
    }

    fn field_mut(&mut self, ty: RuleType) -> &mut Vec<String> {
        match ty {
            RuleType::IpCidr => &mut self.ip_cidr,
            RuleType::Domain => &mut self.domain,
            RuleType::DomainSuffix => &mut self.domain_suffix,
            RuleType::DomainRegex => &mut self.domain_regex,
        }
    }

    /// Append a trimmed value; empty values are dropped.
    pub fn push(&mut self, ty: RuleType, value: &str) {
        let v = value.trim();
        if !v.is_empty() {
            self.field_mut(ty).push(v.to_string());
        }
    }

    /// Deduplicate every field, keeping the first occurrence.
    pub fn normalize(&mut self) {
        for ty in RuleType::ALL {
            unique_preserving_order(self.field_mut(ty));
        }
    }

    /// Compile into engine match rules. See [`compile::to_engine_rules`].
    pub fn to_engine_rules(&self, outbound_tag: &str) -> Vec<CompiledRule> {
        compile::to_engine_rules(self, outbound_tag)
    }
}

fn unique_preserving_order(values: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(values.len());
    values.retain(|v| seen.insert(v.clone()));
}

/// Where a rule set comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Structured object form (`ip_cidr`/`domain`/..., `proxy` wrapper, or `rules` list).
    Json(String),
    /// Line-oriented text form.
    Text(String),
}

impl RuleSource {
    /// Pick the format from a file extension (`.json` → JSON, anything else → text).
    pub fn from_path_and_content(path: &Path, content: String) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json(content),
            _ => Self::Text(content),
        }
    }
}

/// Parse and normalize a rule source.
pub fn compile(source: &RuleSource) -> Result<RuleSet, RuleError> {
    let mut rules = match source {
        RuleSource::Json(text) => parse_json(text)?,
        RuleSource::Text(text) => parse_text(text)?,
    };
    rules.normalize();
    tracing::debug!(
        ip_cidr = rules.ip_cidr.len(),
        domain = rules.domain.len(),
        domain_suffix = rules.domain_suffix.len(),
        domain_regex = rules.domain_regex.len(),
        "dynamic rules compiled"
    );
    Ok(rules)
}

/// Locate the rule file in `dir`: JSON wins over text.
pub fn locate_rules_file(dir: &Path) -> Option<PathBuf> {
    [RULES_JSON_FILE, RULES_TEXT_FILE]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Load rules from the shared directory. No rule file yields an empty set.
pub fn load_rules(dir: &Path) -> Result<(RuleSet, Option<PathBuf>), RuleError> {
    let Some(path) = locate_rules_file(dir) else {
        return Ok((RuleSet::default(), None));
    };
    let content = std::fs::read_to_string(&path).map_err(|e| {
        RuleError::InvalidFormat(format!("read {}: {e}", path.display()))
    })?;
    let source = RuleSource::from_path_and_content(&path, content);
    let rules = compile(&source)?;
    Ok((rules, Some(path)))
}
