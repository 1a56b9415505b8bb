//! Rule source parsers (JSON object form and line-oriented text form).

use super::{RuleSet, RuleType};
use ipnet::IpNet;
use mf_types::RuleError;
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Parse the structured form.
///
/// Accepted shapes:
/// 1. `{"ip_cidr": [...], "domain": [...], "domain_suffix": [...], "domain_regex": [...]}`
/// 2. `{"proxy": { ...shape 1 or 3... }}`
/// 3. `{"rules": [{"ip_cidr": [...]}, {"domain_suffix": [...]}]}` (fields concatenated)
///
/// Each field may be a single string or a list of strings; anything else is ignored.
pub fn parse_json(text: &str) -> Result<RuleSet, RuleError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RuleError::InvalidFormat(format!("routing rules are not valid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(RuleError::InvalidFormat(
            "routing rules must be a JSON object".to_string(),
        ));
    };
    if let Some(Value::Object(inner)) = obj.remove("proxy") {
        obj = inner;
    }

    let mut rules = RuleSet::default();
    match obj.get("rules") {
        Some(Value::Array(list)) => {
            for entry in list.iter().filter_map(Value::as_object) {
                collect_fields(entry, &mut rules);
            }
        }
        _ => collect_fields(&obj, &mut rules),
    }
    Ok(rules)
}

fn collect_fields(obj: &Map<String, Value>, rules: &mut RuleSet) {
    for ty in RuleType::ALL {
        match obj.get(ty.field()) {
            Some(Value::String(s)) => rules.push(ty, s),
            Some(Value::Array(items)) => {
                for s in items.iter().filter_map(Value::as_str) {
                    rules.push(ty, s);
                }
            }
            _ => {}
        }
    }
}

/// Parse the line-oriented text form.
///
/// ```text
/// # comment
/// // comment
/// [domain_suffix]          <- section: applies to following untyped lines
/// example.com
/// ip: 10.0.0.0/8           <- explicit type, `type:value`
/// regex ^.*\.test$         <- explicit type, `type value`
/// 192.168.1.1              <- untyped, no section: auto-detected as ip_cidr
/// ```
pub fn parse_text(text: &str) -> Result<RuleSet, RuleError> {
    let mut rules = RuleSet::default();
    let mut section: Option<RuleType> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
            section = Some(RuleType::parse(&line[1..line.len() - 1])?);
            continue;
        }

        if let Some((ty, value)) = split_typed_line(line)? {
            rules.push(ty, value);
            continue;
        }

        let ty = match section {
            Some(ty) => ty,
            None if is_ip_or_cidr(line) => RuleType::IpCidr,
            // Unclassifiable lines fall back to exact domain.
            None => RuleType::Domain,
        };
        rules.push(ty, line);
    }
    Ok(rules)
}

/// Split `type:value` / `type value` at the first colon or whitespace run.
///
/// Returns `Ok(None)` for untyped lines: bare IPs/CIDRs (IPv6 contains colons),
/// lines without a separator, and lines whose head is not a type-like token
/// (`example.com:443`). A type-like head that names no rule type is an error.
fn split_typed_line(line: &str) -> Result<Option<(RuleType, &str)>, RuleError> {
    if is_ip_or_cidr(line) {
        return Ok(None);
    }
    let Some(idx) = line.find(|c: char| c == ':' || c.is_whitespace()) else {
        return Ok(None);
    };
    let head = line[..idx].trim();
    let value = line[idx + 1..].trim();
    if head.is_empty() || value.is_empty() || !looks_like_type_token(head) {
        return Ok(None);
    }
    RuleType::parse(head).map(|ty| Some((ty, value)))
}

fn looks_like_type_token(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphabetic() || c == '_' || c == '-')
}

/// True for a bare IPv4/IPv6 address or a CIDR block.
pub fn is_ip_or_cidr(s: &str) -> bool {
    if s.contains('/') {
        s.parse::<IpNet>().is_ok()
    } else {
        s.parse::<IpAddr>().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_simple_shape_accepts_string_or_list() {
        let r = parse_json(r#"{"ip_cidr":"1.1.1.1/32","domain":["a.com",""],"domain_regex":[1,"^x$"]}"#)
            .unwrap();
        assert_eq!(r.ip_cidr, vec!["1.1.1.1/32"]);
        assert_eq!(r.domain, vec!["a.com"]);
        assert_eq!(r.domain_regex, vec!["^x$"]);
    }

    #[test]
    fn json_proxy_wrapper() {
        let r = parse_json(r#"{"proxy":{"domain_suffix":["x.com"]}}"#).unwrap();
        assert_eq!(r.domain_suffix, vec!["x.com"]);
    }

    #[test]
    fn json_rules_list_concatenates() {
        let r = parse_json(
            r#"{"rules":[{"domain_suffix":["a.com"]},{"domain_suffix":["b.com"],"ip_cidr":["10.0.0.0/8"]}]}"#,
        )
        .unwrap();
        assert_eq!(r.domain_suffix, vec!["a.com", "b.com"]);
        assert_eq!(r.ip_cidr, vec!["10.0.0.0/8"]);
    }

    #[test]
    fn json_proxy_wrapping_rules_list() {
        let r = parse_json(r#"{"proxy":{"rules":[{"domain":["a.com"]}]}}"#).unwrap();
        assert_eq!(r.domain, vec!["a.com"]);
    }

    #[test]
    fn json_errors_are_invalid_format() {
        assert!(matches!(parse_json("{not json"), Err(RuleError::InvalidFormat(_))));
        let err = parse_json("[1,2]").unwrap_err();
        assert_eq!(
            err,
            RuleError::InvalidFormat("routing rules must be a JSON object".into())
        );
    }

    #[test]
    fn text_typed_lines_both_separators() {
        let r = parse_text("suffix: example.com\ndomain_suffix example.org\n").unwrap();
        assert_eq!(r.domain_suffix, vec!["example.com", "example.org"]);
    }

    #[test]
    fn text_comments_and_blank_lines() {
        let r = parse_text("# c\n\n// c2\n   \nexample.com\n").unwrap();
        assert_eq!(r.domain, vec!["example.com"]);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn text_sections_apply_until_next_header() {
        let text = "[suffix]\na.com\nb.com\n[regex]\n^c$\n";
        let r = parse_text(text).unwrap();
        assert_eq!(r.domain_suffix, vec!["a.com", "b.com"]);
        assert_eq!(r.domain_regex, vec!["^c$"]);
    }

    #[test]
    fn text_explicit_type_beats_section() {
        let r = parse_text("[suffix]\nip: 10.0.0.0/8\nx.com\n").unwrap();
        assert_eq!(r.ip_cidr, vec!["10.0.0.0/8"]);
        assert_eq!(r.domain_suffix, vec!["x.com"]);
    }

    #[test]
    fn text_auto_detects_ip_and_cidr() {
        let r = parse_text("192.168.1.1\n10.0.0.0/8\n2001:db8::1\n2001:db8::/32\nexample.com\n")
            .unwrap();
        assert_eq!(
            r.ip_cidr,
            vec!["192.168.1.1", "10.0.0.0/8", "2001:db8::1", "2001:db8::/32"]
        );
        assert_eq!(r.domain, vec!["example.com"]);
    }

    #[test]
    fn text_unknown_type_token_is_error() {
        let err = parse_text("weird:1.2.3.4").unwrap_err();
        assert_eq!(err, RuleError::InvalidRuleType("weird".into()));
        let err = parse_text("[nope]\na.com").unwrap_err();
        assert_eq!(err, RuleError::InvalidRuleType("nope".into()));
    }

    #[test]
    fn text_regex_keeps_colons_in_value() {
        let r = parse_text("regex:^api:[0-9]+$\nregex ^a:b$").unwrap();
        assert_eq!(r.domain_regex, vec!["^api:[0-9]+$", "^a:b$"]);
    }

    #[test]
    fn text_host_port_is_untyped_domain() {
        let r = parse_text("example.com:443").unwrap();
        assert_eq!(r.domain, vec!["example.com:443"]);
    }

    #[test]
    fn ip_detection() {
        assert!(is_ip_or_cidr("1.2.3.4"));
        assert!(is_ip_or_cidr("::1"));
        assert!(is_ip_or_cidr("10.0.0.0/8"));
        assert!(!is_ip_or_cidr("10.0.0.0/40"));
        assert!(!is_ip_or_cidr("example.com"));
    }
}
