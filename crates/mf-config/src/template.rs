//! Typed access to the opaque engine configuration document.
//!
//! Only the sub-paths the orchestrator touches get accessors; everything else
//! passes through untouched.

use mf_types::OrchestratorError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Outbound type that carries a candidate list and a `default`.
pub const SELECTOR_TYPE: &str = "selector";

/// A selector outbound: `{type: selector, tag, outbounds: [...], default}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorGroup {
    pub tag: String,
    pub candidates: Vec<String>,
    pub default: Option<String>,
}

impl SelectorGroup {
    /// The tag the engine would select: explicit `default`, else the first candidate.
    pub fn current_default(&self) -> Option<&str> {
        self.default
            .as_deref()
            .or_else(|| self.candidates.first().map(String::as_str))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.candidates.iter().any(|c| c == tag)
    }
}

/// An outbound that can be probed. `server`/`server_port` are absent for
/// outbounds without a single remote endpoint (groups, direct, block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EgressCandidate {
    pub tag: String,
    pub server: Option<String>,
    pub server_port: Option<u16>,
}

impl EgressCandidate {
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match (&self.server, self.server_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some((host.as_str(), port)),
            _ => None,
        }
    }
}

/// Mutable engine document whose root is an object with a `route` object.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    doc: Map<String, Value>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, OrchestratorError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OrchestratorError::TemplateInvalid(format!("not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, OrchestratorError> {
        let Value::Object(doc) = value else {
            return Err(OrchestratorError::TemplateInvalid(
                "base config template is not a JSON object".into(),
            ));
        };
        match doc.get("route") {
            Some(Value::Object(_)) => Ok(Self { doc }),
            Some(_) => Err(OrchestratorError::TemplateInvalid(
                "`route` section is not an object".into(),
            )),
            None => Err(OrchestratorError::TemplateInvalid(
                "base config missing route section".into(),
            )),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.doc
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.doc)
    }

    pub fn route(&self) -> &Map<String, Value> {
        match self.doc.get("route") {
            Some(Value::Object(r)) => r,
            _ => unreachable!("route presence is checked at construction"),
        }
    }

    pub fn route_mut(&mut self) -> &mut Map<String, Value> {
        match self.doc.get_mut("route") {
            Some(Value::Object(r)) => r,
            _ => unreachable!("route presence is checked at construction"),
        }
    }

    /// `route.rules`, created as an empty list when missing or not a list.
    pub fn route_rules_mut(&mut self) -> &mut Vec<Value> {
        let route = self.route_mut();
        if !matches!(route.get("rules"), Some(Value::Array(_))) {
            route.insert("rules".into(), Value::Array(Vec::new()));
        }
        match route.get_mut("rules") {
            Some(Value::Array(rules)) => rules,
            _ => unreachable!("rules list inserted above"),
        }
    }

    /// Top-level section as an object, created when missing or of the wrong type.
    pub fn section_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        if !matches!(self.doc.get(key), Some(Value::Object(_))) {
            self.doc.insert(key.into(), Value::Object(Map::new()));
        }
        match self.doc.get_mut(key) {
            Some(Value::Object(m)) => m,
            _ => unreachable!("section inserted above"),
        }
    }

    /// Existing top-level object section, if any.
    pub fn existing_section_mut(&mut self, key: &str) -> Option<&mut Map<String, Value>> {
        self.doc.get_mut(key).and_then(Value::as_object_mut)
    }

    pub fn inbounds_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.doc.get_mut("inbounds").and_then(Value::as_array_mut)
    }

    pub fn outbounds(&self) -> &[Value] {
        self.doc
            .get("outbounds")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn outbounds_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.doc.get_mut("outbounds").and_then(Value::as_array_mut)
    }

    /// All selector-type outbounds, in document order.
    pub fn selector_groups(&self) -> Vec<SelectorGroup> {
        self.outbounds()
            .iter()
            .filter_map(Value::as_object)
            .filter(|o| o.get("type").and_then(Value::as_str) == Some(SELECTOR_TYPE))
            .filter_map(|o| {
                let tag = o.get("tag")?.as_str()?.to_string();
                let candidates = o
                    .get("outbounds")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let default = o.get("default").and_then(Value::as_str).map(str::to_string);
                Some(SelectorGroup {
                    tag,
                    candidates,
                    default,
                })
            })
            .collect()
    }

    pub fn selector_group(&self, tag: &str) -> Option<SelectorGroup> {
        self.selector_groups().into_iter().find(|g| g.tag == tag)
    }

    /// Endpoint view of the outbound tagged `tag`. Unknown tags yield a
    /// candidate without endpoint.
    pub fn candidate(&self, tag: &str) -> EgressCandidate {
        let found = self
            .outbounds()
            .iter()
            .filter_map(Value::as_object)
            .find(|o| o.get("tag").and_then(Value::as_str) == Some(tag));
        EgressCandidate {
            tag: tag.to_string(),
            server: found
                .and_then(|o| o.get("server"))
                .and_then(Value::as_str)
                .map(str::to_string),
            server_port: found
                .and_then(|o| o.get("server_port"))
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
        }
    }

    pub fn candidates_of(&self, group: &SelectorGroup) -> Vec<EgressCandidate> {
        group.candidates.iter().map(|t| self.candidate(t)).collect()
    }

    /// Set `default` on the selector `group_tag`. Returns the previous default
    /// when the group exists.
    pub fn set_selector_default(&mut self, group_tag: &str, tag: &str) -> Option<Option<String>> {
        let outbound = self
            .outbounds_mut()?
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|o| {
                o.get("type").and_then(Value::as_str) == Some(SELECTOR_TYPE)
                    && o.get("tag").and_then(Value::as_str) == Some(group_tag)
            })?;
        let previous = outbound
            .insert("default".into(), Value::from(tag))
            .and_then(|v| v.as_str().map(str::to_string));
        Some(previous)
    }
}
