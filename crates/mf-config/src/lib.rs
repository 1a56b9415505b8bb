//! Engine configuration document logic for meshflux
//! meshflux 的引擎配置文档逻辑
//!
//! # Global Strategic Logic / 全局战略逻辑
//! This crate is the synchronous half of the orchestrator. Everything here is a
//! pure function of its inputs: no network, no engine handle, no ambient state.
//! 本 crate 是编排器的同步部分：无网络、无引擎句柄、无全局状态。
//!
//! ## Strategic Workflow / 战略工作流
//! `Base template` -> `Preferred outbound` -> (preflight, in `mf-core`) -> `Compat patches`
//! -> `Rule splice` -> `Routing mode` -> `Deterministic JSON`
//!
//! ## Key Modules / 关键模块
//! - [`rules`]: dynamic routing rule compiler. 动态路由规则编译器。
//! - [`template`]: typed view over the opaque engine document. 引擎文档视图。
//! - [`patch`]: compatibility and preference patches, each reported as [`AppliedPatch`].
//! - [`splice`]: inserting compiled rules after the sniffing stage.
//! - [`mode`]: rule/global routing mode rewrite.
//! - [`json_norm`]: stable key ordering.
//! - [`prefs`]: preferred outbound per profile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod json_norm;
pub mod mode;
pub mod patch;
pub mod prefs;
pub mod rules;
pub mod splice;
pub mod template;

pub use patch::AppliedPatch;
pub use prefs::Preferences;
pub use rules::{CompiledRule, RuleMatch, RuleSet, RuleSource, RuleType};
pub use splice::SpliceReport;
pub use template::{EgressCandidate, SelectorGroup, Template};

/// Tag of the primary egress group. Compiled rules route here.
pub const PRIMARY_OUTBOUND: &str = "proxy";
/// Tag of the bypass outbound.
pub const DIRECT_OUTBOUND: &str = "direct";

/// Routing mode applied after rule splicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Only listed destinations go through the proxy; everything else is direct.
    Rule,
    /// China destinations go direct; everything else is proxied.
    Global,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rule" => Ok(Self::Rule),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown routing mode: {other} (expected rule|global)")),
        }
    }
}

/// Forced values for the engine `log` section (debug builds and diagnostics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<bool>,
}

impl LogOverride {
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.output.is_none() && self.timestamp.is_none()
    }
}

/// Knobs for a configuration build.
/// 配置构建选项。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Outbound tag every compiled dynamic rule routes to.
    pub rule_outbound: String,
    /// Selector groups that honor the persisted preferred outbound and get preflighted.
    pub preferred_groups: Vec<String>,
    /// Stack forced on `tun` inbounds. `None` leaves inbounds untouched.
    pub forced_tun_stack: Option<String>,
    /// Remote rule-set tags that must never block startup.
    pub known_remote_rule_sets: Vec<String>,
    /// Bundled local equivalents: tag -> path.
    pub local_rule_set_assets: BTreeMap<String, PathBuf>,
    pub routing_mode: Option<RoutingMode>,
    pub log_override: Option<LogOverride>,
    /// Written to `route.final` when the template has none.
    pub default_final: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            rule_outbound: PRIMARY_OUTBOUND.to_string(),
            preferred_groups: vec![PRIMARY_OUTBOUND.to_string(), "auto".to_string()],
            forced_tun_stack: Some("system".to_string()),
            known_remote_rule_sets: vec!["geoip-cn".to_string()],
            local_rule_set_assets: BTreeMap::new(),
            routing_mode: None,
            log_override: None,
            default_final: PRIMARY_OUTBOUND.to_string(),
        }
    }
}

impl BuildOptions {
    /// Register bundled assets found as `<dir>/<tag>.srs` for every known remote tag.
    pub fn with_assets_dir(mut self, dir: &std::path::Path) -> Self {
        for tag in &self.known_remote_rule_sets {
            let path = dir.join(format!("{tag}.srs"));
            if path.is_file() {
                self.local_rule_set_assets.insert(tag.clone(), path);
            }
        }
        self
    }
}
