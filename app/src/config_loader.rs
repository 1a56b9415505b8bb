//! Shared data directory: template, rules, preferences and bundled assets.
//! 共享数据目录
//!
//! ```text
//! <dir>/singbox_config.json      base template (required)
//! <dir>/routing_rules.json       dynamic rules, preferred over .txt
//! <dir>/routing_rules.txt
//! <dir>/preferences.json         preferred outbound per profile
//! <dir>/assets/<tag>.srs         bundled rule sets
//! <cache>/generated_config.json  last generated document
//! ```

use async_trait::async_trait;
use mf_config::prefs::PREFERENCES_FILE;
use mf_config::rules::{self, RULES_JSON_FILE, RULES_TEXT_FILE};
use mf_config::{BuildOptions, Preferences, RoutingMode, RuleSet};
use mf_core::{
    BuildInput, BuildReason, BuiltConfig, ConfigOrchestrator, ConfigProvider, Preflight,
    PreflightConfig,
};
use mf_types::{OrchestratorError, RuleError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub const TEMPLATE_FILE: &str = "singbox_config.json";
pub const ASSETS_DIR: &str = "assets";
pub const CACHE_DIR: &str = "cache";
pub const GENERATED_FILE: &str = "generated_config.json";

/// On-disk rule formats accepted from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesFormat {
    Json,
    Text,
}

impl RulesFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Json => RULES_JSON_FILE,
            Self::Text => RULES_TEXT_FILE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedDir {
    root: PathBuf,
    cache: PathBuf,
}

impl SharedDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cache = root.join(CACHE_DIR);
        Self { root, cache }
    }

    pub fn with_cache(mut self, cache: impl Into<PathBuf>) -> Self {
        self.cache = cache.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_path(&self) -> PathBuf {
        self.root.join(TEMPLATE_FILE)
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.root.join(PREFERENCES_FILE)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join(ASSETS_DIR)
    }

    pub fn generated_path(&self) -> PathBuf {
        self.cache.join(GENERATED_FILE)
    }

    pub fn read_template(&self) -> Result<String, OrchestratorError> {
        let path = self.template_path();
        std::fs::read_to_string(&path)
            .map_err(|e| OrchestratorError::TemplateInvalid(format!("read {}: {e}", path.display())))
    }

    pub fn load_rules(&self) -> Result<RuleSet, RuleError> {
        let (rules, path) = rules::load_rules(&self.root)?;
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), rules = rules.len(), "dynamic rules loaded");
        }
        Ok(rules)
    }

    /// A broken preference file is ignored, not fatal.
    pub fn load_preferences(&self) -> Preferences {
        let path = self.preferences_path();
        Preferences::load(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable preferences");
            Preferences::default()
        })
    }

    pub fn build_options(&self, mode: Option<RoutingMode>) -> BuildOptions {
        BuildOptions {
            routing_mode: mode,
            ..BuildOptions::default()
        }
        .with_assets_dir(&self.assets_dir())
    }

    /// Orchestrator for this directory, snapshotting into the cache dir.
    pub fn orchestrator(
        &self,
        mode: Option<RoutingMode>,
        preflight: PreflightConfig,
    ) -> ConfigOrchestrator {
        ConfigOrchestrator::new(self.build_options(mode), Preflight::tcp(preflight))
            .with_snapshot(self.generated_path())
    }

    /// Replace the rule file atomically. The file of the other format is
    /// removed so the new content is the one picked up.
    pub fn write_rules(&self, format: RulesFormat, content: &str) -> io::Result<PathBuf> {
        let target = self.root.join(format.file_name());
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &target)?;
        let other = match format {
            RulesFormat::Json => RulesFormat::Text,
            RulesFormat::Text => RulesFormat::Json,
        };
        let other = self.root.join(other.file_name());
        if other.is_file() {
            std::fs::remove_file(&other)?;
        }
        Ok(target)
    }
}

/// Builds from the shared directory on every call; nothing is cached.
pub struct SharedDirProvider {
    dir: SharedDir,
    orchestrator: ConfigOrchestrator,
    profile_id: Option<String>,
    rules_override: Mutex<Option<RuleSet>>,
}

impl SharedDirProvider {
    pub fn new(dir: SharedDir, orchestrator: ConfigOrchestrator, profile_id: Option<String>) -> Self {
        Self {
            dir,
            orchestrator,
            profile_id,
            rules_override: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &SharedDir {
        &self.dir
    }

    /// Rules that take precedence over the rule files until cleared.
    pub fn set_rules_override(&self, rules: Option<RuleSet>) {
        *self.rules_override.lock() = rules;
    }

    pub async fn build_with(&self, run_preflight: bool) -> Result<BuiltConfig, OrchestratorError> {
        let template = self.dir.read_template()?;
        let injected = self.rules_override.lock().clone();
        let rules = match injected {
            Some(rules) => rules,
            None => self.dir.load_rules()?,
        };
        let preferences = self.dir.load_preferences();
        self.orchestrator
            .build(BuildInput {
                template: &template,
                rules: &rules,
                preferences: &preferences,
                profile_id: self.profile_id.as_deref(),
                run_preflight,
            })
            .await
    }

    /// Record a repaired default as the profile's preferred outbound.
    fn persist_repair(&self, built: &BuiltConfig) {
        let Some(profile) = self.profile_id.as_deref() else {
            return;
        };
        let groups = &self.orchestrator.options().preferred_groups;
        let Some((group, selected)) = built.repairs().find(|(g, _)| groups.iter().any(|p| p == g))
        else {
            return;
        };
        let path = self.dir.preferences_path();
        let mut prefs = self.dir.load_preferences();
        if prefs.get(profile) == Some(selected) {
            return;
        }
        prefs.set(profile, selected);
        match prefs.save(&path) {
            Ok(()) => tracing::info!(profile, group, outbound = selected, "preferred outbound updated"),
            Err(e) => tracing::warn!(profile, error = %e, "failed to persist preferred outbound"),
        }
    }
}

#[async_trait]
impl ConfigProvider for SharedDirProvider {
    async fn build(&self, reason: BuildReason) -> Result<BuiltConfig, OrchestratorError> {
        self.build_with(reason == BuildReason::Start).await
    }

    fn applied(&self, built: &BuiltConfig) {
        self.persist_repair(built);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> String {
        json!({
            "outbounds": [
                {"type": "selector", "tag": "proxy", "outbounds": ["a", "b"], "default": "a"},
                {"type": "shadowsocks", "tag": "a", "server": "127.0.0.1", "server_port": 1},
                {"type": "shadowsocks", "tag": "b", "server": "127.0.0.1", "server_port": 2},
                {"type": "direct", "tag": "direct"}
            ],
            "route": {"rules": []}
        })
        .to_string()
    }

    #[test]
    fn write_rules_replaces_other_format() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SharedDir::new(tmp.path());
        dir.write_rules(RulesFormat::Json, r#"{"domain":["a.com"]}"#).unwrap();
        dir.write_rules(RulesFormat::Text, "domain b.com\n").unwrap();
        assert!(!tmp.path().join(RULES_JSON_FILE).exists());
        assert_eq!(dir.load_rules().unwrap().domain, vec!["b.com".to_string()]);
    }

    #[test]
    fn missing_template_is_template_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let err = SharedDir::new(tmp.path()).read_template().unwrap_err();
        assert!(matches!(err, OrchestratorError::TemplateInvalid(_)));
    }

    #[tokio::test]
    async fn override_rules_win_and_preference_applies() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(TEMPLATE_FILE), template()).unwrap();
        std::fs::write(tmp.path().join(RULES_TEXT_FILE), "domain file.example\n").unwrap();
        let mut prefs = Preferences::default();
        prefs.set("p1", "b");
        prefs.save(&tmp.path().join(PREFERENCES_FILE)).unwrap();

        let dir = SharedDir::new(tmp.path());
        let orch = dir.orchestrator(None, PreflightConfig::default());
        let provider = SharedDirProvider::new(dir, orch, Some("p1".into()));
        let mut injected = RuleSet::default();
        injected.push(mf_config::RuleType::Domain, "host.example");
        provider.set_rules_override(Some(injected));

        let built = provider.build(BuildReason::Reload).await.unwrap();
        assert_eq!(built.selector_default("proxy"), Some("b"));
        assert!(built.content.contains("host.example"));
        assert!(!built.content.contains("file.example"));
        assert!(tmp.path().join(CACHE_DIR).join(GENERATED_FILE).is_file());
    }
}
