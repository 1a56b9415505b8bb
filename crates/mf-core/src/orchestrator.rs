//! Config orchestration: base template + rules + preferences -> engine document.
//! 配置编排
//!
//! `Parse` -> `Preferred outbound` -> `Preflight (startup only)` -> `Tun stack`
//! -> `Remote rule-set fallback` -> `route.final` -> `Rule splice` -> `Routing mode`
//! -> `Log override` -> `Deterministic JSON`
//!
//! The result is derived fresh on every call; nothing is cached between builds.

use crate::preflight::{Preflight, PreflightOutcome};
use mf_config::json_norm::{normalize_value, to_canonical_string};
use mf_config::mode::apply_routing_mode;
use mf_config::patch::{
    apply_log_override, apply_preferred_outbound, ensure_final, fallback_remote_rule_sets,
    force_tun_stack,
};
use mf_config::splice::splice_into;
use mf_config::{AppliedPatch, BuildOptions, Preferences, RuleSet, SpliceReport, Template};
use mf_types::OrchestratorError;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Everything one build depends on, passed explicitly.
#[derive(Debug, Clone, Copy)]
pub struct BuildInput<'a> {
    pub template: &'a str,
    pub rules: &'a RuleSet,
    pub preferences: &'a Preferences,
    pub profile_id: Option<&'a str>,
    pub run_preflight: bool,
}

/// A ready-to-run engine document plus the record of how it was derived.
#[derive(Debug, Clone)]
pub struct BuiltConfig {
    /// Key-sorted document.
    pub document: Value,
    /// Pretty JSON of `document`; what the engine receives.
    pub content: String,
    pub patches: Vec<AppliedPatch>,
    pub splice: SpliceReport,
    pub preflight: Vec<PreflightOutcome>,
}

impl BuiltConfig {
    /// Groups whose default the preflight replaced, as `(group, new default)`.
    pub fn repairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.preflight
            .iter()
            .filter(|o| o.repaired())
            .map(|o| (o.group.as_str(), o.selected.as_str()))
    }

    pub fn selector_default(&self, group: &str) -> Option<&str> {
        self.document
            .get("outbounds")?
            .as_array()?
            .iter()
            .find(|o| o.get("tag").and_then(Value::as_str) == Some(group))?
            .get("default")?
            .as_str()
    }
}

pub struct ConfigOrchestrator {
    options: BuildOptions,
    preflight: Preflight,
    snapshot_path: Option<PathBuf>,
}

impl ConfigOrchestrator {
    pub fn new(options: BuildOptions, preflight: Preflight) -> Self {
        Self {
            options,
            preflight,
            snapshot_path: None,
        }
    }

    /// Also write every generated document to `path` for inspection.
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build the engine document.
    ///
    /// # Errors
    /// `TemplateInvalid` for a bad template, `NoReachableEgress` when the
    /// preflight finds no candidate, `Serialize` if the document cannot be printed.
    pub async fn build(&self, input: BuildInput<'_>) -> Result<BuiltConfig, OrchestratorError> {
        let opts = &self.options;
        let mut tpl = Template::parse(input.template)?;
        let mut patches = Vec::new();

        let preferred = input.profile_id.and_then(|p| input.preferences.get(p));
        patches.extend(apply_preferred_outbound(
            &mut tpl,
            &opts.preferred_groups,
            preferred,
        ));

        let mut preflight = Vec::new();
        if input.run_preflight {
            for group in tpl
                .selector_groups()
                .into_iter()
                .filter(|g| opts.preferred_groups.contains(&g.tag))
            {
                let candidates = tpl.candidates_of(&group);
                let outcome = self.preflight.verify_or_repair(&group, &candidates).await?;
                if outcome.repaired() {
                    tpl.set_selector_default(&group.tag, &outcome.selected);
                    patches.push(AppliedPatch::DefaultRepaired {
                        group: group.tag.clone(),
                        from: outcome.previous.clone(),
                        to: outcome.selected.clone(),
                        rtt_ms: outcome.rtt_ms,
                    });
                }
                preflight.push(outcome);
            }
        }

        if let Some(stack) = &opts.forced_tun_stack {
            patches.extend(force_tun_stack(&mut tpl, stack));
        }
        patches.extend(fallback_remote_rule_sets(
            &mut tpl,
            &opts.known_remote_rule_sets,
            &opts.local_rule_set_assets,
        ));
        patches.extend(ensure_final(&mut tpl, &opts.default_final));

        let compiled = input.rules.to_engine_rules(&opts.rule_outbound);
        let splice = splice_into(&mut tpl, &compiled);

        if let Some(mode) = opts.routing_mode {
            patches.push(apply_routing_mode(&mut tpl, mode, &opts.rule_outbound));
        }
        if let Some(ov) = &opts.log_override {
            patches.extend(apply_log_override(&mut tpl, ov));
        }

        for p in &patches {
            p.log();
        }

        let document = normalize_value(tpl.into_value());
        let content = to_canonical_string(&document)
            .map_err(|e| OrchestratorError::Serialize(e.to_string()))?;
        tracing::info!(
            rules = compiled.len(),
            patches = patches.len(),
            bytes = content.len(),
            preflight = input.run_preflight,
            "engine config built"
        );

        if let Some(path) = &self.snapshot_path {
            write_snapshot(path, &content);
        }

        Ok(BuiltConfig {
            document,
            content,
            patches,
            splice,
            preflight,
        })
    }
}

/// Best effort: a failed snapshot never fails the build.
fn write_snapshot(path: &Path, content: &str) {
    let result = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(path, content));
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "generated config snapshot written"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write config snapshot"),
    }
}
