// app/tests/cli.rs
use assert_cmd::cargo::cargo_bin_cmd;
use mf_test_utils::{refused_addr, selector_template};
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

fn meshflux() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("meshflux");
    cmd.env("MF_LOG_LEVEL", "error").env_remove("MF_SHARED_DIR");
    cmd
}

fn shared_dir(template: &str, rules: Option<&str>) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("singbox_config.json"), template).unwrap();
    if let Some(rules) = rules {
        fs::write(dir.path().join("routing_rules.txt"), rules).unwrap();
    }
    dir
}

fn path_str(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn compile_rules_prints_engine_rules() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("rules.txt");
    fs::write(&file, "[domain_suffix]\nexample.com\nexample.com\n[ip_cidr]\n10.0.0.0/8\n").unwrap();

    let out = meshflux()
        .args(["compile-rules", path_str(&file)])
        .output()
        .unwrap();
    assert!(out.status.success());
    let rules: Vec<Value> = serde_json::from_slice(&out.stdout).unwrap();
    assert!(rules.iter().all(|r| r["outbound"] == "proxy"));
    assert!(rules
        .iter()
        .any(|r| r["domain_suffix"] == serde_json::json!([".example.com"])));
}

#[test]
fn compile_rules_rejects_unknown_type() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("rules.txt");
    fs::write(&file, "geosite: cn\n").unwrap();

    meshflux()
        .args(["compile-rules", path_str(&file)])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("InvalidRuleType"));
}

#[test]
fn build_splices_rules_after_sniff() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let template = selector_template(&[("a", listener.local_addr().unwrap())]);
    let dir = shared_dir(&template, Some("domain example.com\n"));

    let out = meshflux()
        .args(["build", "--dir", path_str(dir.path())])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let doc: Value = serde_json::from_slice(&out.stdout).unwrap();
    let rules = doc["route"]["rules"].as_array().unwrap();
    assert_eq!(rules[0]["action"], "sniff");
    assert_eq!(rules[1]["domain"], serde_json::json!(["example.com"]));
    assert_eq!(doc["inbounds"][0]["stack"], "system");
    assert!(dir.path().join("cache/generated_config.json").is_file());
}

#[test]
fn build_with_preflight_repairs_default_and_reports() {
    let b = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let template = selector_template(&[
        ("a", refused_addr().unwrap()),
        ("b", b.local_addr().unwrap()),
    ]);
    let dir = shared_dir(&template, None);
    let out_file = dir.path().join("out/config.json");

    let out = meshflux()
        .args([
            "build",
            "--dir",
            path_str(dir.path()),
            "--preflight",
            "--out",
            path_str(&out_file),
            "--format",
            "json",
        ])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["ok"], true);
    assert!(report["patches"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["patch"] == "default_repaired" && p["to"] == "b"));

    let doc: Value = serde_json::from_str(&fs::read_to_string(&out_file).unwrap()).unwrap();
    let proxy = doc["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["tag"] == "proxy")
        .unwrap();
    assert_eq!(proxy["default"], "b");
}

#[test]
fn build_fails_when_no_egress_is_reachable() {
    let template = selector_template(&[
        ("a", refused_addr().unwrap()),
        ("b", refused_addr().unwrap()),
    ]);
    let dir = shared_dir(&template, None);

    meshflux()
        .args(["build", "--dir", path_str(dir.path()), "--preflight"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("no candidate egress is reachable"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn build_rule_mode_routes_rest_direct() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let template = selector_template(&[("a", listener.local_addr().unwrap())]);
    let dir = shared_dir(&template, Some("suffix example.com\n"));

    let out = meshflux()
        .args(["build", "--dir", path_str(dir.path()), "--mode", "rule"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let doc: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(doc["route"]["final"], "direct");
    assert_eq!(doc["route"]["rules"][0]["action"], "sniff");
}

#[test]
fn build_without_template_is_template_invalid() {
    let dir = tempfile::tempdir().unwrap();
    meshflux()
        .args(["build", "--dir", path_str(dir.path()), "--format", "json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("\"kind\":\"TemplateInvalid\""));
}

#[test]
fn probe_reports_repair() {
    let b = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let template = selector_template(&[
        ("a", refused_addr().unwrap()),
        ("b", b.local_addr().unwrap()),
    ]);
    let dir = shared_dir(&template, None);

    meshflux()
        .args(["probe", "--dir", path_str(dir.path()), "--group", "proxy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default a unreachable, use b"));
}

#[cfg(unix)]
#[test]
fn groups_without_engine_is_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    meshflux()
        .args([
            "groups",
            "--socket",
            path_str(&dir.path().join("command.sock")),
            "--attempts",
            "1",
        ])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Connect"));
}
