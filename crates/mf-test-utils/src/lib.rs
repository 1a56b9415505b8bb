//! Shared test utilities for the meshflux workspace
//! 测试工具集
//!
//! - Loopback TCP endpoints that accept or refuse
//! - In-memory control channel with scripted push frames
//! - Recording engine factory for supervisor tests
//!
//! ```toml
//! [dev-dependencies]
//! mf-test-utils = { workspace = true }
//! ```

pub mod control;
pub mod engine;
pub mod net;

pub use control::MemoryChannel;
pub use engine::{EngineEvent, RecordingFactory};
pub use net::{refused_addr, spawn_listener};

use serde_json::{json, Value};

/// Minimal engine template with one `proxy` selector over the given candidates.
/// Candidates are `(tag, address)`; the first one is the default.
pub fn selector_template(candidates: &[(&str, std::net::SocketAddr)]) -> String {
    let tags: Vec<&str> = candidates.iter().map(|(t, _)| *t).collect();
    let mut outbounds: Vec<Value> = vec![json!({
        "type": "selector",
        "tag": "proxy",
        "outbounds": tags,
        "default": tags.first().copied().unwrap_or("direct"),
    })];
    for (tag, addr) in candidates {
        outbounds.push(json!({
            "type": "shadowsocks",
            "tag": tag,
            "server": addr.ip().to_string(),
            "server_port": addr.port(),
        }));
    }
    outbounds.push(json!({"type": "direct", "tag": "direct"}));
    json!({
        "log": {"level": "info"},
        "inbounds": [{"type": "tun", "tag": "tun-in", "stack": "gvisor"}],
        "outbounds": outbounds,
        "route": {"rules": [{"action": "sniff"}], "final": "proxy"},
    })
    .to_string()
}
