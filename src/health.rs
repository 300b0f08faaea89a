//! In-process component health registry, surfaced at `/health`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone)]
struct ComponentHealth {
    ok: bool,
    last_ok: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

fn registry() -> &'static RwLock<HashMap<String, ComponentHealth>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ComponentHealth>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn started_at() -> Instant {
    static STARTED: OnceLock<Instant> = OnceLock::new();
    *STARTED.get_or_init(Instant::now)
}

/// Call early in main so uptime counts from process start.
pub fn init() {
    let _ = started_at();
}

pub fn mark_component_ok(component: &str) {
    let mut registry = registry().write();
    let entry = registry
        .entry(component.to_string())
        .or_insert(ComponentHealth {
            ok: true,
            last_ok: None,
            last_error: None,
            last_error_at: None,
        });
    entry.ok = true;
    entry.last_ok = Some(Utc::now());
    entry.last_error = None;
}

pub fn mark_component_error(component: &str, message: impl Into<String>) {
    let mut registry = registry().write();
    let entry = registry
        .entry(component.to_string())
        .or_insert(ComponentHealth {
            ok: false,
            last_ok: None,
            last_error: None,
            last_error_at: None,
        });
    entry.ok = false;
    entry.last_error = Some(message.into());
    entry.last_error_at = Some(Utc::now());
}

pub fn snapshot_json() -> serde_json::Value {
    let registry = registry().read();
    let mut components = serde_json::Map::new();
    for (name, health) in registry.iter() {
        components.insert(
            name.clone(),
            serde_json::json!({
                "status": if health.ok { "ok" } else { "error" },
                "last_ok": health.last_ok.map(|t| t.to_rfc3339()),
                "last_error": health.last_error,
                "last_error_at": health.last_error_at.map(|t| t.to_rfc3339()),
            }),
        );
    }

    serde_json::json!({
        "uptime_seconds": started_at().elapsed().as_secs(),
        "components": components,
    })
}
