//! Process-wide component health registry.
//!
//! Supervised components (gateway, channel listeners, dispatcher) report in
//! here; the gateway's `/health` route renders a snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

fn registry() -> &'static Mutex<BTreeMap<String, ComponentHealth>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, ComponentHealth>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn upsert(component: &str, update: impl FnOnce(&mut ComponentHealth)) {
    let mut components = registry().lock();
    let entry = components
        .entry(component.to_string())
        .or_insert_with(|| ComponentHealth {
            status: ComponentStatus::Ok,
            updated_at: Utc::now(),
            last_error: None,
            restart_count: 0,
        });
    update(entry);
    entry.updated_at = Utc::now();
}

pub fn mark_component_ok(component: &str) {
    upsert(component, |entry| entry.status = ComponentStatus::Ok);
}

pub fn mark_component_error(component: &str, error: impl Into<String>) {
    let error = error.into();
    upsert(component, |entry| {
        entry.status = ComponentStatus::Error;
        entry.last_error = Some(error);
    });
}

pub fn bump_component_restart(component: &str) {
    upsert(component, |entry| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

pub fn snapshot() -> BTreeMap<String, ComponentHealth> {
    registry().lock().clone()
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|_| serde_json::json!({}))
}
