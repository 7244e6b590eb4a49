//! Mutation-to-notification bridge.
//!
//! Called by the CRUD handlers after a durable write succeeds. Builds the
//! event envelope and hands it to the registry without waiting on delivery;
//! fan-out outcome (no recipients, evictions) never reaches the caller, and
//! a failed write must never get here.

use serde_json::json;

use crate::db::models::Task;
use crate::ws::event::{Event, EventKind};
use crate::ws::registry::Registry;

pub fn task_created(registry: &Registry, task: &Task) {
    push_task(registry, EventKind::Created, task);
}

pub fn task_updated(registry: &Registry, task: &Task) {
    push_task(registry, EventKind::Updated, task);
}

pub fn task_toggled(registry: &Registry, task: &Task) {
    push_task(registry, EventKind::Toggled, task);
}

/// Deletion carries only the identifiers; the row is gone.
pub fn task_deleted(registry: &Registry, user_id: i64, task_id: i64) {
    let event = Event::new(EventKind::Deleted, json!({ "id": task_id, "user_id": user_id }));
    registry.fan_out(user_id, &event);
}

fn push_task(registry: &Registry, kind: EventKind, task: &Task) {
    match serde_json::to_value(task) {
        Ok(data) => registry.fan_out(task.user_id, &Event::new(kind, data)),
        Err(e) => {
            tracing::warn!(task_id = task.id, error = %e, "failed to serialize task event");
        }
    }
}
