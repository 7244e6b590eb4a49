use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::auth::middleware::Claims;
use crate::db::models::Task;
use crate::state::AppState;
use crate::tasks::notify;

const TASK_COLUMNS: &str = "id, user_id, title, description, due_date, is_completed, \
     is_favorite, repeat_type, note, created_at, updated_at";

/// Request body shared by create and update.
#[derive(Debug, Deserialize)]
pub struct TaskPayload {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub repeat_type: String,
    #[serde(default)]
    pub note: String,
}

fn validate(payload: &TaskPayload) -> Result<(), (StatusCode, String)> {
    if payload.title.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Title cannot be empty".to_string(),
        ));
    }
    if let Some(due) = &payload.due_date {
        if chrono::DateTime::parse_from_rfc3339(due).is_err() {
            return Err((StatusCode::BAD_REQUEST, "Invalid due date".to_string()));
        }
    }
    Ok(())
}

fn fetch_task(
    conn: &rusqlite::Connection,
    task_id: i64,
    user_id: i64,
) -> rusqlite::Result<Task> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1 AND user_id = ?2", TASK_COLUMNS),
        rusqlite::params![task_id, user_id],
        Task::from_row,
    )
}

/// GET /api/tasks — All tasks belonging to the authenticated user.
pub async fn list_tasks(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<Task>>, (StatusCode, String)> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let tasks = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "DB lock".to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE user_id = ?1 ORDER BY id ASC",
                TASK_COLUMNS
            ))
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Prepare: {}", e)))?;

        let tasks: Vec<Task> = stmt
            .query_map([user_id], Task::from_row)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query tasks: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok::<_, (StatusCode, String)>(tasks)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    Ok(Json(tasks))
}

/// POST /api/tasks — Create a task; notifies the owner's live streams.
pub async fn create_task(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<TaskPayload>,
) -> Result<(StatusCode, Json<Task>), (StatusCode, String)> {
    validate(&req)?;

    let db = state.db.clone();
    let user_id = claims.sub;

    let task = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "DB lock".to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks (user_id, title, description, due_date, is_completed, \
             is_favorite, repeat_type, note, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                user_id,
                req.title,
                req.description,
                req.due_date,
                req.repeat_type,
                req.note,
                now
            ],
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert task: {}", e)))?;

        let task_id = conn.last_insert_rowid();
        fetch_task(&conn, task_id, user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Read task: {}", e)))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    notify::task_created(&state.registry, &task);

    Ok((StatusCode::CREATED, Json(task)))
}

/// PUT /api/tasks/{id} — Update a task's editable fields; completion and
/// favorite flags are untouched.
pub async fn update_task(
    State(state): State<AppState>,
    claims: Claims,
    Path(task_id): Path<i64>,
    Json(req): Json<TaskPayload>,
) -> Result<Json<Task>, (StatusCode, String)> {
    validate(&req)?;

    let db = state.db.clone();
    let user_id = claims.sub;

    let task = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "DB lock".to_string()))?;

        let now = Utc::now().to_rfc3339();
        let rows = conn
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, due_date = ?3, \
                 repeat_type = ?4, note = ?5, updated_at = ?6 \
                 WHERE id = ?7 AND user_id = ?8",
                rusqlite::params![
                    req.title,
                    req.description,
                    req.due_date,
                    req.repeat_type,
                    req.note,
                    now,
                    task_id,
                    user_id
                ],
            )
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update task: {}", e)))?;

        if rows == 0 {
            return Err((StatusCode::NOT_FOUND, "Task not found".to_string()));
        }

        fetch_task(&conn, task_id, user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Read task: {}", e)))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    notify::task_updated(&state.registry, &task);

    Ok(Json(task))
}

/// PATCH /api/tasks/{id}/toggle — Flip the completion flag.
pub async fn toggle_task(
    State(state): State<AppState>,
    claims: Claims,
    Path(task_id): Path<i64>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let task = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "DB lock".to_string()))?;

        let now = Utc::now().to_rfc3339();
        let rows = conn
            .execute(
                "UPDATE tasks SET is_completed = NOT is_completed, updated_at = ?1 \
                 WHERE id = ?2 AND user_id = ?3",
                rusqlite::params![now, task_id, user_id],
            )
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Toggle task: {}", e)))?;

        if rows == 0 {
            return Err((StatusCode::NOT_FOUND, "Task not found".to_string()));
        }

        fetch_task(&conn, task_id, user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Read task: {}", e)))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    notify::task_toggled(&state.registry, &task);

    Ok(Json(task))
}

/// DELETE /api/tasks/{id} — Delete a task; responds with a summary of the
/// removed row.
pub async fn delete_task(
    State(state): State<AppState>,
    claims: Claims,
    Path(task_id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let task = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "DB lock".to_string()))?;

        let task = fetch_task(&conn, task_id, user_id)
            .map_err(|_| (StatusCode::NOT_FOUND, "Task not found".to_string()))?;

        conn.execute(
            "DELETE FROM tasks WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![task_id, user_id],
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Delete task: {}", e)))?;

        Ok::<_, (StatusCode, String)>(task)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join: {}", e)))??;

    notify::task_deleted(&state.registry, user_id, task.id);

    Ok(Json(json!({
        "message": "Task deleted successfully",
        "task": {
            "id": task.id,
            "user_id": task.user_id,
            "title": task.title,
            "created_at": task.created_at,
            "updated_at": task.updated_at,
        },
    })))
}
