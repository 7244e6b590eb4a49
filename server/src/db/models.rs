//! Database row types. These correspond 1:1 to the SQLite schema defined in
//! migrations.rs.

use serde::Serialize;

/// User account record. The password hash never leaves the server; API
/// responses are built from the other fields.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub created_at: String,
}

/// Task record. Serializes directly as the API response body and as the
/// `data` payload of change notifications, so the JSON field names here are
/// the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub due_date: Option<String>,
    pub is_completed: bool,
    pub is_favorite: bool,
    pub repeat_type: String,
    pub note: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Map a row selected with the canonical column order:
    /// id, user_id, title, description, due_date, is_completed, is_favorite,
    /// repeat_type, note, created_at, updated_at
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Task {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            due_date: row.get(4)?,
            is_completed: row.get(5)?,
            is_favorite: row.get(6)?,
            repeat_type: row.get(7)?,
            note: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
