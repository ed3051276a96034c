//! Directory browsing for the session-creation picker.
//!
//! Server-side readdir; hidden entries are not listed.

use axum::{
    extract::Query,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

pub fn router() -> Router {
    Router::new()
        .route("/fs/list", get(list_dir))
        .route("/fs/home", get(home_dir))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirEntry {
    name: String,
    path: String,
    is_directory: bool,
}

/// GET /fs/home — the user's home directory.
async fn home_dir() -> Json<Value> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    Json(json!({"home": home.to_string_lossy()}))
}

/// GET /fs/list?path=… — entries of a directory, dotfiles hidden,
/// directories first.
async fn list_dir(
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let path = query
        .path
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut read_dir = tokio::fs::read_dir(&path).await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Cannot list {}: {e}", path.display())})),
        )
    })?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_directory = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(DirEntry {
            path: entry.path().to_string_lossy().to_string(),
            name,
            is_directory,
        });
    }

    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(Json(json!({
        "path": path.to_string_lossy(),
        "entries": entries,
    })))
}
