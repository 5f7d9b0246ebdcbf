use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use botpanel_protocol::{BotId, BotStatus};

use crate::server::AppState;

/// GET /api/bots - Every bot folder plus any bot with a live process.
pub async fn list_bots(
    State(state): State<AppState>,
) -> Result<Json<Vec<BotStatus>>, (StatusCode, String)> {
    let mut bots: BTreeMap<BotId, Option<u32>> = BTreeMap::new();

    let bots_dir = &state.supervisor.config().bots_dir;
    let mut entries = tokio::fs::read_dir(bots_dir).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to list {}: {e}", bots_dir.display()),
        )
    })?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }
        // Folders whose names are not valid ids can never be started.
        if let Some(Ok(bot_id)) = entry.file_name().to_str().map(BotId::parse) {
            bots.insert(bot_id, None);
        }
    }

    for (bot_id, pid) in state.supervisor.running().await {
        bots.insert(bot_id, Some(pid));
    }

    Ok(Json(
        bots.into_iter()
            .map(|(bot_id, pid)| BotStatus {
                bot_id,
                running: pid.is_some(),
                pid,
            })
            .collect(),
    ))
}

/// GET /api/bots/{id} - One bot's process state.
pub async fn bot_status(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<BotStatus>, (StatusCode, String)> {
    let bot_id =
        BotId::parse(&raw).map_err(|e| (StatusCode::NOT_FOUND, format!("invalid bot id: {e}")))?;

    let pid = state.supervisor.running_pid(&bot_id).await;
    if pid.is_none() && !state.supervisor.bot_dir(&bot_id).is_dir() {
        return Err((StatusCode::NOT_FOUND, format!("bot not found: {bot_id}")));
    }

    Ok(Json(BotStatus {
        bot_id,
        running: pid.is_some(),
        pid,
    }))
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}
