//! HTTP control API for a UI collaborator.
//!
//! Exposes the live conversation, turn submission and per-message playback
//! controls. Runs on 127.0.0.1 at the configured port (8768 by default).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::{Conversation, UserQuery};
use crate::message::{ImageAttachment, Message, Role};
use crate::speech::controller::PlaybackState;
use crate::speech::narrator::Narrator;

#[derive(Clone)]
pub struct ApiState {
    pub conversation: Arc<Conversation>,
    /// `None` when speech output is disabled.
    pub narrator: Option<Arc<Narrator>>,
    pub auto_play: bool,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct AskRequest {
    text: String,
    #[serde(default)]
    image: Option<ImageAttachment>,
    #[serde(default)]
    reply_to: Option<Uuid>,
}

#[derive(Serialize)]
struct AskResponse {
    message: Message,
    answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbatim: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fatwa_id: Option<String>,
}

#[derive(Deserialize)]
struct PlayRequest {
    message_id: Uuid,
}

#[derive(Deserialize)]
struct StopRequest {
    #[serde(default)]
    message_id: Option<Uuid>,
}

#[derive(Serialize)]
struct PlaybackStatus {
    message_id: Uuid,
    state: PlaybackState,
}

#[derive(Serialize)]
struct StatusResponse {
    messages: usize,
    generating: bool,
    speech_enabled: bool,
    speaking: bool,
    playback: Vec<PlaybackStatus>,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/messages", get(handle_messages))
        .route("/ask", post(handle_ask))
        .route("/play", post(handle_play))
        .route("/stop", post(handle_stop))
        .route("/cancel", post(handle_cancel))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind API on {addr}: {e}");
            return;
        }
    };
    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let mut playback: Vec<PlaybackStatus> = state
        .narrator
        .as_ref()
        .map(|n| n.states())
        .unwrap_or_default()
        .into_iter()
        .map(|(message_id, state)| PlaybackStatus { message_id, state })
        .collect();
    playback.sort_by_key(|p| p.message_id);

    Json(StatusResponse {
        messages: state.conversation.messages().len(),
        generating: state.conversation.is_turn_active(),
        speech_enabled: state.narrator.is_some(),
        speaking: state.narrator.as_ref().is_some_and(|n| n.is_any_active()),
        playback,
    })
}

async fn handle_messages(State(state): State<ApiState>) -> Json<Vec<Message>> {
    Json(state.conversation.messages())
}

async fn handle_ask(
    State(state): State<ApiState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, Json<SimpleResponse>> {
    if req.text.trim().is_empty() {
        return Err(Json(SimpleResponse::err("empty text")));
    }

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /ask: \"{}{}\" (image={}, reply_to={:?})",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.image.is_some(),
        req.reply_to,
    );

    let query = UserQuery {
        text: req.text,
        image: req.image,
        reply_to: req.reply_to,
    };
    let message = state
        .conversation
        .ask(query, CancellationToken::new(), |_| {})
        .await;

    if state.auto_play && !message.failed {
        spawn_playback(&state, &message);
    }

    let parsed = message.parsed();
    let response = AskResponse {
        answer: parsed.answer.to_string(),
        verbatim: parsed.verbatim.map(str::to_string),
        fatwa_id: parsed.fatwa_id().map(str::to_string),
        message: message.clone(),
    };
    Ok(Json(response))
}

async fn handle_play(
    State(state): State<ApiState>,
    Json(req): Json<PlayRequest>,
) -> Json<SimpleResponse> {
    let Some(narrator) = state.narrator.as_ref() else {
        return Json(SimpleResponse::err("speech disabled"));
    };
    let Some(message) = state.conversation.message(req.message_id) else {
        return Json(SimpleResponse::err(format!("unknown message: {}", req.message_id)));
    };
    if message.role != Role::Assistant || message.failed {
        return Json(SimpleResponse::err("message cannot be read aloud"));
    }
    if message.parsed().spoken_text().is_empty() {
        return Json(SimpleResponse::err("nothing to read"));
    }

    let stopping = narrator.controller(message.id).is_active();
    spawn_playback(&state, &message);
    Json(SimpleResponse::ok(if stopping { "stopping" } else { "playing" }))
}

async fn handle_stop(
    State(state): State<ApiState>,
    Json(req): Json<StopRequest>,
) -> Json<SimpleResponse> {
    let Some(narrator) = state.narrator.as_ref() else {
        return Json(SimpleResponse::ok("stopped"));
    };
    match req.message_id {
        Some(id) => narrator.stop(id),
        None => narrator.stop_all(),
    }
    Json(SimpleResponse::ok("stopped"))
}

async fn handle_cancel(State(state): State<ApiState>) -> Json<SimpleResponse> {
    if state.conversation.cancel_turn() {
        Json(SimpleResponse::ok("cancelled"))
    } else {
        Json(SimpleResponse::ok("idle"))
    }
}

/// Fire-and-forget toggle of `message`'s playback.
fn spawn_playback(state: &ApiState, message: &Message) {
    let Some(narrator) = state.narrator.clone() else {
        return;
    };
    let id = message.id;
    let text = message.parsed().spoken_text().to_string();
    tokio::spawn(async move {
        match narrator.toggle(id, &text).await {
            Ok(outcome) => info!("Playback of {id} ended: {outcome:?}"),
            Err(e) => warn!("Playback of {id} failed: {e}"),
        }
    });
}
