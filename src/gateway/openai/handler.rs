//! OpenAI 兼容 HTTP 入口。

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::chat::{ChatService, CompletionOutput};
use crate::grok::model::ModelService;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;

use super::types::{ChatRequest, ModelItem, ModelsResponse};

pub struct AppState {
    pub cfg: Config,
    pub chat: ChatService,
}

pub async fn handle_list_models(State(_state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = ModelService::list()
        .iter()
        .map(|m| ModelItem {
            id: m.model_id.to_string(),
            object: "model".to_string(),
            owned_by: "grok".to_string(),
        })
        .collect();
    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

pub async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    // content 可能是字符串或分段数组（untagged），这里用 serde_json 解析。
    let req: ChatRequest = match serde_json::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            return AppError::validation(format!("请求 JSON 解析失败: {e}")).into_response();
        }
    };

    match state.chat.completions(&req).await {
        Ok(CompletionOutput::Full(resp)) => Json(*resp).into_response(),
        Ok(CompletionOutput::Stream(rx)) => {
            let events = rx.map(|chunk| Ok::<Event, Infallible>(Event::default().data(chunk)));
            Sse::new(events).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.chat.stats().snapshot().await;
    Json(snapshot).into_response()
}
