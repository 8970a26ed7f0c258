//! Route handlers

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{AppError, AppState};
use crate::error::Error;
use crate::orchestrator::ExecutionRequest;
use crate::registry::LanguageSpec;
use crate::sandbox::{ChannelSink, SandboxSummary};

pub async fn ping() -> &'static str {
    "pong"
}

#[derive(Serialize)]
pub struct LanguagesResponse<'a> {
    languages: BTreeMap<&'a str, &'a LanguageSpec>,
}

pub async fn list_languages(State(state): State<AppState>) -> Response {
    let registry = state.orchestrator.registry();
    Json(LanguagesResponse {
        languages: registry.iter().collect(),
    })
    .into_response()
}

#[derive(Serialize)]
pub struct ContainersResponse {
    containers: Vec<SandboxSummary>,
}

pub async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<ContainersResponse>, AppError> {
    let containers = state.orchestrator.runtime().list().await?;
    Ok(Json(ContainersResponse { containers }))
}

/// Launch the sandbox, then hand its output to a background relay task
/// that feeds the response body.
pub async fn run(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload
        .map_err(|e| Error::InvalidInput(format!("invalid request body: {}", e.body_text())))?;

    info!(
        "POST /run language={} code_bytes={} stdin_bytes={}",
        request.language,
        request.code.len(),
        request.stdin.len()
    );

    let running = state.orchestrator.launch(&request).await?;
    let id = running.id().to_string();

    let (tx, rx) = mpsc::channel::<Bytes>(state.output_buffer);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let result = running.relay(&mut sink).await;
        drop(sink);
        let _ = done_tx.send(result);
    });

    // Chunks until the relay finishes, then one error item if it failed
    let body = stream::unfold(Some((rx, done_rx)), |state| async move {
        let Some((mut rx, done_rx)) = state else {
            return None;
        };
        match rx.recv().await {
            Some(chunk) => Some((Ok::<_, std::io::Error>(chunk), Some((rx, done_rx)))),
            None => match done_rx.await {
                Ok(Err(e)) => Some((Err(std::io::Error::other(e.safe_message())), None)),
                _ => None,
            },
        }
    });

    debug!("streaming output of sandbox {}", id);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
