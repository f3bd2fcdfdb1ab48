use crate::activation::ActivationController;
use crate::agent::Agent;
use crate::broadcast::ObserverHub;
use crate::metrics::Metrics;
use crate::state::LatestState;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<LatestState>,
    pub hub: Arc<ObserverHub>,
    pub controller: Arc<ActivationController>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    agent: &Agent,
    shutdown: watch::Receiver<bool>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/ws", get(ws_handler))
        .with_state(HttpAppState {
            metrics,
            state: agent.state.clone(),
            hub: agent.hub.clone(),
            controller: agent.controller.clone(),
            shutdown,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.state.snapshot())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket| observe(socket, state))
}

fn echo_frame(text: &str) -> String {
    format!("Echo: {text}")
}

async fn observe(socket: WebSocket, app: HttpAppState) {
    let (mut outbound, mut inbound) = socket.split();
    let mut frames = app.hub.subscribe();
    let mut shutdown = app.shutdown.clone();
    let observers = app.controller.observer_connected().await;
    info!(observers, "observer connected");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if outbound.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "slow observer skipped frames");
                }
                Err(RecvError::Closed) => break,
            },
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    app.hub.publish(echo_frame(&text));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let observers = app.controller.observer_disconnected().await;
    info!(observers, "observer disconnected");
}
