use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::arbiter::Arbiter;
use crate::config::ServerConfig;
use crate::controller::{CoreState, PeerGone, PeerSink, SessionController};
use crate::conversation::ConversationStore;
use crate::error::ChatError;
use crate::llm::OllamaGenerator;
use crate::protocol::{parse_client_frame, ClientFrame, ServerFrame};
use crate::session::SessionRegistry;
use crate::tools::{render_manifest, RiskPolicy, ToolExecutor, ToolSpec, UnavailableExecutor};

#[derive(Clone)]
pub struct ServerState {
    pub core: CoreState,
    pub tools: Arc<Vec<ToolSpec>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    conversations: usize,
    total_messages: usize,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

/// Run the server until the listener fails. The executor defaults to the
/// unavailable stub; embedders wire a real one through [`serve_with_executor`].
pub async fn serve(config: ServerConfig) -> Result<()> {
    serve_with_executor(config, Arc::new(UnavailableExecutor)).await
}

pub async fn serve_with_executor(
    config: ServerConfig,
    executor: Arc<dyn ToolExecutor>,
) -> Result<()> {
    let bind_addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let state = Arc::new(ServerState {
        core: build_core(&config, executor),
        tools: Arc::new(config.tools.clone()),
    });
    state
        .core
        .registry
        .start_sweeper(Duration::from_secs(config.sweep_interval_secs));

    let app = Router::new().nest("/v1", routes(state.clone()));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("confab listening on http://{}", bind_addr);
    let served = axum::serve(listener, app).await.context("Server failed");
    state.core.registry.shutdown();
    served
}

/// Assemble the shared core from config. The seeded system preamble is the
/// configured instructions plus the rendered tool manifest.
pub fn build_core(config: &ServerConfig, executor: Arc<dyn ToolExecutor>) -> CoreState {
    let mut preamble = config.system_prompt.trim().to_string();
    let manifest = render_manifest(&config.tools);
    if !manifest.is_empty() {
        if !preamble.is_empty() {
            preamble.push_str("\n\n");
        }
        preamble.push_str(&manifest);
    }

    let store = Arc::new(ConversationStore::new(config.max_conversation_length));
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        preamble,
        config.session_timeout_secs,
    ));
    let generator = Arc::new(OllamaGenerator::new(
        config.llm_api_url.clone(),
        config.llm_model.clone(),
        config.llm_api_key.clone(),
        Duration::from_secs(config.generation_timeout_secs),
    ));

    CoreState {
        registry,
        store,
        arbiter: Arc::new(Arbiter::new(executor)),
        generator,
        risk: Arc::new(RiskPolicy::from_specs(&config.tools)),
        context_window: config.context_window_messages,
    }
}

fn routes(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/tools", get(list_tools))
        .route(
            "/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:id/export", get(export_session))
        .route("/ws", get(ws_route))
        .with_state(state)
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.core.registry.active_count().await,
    })
}

async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    let (conversations, total_messages) = state.core.store.counts().await;
    Json(StatsResponse {
        active_sessions: state.core.registry.active_count().await,
        conversations,
        total_messages,
    })
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<Vec<ToolSpec>> {
    Json(state.tools.as_ref().clone())
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let session = state
        .core
        .registry
        .get_session(&id)
        .await
        .map_err(error_response)?;
    let messages = state
        .core
        .store
        .get(&session.conversation_id)
        .await
        .map(|c| c.messages)
        .unwrap_or_default();
    Ok(Json(serde_json::json!({
        "session": session,
        "messages": messages,
    })))
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.core.registry.end_session(&id).await;
    StatusCode::NO_CONTENT
}

async fn export_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let session = state
        .core
        .registry
        .get_session(&id)
        .await
        .map_err(error_response)?;

    match query.format.as_deref().unwrap_or("json") {
        "json" => {
            let export = state
                .core
                .store
                .export_json(&session.conversation_id)
                .await
                .map_err(error_response)?;
            Ok(Json(export).into_response())
        }
        "markdown" => {
            let md = state
                .core
                .store
                .export_markdown(&session.conversation_id)
                .await
                .map_err(error_response)?;
            Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], md).into_response())
        }
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("unknown export format '{}'", other),
        )),
    }
}

fn error_response(error: ChatError) -> (StatusCode, String) {
    let status = match &error {
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::InvalidState(_) => StatusCode::CONFLICT,
        ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    (status, error.to_string())
}

async fn ws_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_chat_socket(state, socket))
}

/// At most one streaming turn per connection. A turn occupies the slot until
/// its task finishes; a second turn submitted meanwhile is rejected as busy,
/// never queued.
#[derive(Default)]
struct TurnSlot {
    task: Option<JoinHandle<()>>,
}

impl TurnSlot {
    fn is_streaming(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn try_start<F>(&mut self, turn: F) -> Result<(), ChatError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_streaming() {
            return Err(ChatError::invalid_state("a turn is already streaming"));
        }
        self.task = Some(tokio::spawn(turn));
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Frames queued here are serialized and written by a dedicated writer task;
/// the queue closing means the peer is gone.
#[derive(Clone)]
struct ChannelSink {
    tx: flume::Sender<ServerFrame>,
}

#[async_trait::async_trait]
impl PeerSink for ChannelSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), PeerGone> {
        self.tx.send_async(frame).await.map_err(|_| PeerGone)
    }
}

async fn handle_chat_socket(state: Arc<ServerState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = flume::unbounded::<ServerFrame>();

    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Ok(frame) = out_rx.recv_async().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(serialized) => serialized,
                Err(error) => {
                    tracing::warn!("Failed to serialize outbound frame: {}", error);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let mut sink = ChannelSink { tx: out_tx };
    let Some(controller) = await_init(&state, &mut ws_rx, &mut sink).await else {
        writer.abort();
        return;
    };

    // One streaming turn at a time per connection; decisions and pings are
    // still served while it streams.
    let mut turn = TurnSlot::default();
    while let Some(incoming) = ws_rx.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let frame = match parse_client_frame(&text) {
            Ok(frame) => frame,
            Err(error) => {
                if report(&mut sink, &error).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match frame {
            ClientFrame::Init { session_id } => {
                // Re-init on a live connection echoes the current session.
                let _ = session_id;
                let frame = ServerFrame::Session {
                    session_id: controller.session_id().to_string(),
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            ClientFrame::Turn { content } => {
                let controller = controller.clone();
                let mut turn_sink = sink.clone();
                let started = turn.try_start(async move {
                    if let Err(error) = controller.process_turn(&content, &mut turn_sink).await {
                        let _ = report(&mut turn_sink, &error).await;
                    }
                });
                if let Err(busy) = started {
                    if report(&mut sink, &busy).await.is_err() {
                        break;
                    }
                }
            }
            ClientFrame::Decision {
                invocation_id,
                confirmed,
            } => {
                let sent = match controller.resolve_decision(&invocation_id, confirmed).await {
                    Ok(outcome) => sink.send(ServerFrame::InvocationResult { outcome }).await,
                    Err(error) => report(&mut sink, &error).await,
                };
                if sent.is_err() {
                    break;
                }
            }
            ClientFrame::Ping => {
                if sink.send(ServerFrame::Pong).await.is_err() {
                    break;
                }
            }
        }
    }

    // Disconnect: stop any in-flight generation so its partial text is
    // discarded. The session itself stays registered until the idle sweep,
    // so the peer can reconnect with its session id.
    controller.cancel_inflight();
    writer.abort();
    turn.abort();
    tracing::debug!(session = %controller.session_id(), "chat socket closed");
}

/// Handshake: the first meaningful frame must be `init`. Pings are answered;
/// anything else is reported and the peer may try again.
async fn await_init<R>(
    state: &Arc<ServerState>,
    ws_rx: &mut R,
    sink: &mut ChannelSink,
) -> Option<Arc<SessionController>>
where
    R: futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(incoming) = ws_rx.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };

        match parse_client_frame(&text) {
            Ok(ClientFrame::Init { session_id }) => {
                let session = state
                    .core
                    .registry
                    .create_session(session_id.as_deref())
                    .await;
                let frame = ServerFrame::Session {
                    session_id: session.id.clone(),
                };
                if sink.send(frame).await.is_err() {
                    return None;
                }
                return Some(Arc::new(SessionController::new(
                    state.core.clone(),
                    &session,
                )));
            }
            Ok(ClientFrame::Ping) => {
                if sink.send(ServerFrame::Pong).await.is_err() {
                    return None;
                }
            }
            Ok(_) => {
                let error = ChatError::validation("session not initialized; send init first");
                if report(sink, &error).await.is_err() {
                    return None;
                }
            }
            Err(error) => {
                if report(sink, &error).await.is_err() {
                    return None;
                }
            }
        }
    }
    None
}

async fn report(sink: &mut ChannelSink, error: &ChatError) -> Result<(), PeerGone> {
    tracing::debug!(error = %error, "reporting error to peer");
    sink.send(ServerFrame::Error {
        message: error.to_string(),
    })
    .await
}
