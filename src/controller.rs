//! Streaming session controller: one instance per peer connection.
//!
//! Drives a turn end to end: append the user message, stream the generation
//! back chunk by chunk, append the finished assistant text, extract tool
//! directives, and hand them to the arbiter. The assistant message is only
//! recorded after the whole stream completes, so log readers never observe a
//! partial turn; a disconnect mid-stream discards the partial text entirely.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::arbiter::{Arbiter, InvocationOutcome, InvocationStatus, Registration};
use crate::conversation::{ConversationStore, MessageRole};
use crate::error::ChatError;
use crate::extract::extract_tool_calls;
use crate::llm::{GenEvent, GenerationHandle, StopSignal, TextGenerator};
use crate::protocol::{PendingInvocation, ServerFrame};
use crate::session::{Session, SessionRegistry};
use crate::tools::RiskPolicy;

/// The peer vanished mid-send; the in-flight work is abandoned.
#[derive(Debug)]
pub struct PeerGone;

/// Outbound side of the connection, as seen by the controller.
#[async_trait]
pub trait PeerSink: Send {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), PeerGone>;
}

/// Shared orchestrator core handed to every connection.
#[derive(Clone)]
pub struct CoreState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<ConversationStore>,
    pub arbiter: Arc<Arbiter>,
    pub generator: Arc<dyn TextGenerator>,
    pub risk: Arc<RiskPolicy>,
    pub context_window: usize,
}

pub struct SessionController {
    core: CoreState,
    session_id: String,
    conversation_id: String,
    inflight: Mutex<Option<StopSignal>>,
}

impl SessionController {
    pub fn new(core: CoreState, session: &Session) -> Self {
        Self {
            core,
            session_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            inflight: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Best-effort cancellation of the in-flight generation, called when the
    /// connection goes away.
    pub fn cancel_inflight(&self) {
        if let Ok(inflight) = self.inflight.lock() {
            if let Some(stop) = inflight.as_ref() {
                stop.trigger();
            }
        }
    }

    fn set_inflight(&self, stop: Option<StopSignal>) {
        if let Ok(mut inflight) = self.inflight.lock() {
            *inflight = stop;
        }
    }

    /// Process one user turn. Errors are reported by the caller as an
    /// outbound `error` frame; a vanished peer is not an error, the turn is
    /// simply abandoned and its partial output discarded.
    pub async fn process_turn<S: PeerSink>(
        &self,
        content: &str,
        sink: &mut S,
    ) -> Result<(), ChatError> {
        self.core.registry.record_turn(&self.session_id).await?;
        self.core
            .store
            .append(
                &self.conversation_id,
                MessageRole::User,
                content,
                serde_json::Map::new(),
            )
            .await?;

        let context = self
            .core
            .store
            .context_window(&self.conversation_id, self.core.context_window)
            .await?;
        let handle = self.core.generator.begin(context);
        self.set_inflight(Some(handle.stop_signal()));

        if sink.send(ServerFrame::Ack).await.is_err() {
            self.abandon(&handle);
            return Ok(());
        }
        if sink.send(ServerFrame::StreamStart).await.is_err() {
            self.abandon(&handle);
            return Ok(());
        }

        let mut full_text = String::new();
        loop {
            match handle.events.recv_async().await {
                Ok(GenEvent::Chunk(chunk)) => {
                    full_text.push_str(&chunk);
                    if sink
                        .send(ServerFrame::StreamChunk { content: chunk })
                        .await
                        .is_err()
                    {
                        self.abandon(&handle);
                        return Ok(());
                    }
                }
                Ok(GenEvent::Done) => break,
                Ok(GenEvent::Error(message)) => {
                    self.set_inflight(None);
                    return Err(ChatError::upstream(message));
                }
                Err(_) => {
                    self.set_inflight(None);
                    return Err(ChatError::upstream("generation stream closed unexpectedly"));
                }
            }
        }
        self.set_inflight(None);

        // Disconnect raced the final chunk: the peer never saw completion,
        // so the text is discarded like any other interrupted stream.
        if handle.stop_signal().is_triggered() {
            tracing::info!(session = %self.session_id, "stream cancelled at completion; discarding");
            return Ok(());
        }
        if sink.send(ServerFrame::StreamEnd).await.is_err() {
            return Ok(());
        }

        if full_text.trim().is_empty() {
            tracing::debug!(session = %self.session_id, "generator produced no text");
            return Ok(());
        }

        let invocations = extract_tool_calls(&full_text, &self.core.risk);
        let mut metadata = serde_json::Map::new();
        if !invocations.is_empty() {
            let ids: Vec<&str> = invocations.iter().map(|i| i.id.as_str()).collect();
            metadata.insert("tool_calls".to_string(), serde_json::json!(ids));
        }
        self.core
            .store
            .append(
                &self.conversation_id,
                MessageRole::Assistant,
                &full_text,
                metadata,
            )
            .await?;

        // Invocations are surfaced only after the assistant append above, so
        // every one of them is attributable to a recorded message.
        let mut pending = Vec::new();
        for invocation in invocations {
            match self
                .core
                .arbiter
                .register(&self.conversation_id, invocation)
                .await
            {
                Ok(Registration::Pending(invocation)) => {
                    pending.push(PendingInvocation::from(&invocation));
                }
                Ok(Registration::Completed(outcome)) => {
                    self.record_tool_result(&outcome).await;
                    if sink
                        .send(ServerFrame::InvocationResult { outcome })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(error) => {
                    if sink
                        .send(ServerFrame::Error {
                            message: error.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }

        if !pending.is_empty() {
            let _ = sink
                .send(ServerFrame::InvocationsPending {
                    invocations: pending,
                })
                .await;
        }
        Ok(())
    }

    /// Apply a confirm/cancel decision from the peer.
    pub async fn resolve_decision(
        &self,
        invocation_id: &str,
        confirmed: bool,
    ) -> Result<InvocationOutcome, ChatError> {
        self.core.registry.get_session(&self.session_id).await?;
        let outcome = self
            .core
            .arbiter
            .resolve(&self.conversation_id, invocation_id, confirmed)
            .await?;
        self.record_tool_result(&outcome).await;
        Ok(outcome)
    }

    fn abandon(&self, handle: &GenerationHandle) {
        handle.stop_signal().trigger();
        self.set_inflight(None);
        tracing::info!(
            session = %self.session_id,
            "peer disconnected mid-stream; partial text discarded"
        );
    }

    /// Successful executions land in the log as a `tool` message.
    async fn record_tool_result(&self, outcome: &InvocationOutcome) {
        if outcome.status != InvocationStatus::Succeeded {
            return;
        }
        let Some(result) = outcome.result.as_deref() else {
            return;
        };
        let content = format!("Tool: {}\nResult: {}", outcome.name, result);
        if let Err(error) = self
            .core
            .store
            .append(
                &self.conversation_id,
                MessageRole::Tool,
                &content,
                serde_json::Map::new(),
            )
            .await
        {
            tracing::warn!(
                conversation = %self.conversation_id,
                error = %error,
                "failed to record tool result"
            );
        }
    }
}
