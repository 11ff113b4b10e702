//! Text-generation collaborator: the trait seam the controller drives, plus
//! an Ollama-compatible streaming client.
//!
//! A generation is a lazy, finite sequence of chunk events delivered over a
//! channel, with a shared stop flag for best-effort mid-stream cancellation.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::conversation::ContextMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenEvent {
    Chunk(String),
    Done,
    Error(String),
}

/// Shared cancellation flag for an in-flight generation.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receiving side of one generation request.
pub struct GenerationHandle {
    pub events: flume::Receiver<GenEvent>,
    stop: StopSignal,
}

impl GenerationHandle {
    pub fn new(events: flume::Receiver<GenEvent>, stop: StopSignal) -> Self {
        Self { events, stop }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }
}

/// External text generator. `begin` never blocks: the producer runs in its
/// own task and the handle yields chunks in production order, ending with
/// exactly one `Done` or `Error` event.
pub trait TextGenerator: Send + Sync {
    fn begin(&self, context: Vec<ContextMessage>) -> GenerationHandle;
}

/// Streaming client for an Ollama-compatible `/api/chat` endpoint.
#[derive(Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
    /// Ceiling on one whole generation; elapsed time past it surfaces as a
    /// stream error.
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

impl OllamaGenerator {
    pub fn new(
        api_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            model,
            api_key,
            timeout,
        }
    }
}

impl TextGenerator for OllamaGenerator {
    fn begin(&self, context: Vec<ContextMessage>) -> GenerationHandle {
        let (tx, rx) = flume::unbounded();
        let stop = StopSignal::new();

        let generator = self.clone();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            let request = ChatRequest {
                model: generator.model.clone(),
                messages: context
                    .into_iter()
                    .map(|m| WireMessage {
                        role: m.role.as_str(),
                        content: m.content,
                    })
                    .collect(),
                stream: true,
            };

            let outcome = tokio::time::timeout(
                generator.timeout,
                generator.stream_chunks(request, &tx, &task_stop),
            )
            .await;

            let final_event = match outcome {
                Ok(Ok(())) => GenEvent::Done,
                Ok(Err(error)) => GenEvent::Error(error.to_string()),
                Err(_) => GenEvent::Error(format!(
                    "generation timed out after {}s",
                    generator.timeout.as_secs()
                )),
            };
            let _ = tx.send(final_event);
        });

        GenerationHandle::new(rx, stop)
    }
}

impl OllamaGenerator {
    async fn stream_chunks(
        &self,
        request: ChatRequest,
        tx: &flume::Sender<GenEvent>,
        stop: &StopSignal,
    ) -> Result<()> {
        let url = format!("{}/api/chat", self.api_url);
        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("failed to send generation request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            anyhow::bail!("generator returned {}: {}", status, body);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(piece) = stream.next().await {
            if stop.is_triggered() {
                return Ok(());
            }
            let bytes = piece.context("generation stream failed mid-sequence")?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if forward_line(line.trim(), tx)? {
                    return Ok(());
                }
            }
        }

        if !buffer.trim().is_empty() {
            forward_line(buffer.trim(), tx)?;
        }
        Ok(())
    }
}

/// Parse one NDJSON line and forward its content chunk. Returns true when
/// the generator signalled completion.
fn forward_line(line: &str, tx: &flume::Sender<GenEvent>) -> Result<bool> {
    if line.is_empty() {
        return Ok(false);
    }
    let parsed: StreamLine =
        serde_json::from_str(line).with_context(|| format!("malformed stream line: {}", line))?;
    if let Some(message) = parsed.message {
        if !message.content.is_empty() {
            // Receiver gone means the peer is gone; stop producing.
            if tx.send(GenEvent::Chunk(message.content)).is_err() {
                return Ok(true);
            }
        }
    }
    Ok(parsed.done)
}
