//! Wire frames for the streaming chat connection.
//!
//! Transport is a JSON-over-WebSocket framing; every frame carries a
//! snake_case `type` tag. Unknown or malformed inbound frames are validation
//! errors reported on the connection, never disconnects.

use serde::{Deserialize, Serialize};

use crate::arbiter::InvocationOutcome;
use crate::error::ChatError;
use crate::extract::ToolInvocation;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Init {
        #[serde(default)]
        session_id: Option<String>,
    },
    Turn {
        content: String,
    },
    Decision {
        invocation_id: String,
        confirmed: bool,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Session {
        session_id: String,
    },
    Ack,
    StreamStart,
    StreamChunk {
        content: String,
    },
    StreamEnd,
    InvocationsPending {
        invocations: Vec<PendingInvocation>,
    },
    InvocationResult {
        #[serde(flatten)]
        outcome: InvocationOutcome,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Summary of an unresolved invocation surfaced for a peer decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingInvocation {
    pub id: String,
    pub name: String,
    pub parameters: Vec<(String, String)>,
}

impl From<&ToolInvocation> for PendingInvocation {
    fn from(invocation: &ToolInvocation) -> Self {
        Self {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            parameters: invocation.parameters.clone(),
        }
    }
}

pub fn parse_client_frame(text: &str) -> Result<ClientFrame, ChatError> {
    serde_json::from_str(text)
        .map_err(|e| ChatError::validation(format!("malformed frame: {}", e)))
}
