//! Invocation arbiter: confirm/execute/cancel state machine.
//!
//! Tracks each candidate invocation from registration to exactly one terminal
//! state. Decisions against an id that is not pending are rejected with an
//! invalid-state error, never silently reapplied, so a tool can never run
//! twice off one directive.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::extract::ToolInvocation;
use crate::tools::ToolExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Executing,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Cancelled | InvocationStatus::Succeeded | InvocationStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Confirmed => "confirmed",
            InvocationStatus::Cancelled => "cancelled",
            InvocationStatus::Executing => "executing",
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
struct InvocationEntry {
    invocation: ToolInvocation,
    status: InvocationStatus,
    result: Option<String>,
    error: Option<String>,
}

/// Settled view of an invocation, reported to the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    pub id: String,
    pub name: String,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of registering a candidate invocation.
#[derive(Debug, Clone)]
pub enum Registration {
    /// Confirmation required; surfaced to the peer for a decision.
    Pending(ToolInvocation),
    /// Auto-executed; already settled.
    Completed(InvocationOutcome),
}

/// Invocation table scoped per conversation. `register`/`resolve` transitions
/// happen under the write lock; the executor itself is awaited outside it so
/// one slow tool never stalls other conversations.
pub struct Arbiter {
    table: RwLock<HashMap<String, HashMap<String, InvocationEntry>>>,
    executor: Arc<dyn ToolExecutor>,
}

impl Arbiter {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            executor,
        }
    }

    /// Register a candidate invocation. No-confirmation invocations go
    /// straight to executing; the rest stay pending until a decision arrives.
    ///
    /// Re-registering an id that is still live is rejected; a terminal id may
    /// be replaced (a retry is a fresh registration of an equivalent
    /// invocation).
    pub async fn register(
        &self,
        conversation_id: &str,
        invocation: ToolInvocation,
    ) -> Result<Registration, ChatError> {
        {
            let mut table = self.table.write().await;
            let entries = table.entry(conversation_id.to_string()).or_default();
            if let Some(existing) = entries.get(&invocation.id) {
                if !existing.status.is_terminal() {
                    return Err(ChatError::invalid_state(format!(
                        "invocation '{}' is already {}",
                        invocation.id,
                        existing.status.as_str()
                    )));
                }
            }

            let status = if invocation.requires_confirmation {
                InvocationStatus::Pending
            } else {
                InvocationStatus::Executing
            };
            entries.insert(
                invocation.id.clone(),
                InvocationEntry {
                    invocation: invocation.clone(),
                    status,
                    result: None,
                    error: None,
                },
            );

            if invocation.requires_confirmation {
                tracing::info!(
                    conversation = conversation_id,
                    invocation = %invocation.id,
                    tool = %invocation.name,
                    "invocation pending confirmation"
                );
                return Ok(Registration::Pending(invocation));
            }
        }

        Ok(Registration::Completed(
            self.run_executor(conversation_id, invocation).await,
        ))
    }

    /// Apply a peer decision. Valid only from `pending`: a cancel is
    /// terminal with no execution, a confirm executes synchronously.
    pub async fn resolve(
        &self,
        conversation_id: &str,
        invocation_id: &str,
        confirmed: bool,
    ) -> Result<InvocationOutcome, ChatError> {
        let invocation = {
            let mut table = self.table.write().await;
            let entries = table.get_mut(conversation_id).ok_or_else(|| {
                ChatError::not_found(format!(
                    "no invocations for conversation '{}'",
                    conversation_id
                ))
            })?;
            let entry = entries.get_mut(invocation_id).ok_or_else(|| {
                ChatError::not_found(format!("invocation '{}' not found", invocation_id))
            })?;

            if entry.status != InvocationStatus::Pending {
                return Err(ChatError::invalid_state(format!(
                    "invocation '{}' is {} and cannot be resolved",
                    invocation_id,
                    entry.status.as_str()
                )));
            }

            if !confirmed {
                entry.status = InvocationStatus::Cancelled;
                tracing::info!(
                    conversation = conversation_id,
                    invocation = invocation_id,
                    "invocation cancelled by peer"
                );
                return Ok(outcome_of(entry));
            }

            // Confirmed collapses straight into executing: execution starts
            // synchronously with the decision.
            entry.status = InvocationStatus::Executing;
            entry.invocation.clone()
        };

        Ok(self.run_executor(conversation_id, invocation).await)
    }

    pub async fn status(
        &self,
        conversation_id: &str,
        invocation_id: &str,
    ) -> Option<InvocationStatus> {
        self.table
            .read()
            .await
            .get(conversation_id)
            .and_then(|entries| entries.get(invocation_id))
            .map(|entry| entry.status)
    }

    /// Await the executor for an invocation already marked executing, then
    /// record its terminal state. Executor failures become the terminal error
    /// payload; they never propagate as session failures.
    async fn run_executor(
        &self,
        conversation_id: &str,
        invocation: ToolInvocation,
    ) -> InvocationOutcome {
        let execution = self
            .executor
            .execute(&invocation.name, &invocation.parameters)
            .await;

        let mut table = self.table.write().await;
        let entry = table
            .get_mut(conversation_id)
            .and_then(|entries| entries.get_mut(&invocation.id));
        let Some(entry) = entry else {
            // Table entry vanished out from under us; report without recording.
            return InvocationOutcome {
                id: invocation.id,
                name: invocation.name,
                status: InvocationStatus::Failed,
                result: None,
                error: Some("invocation record lost".to_string()),
            };
        };

        match execution {
            Ok(result) => {
                entry.status = InvocationStatus::Succeeded;
                entry.result = Some(result);
            }
            Err(error) => {
                entry.status = InvocationStatus::Failed;
                entry.error = Some(error.to_string());
                tracing::warn!(
                    conversation = conversation_id,
                    invocation = %invocation.id,
                    tool = %invocation.name,
                    error = %error,
                    "tool execution failed"
                );
            }
        }
        outcome_of(entry)
    }
}

fn outcome_of(entry: &InvocationEntry) -> InvocationOutcome {
    InvocationOutcome {
        id: entry.invocation.id.clone(),
        name: entry.invocation.name.clone(),
        status: entry.status,
        result: entry.result.clone(),
        error: entry.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        response: Result<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn ok(result: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(result.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Err(message.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedExecutor {
        async fn execute(&self, _name: &str, _parameters: &[(String, String)]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(result) => Ok(result.clone()),
                Err(message) => anyhow::bail!("{}", message),
            }
        }
    }

    fn invocation(id: &str, name: &str, requires_confirmation: bool) -> ToolInvocation {
        ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            parameters: vec![("input".to_string(), "x".to_string())],
            requires_confirmation,
        }
    }

    #[tokio::test]
    async fn safe_invocation_auto_executes() {
        let executor = ScriptedExecutor::ok("files: a.txt");
        let arbiter = Arbiter::new(executor.clone());

        let registration = arbiter
            .register("conv", invocation("list_files_0", "list_files", false))
            .await
            .unwrap();

        match registration {
            Registration::Completed(outcome) => {
                assert_eq!(outcome.status, InvocationStatus::Succeeded);
                assert_eq!(outcome.result.as_deref(), Some("files: a.txt"));
            }
            Registration::Pending(_) => panic!("expected auto-execution"),
        }
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn executor_failure_becomes_terminal_error_payload() {
        let executor = ScriptedExecutor::failing("disk on fire");
        let arbiter = Arbiter::new(executor.clone());

        let registration = arbiter
            .register("conv", invocation("list_files_0", "list_files", false))
            .await
            .unwrap();

        match registration {
            Registration::Completed(outcome) => {
                assert_eq!(outcome.status, InvocationStatus::Failed);
                assert!(outcome.error.unwrap().contains("disk on fire"));
            }
            Registration::Pending(_) => panic!("expected auto-execution"),
        }
    }

    #[tokio::test]
    async fn risky_invocation_waits_for_decision() {
        let executor = ScriptedExecutor::ok("done");
        let arbiter = Arbiter::new(executor.clone());

        let registration = arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await
            .unwrap();
        assert!(matches!(registration, Registration::Pending(_)));
        assert_eq!(
            arbiter.status("conv", "delete_file_0").await,
            Some(InvocationStatus::Pending)
        );
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn cancel_is_terminal_without_execution() {
        let executor = ScriptedExecutor::ok("done");
        let arbiter = Arbiter::new(executor.clone());
        arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await
            .unwrap();

        let outcome = arbiter.resolve("conv", "delete_file_0", false).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Cancelled);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn confirm_executes_and_settles() {
        let executor = ScriptedExecutor::ok("deleted a.txt");
        let arbiter = Arbiter::new(executor.clone());
        arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await
            .unwrap();

        let outcome = arbiter.resolve("conv", "delete_file_0", true).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Succeeded);
        assert_eq!(outcome.result.as_deref(), Some("deleted a.txt"));
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn second_resolve_is_rejected_and_does_not_re_execute() {
        let executor = ScriptedExecutor::ok("done");
        let arbiter = Arbiter::new(executor.clone());
        arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await
            .unwrap();
        arbiter.resolve("conv", "delete_file_0", true).await.unwrap();

        let second = arbiter.resolve("conv", "delete_file_0", true).await;
        assert!(matches!(second, Err(ChatError::InvalidState(_))));
        assert_eq!(
            arbiter.status("conv", "delete_file_0").await,
            Some(InvocationStatus::Succeeded)
        );
        assert_eq!(executor.call_count(), 1);

        let after_cancel_attempt = arbiter.resolve("conv", "delete_file_0", false).await;
        assert!(matches!(after_cancel_attempt, Err(ChatError::InvalidState(_))));
    }

    #[tokio::test]
    async fn resolving_unknown_invocation_is_not_found() {
        let arbiter = Arbiter::new(ScriptedExecutor::ok("done"));
        let result = arbiter.resolve("conv", "ghost_0", true).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn live_duplicate_registration_is_rejected() {
        let arbiter = Arbiter::new(ScriptedExecutor::ok("done"));
        arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await
            .unwrap();

        let duplicate = arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await;
        assert!(matches!(duplicate, Err(ChatError::InvalidState(_))));

        // After settling, an equivalent invocation may be registered afresh.
        arbiter.resolve("conv", "delete_file_0", false).await.unwrap();
        let retry = arbiter
            .register("conv", invocation("delete_file_0", "delete_file", true))
            .await;
        assert!(retry.is_ok());
    }
}
