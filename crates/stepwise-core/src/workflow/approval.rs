//! Approval subsystem: human-in-the-loop gates.
//!
//! `ApprovalService` owns approval records. `HumanApprovalHandler` is the
//! `human_approval` step: its first call creates a request and suspends, and
//! later calls read the decision. The handler never creates a second request
//! for the same `(execution_id, step_id)`, so crash-recovery replays are safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use stepwise_types::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_types::config::ApprovalTimeoutPolicy;
use stepwise_types::workflow::StepDefinition;
use uuid::Uuid;

use crate::repository::approval::ApprovalRepository;

use super::context::ExecutionContext;
use super::registry::{RESUME_SIGNAL_KEY, StepError, StepHandler, StepOutcome};
use super::variables::{InjectOptions, inject};

/// Partial-state key recording the request of a waiting approval step.
pub const APPROVAL_ID_KEY: &str = "approval_id";

/// `decided_by` recorded when a request is closed by its timeout.
const TIMEOUT_DECIDER: &str = "timeout";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),

    #[error("approval request {approval_id} was already decided: {decision}")]
    AlreadyDecided {
        approval_id: Uuid,
        decision: ApprovalDecision,
    },

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("approval repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// ApprovalService
// ---------------------------------------------------------------------------

/// Creates, lists and decides approval requests.
pub struct ApprovalService<A: ApprovalRepository> {
    repo: Arc<A>,
}

impl<A: ApprovalRepository> ApprovalService<A> {
    pub fn new(repo: Arc<A>) -> Self {
        Self { repo }
    }

    pub async fn create(
        &self,
        execution_id: Uuid,
        step_id: &str,
        prompt: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = ApprovalRequest::new(execution_id, step_id, prompt, expires_at);
        self.repo
            .create_approval(&request)
            .await
            .map_err(|e| ApprovalError::Repository(e.to_string()))?;
        tracing::info!(
            approval_id = %request.approval_id,
            execution_id = %execution_id,
            step_id,
            expires_at = ?expires_at,
            "approval requested"
        );
        Ok(request)
    }

    pub async fn get(&self, approval_id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.repo
            .get_approval(&approval_id)
            .await
            .map_err(|e| ApprovalError::Repository(e.to_string()))?
            .ok_or(ApprovalError::NotFound(approval_id))
    }

    /// Latest request created for a step, if any.
    pub async fn find_for_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, ApprovalError> {
        self.repo
            .find_approval_for_step(&execution_id, step_id)
            .await
            .map_err(|e| ApprovalError::Repository(e.to_string()))
    }

    pub async fn list(
        &self,
        execution_id: Option<Uuid>,
        decision: Option<ApprovalDecision>,
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.repo
            .list_approvals(execution_id.as_ref(), decision)
            .await
            .map_err(|e| ApprovalError::Repository(e.to_string()))
    }

    /// Decide a pending request. Decided requests are immutable.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        payload: Option<Value>,
        decided_by: Option<&str>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if decision == ApprovalDecision::Pending {
            return Err(ApprovalError::InvalidDecision(
                "a decision must be approved or denied".to_string(),
            ));
        }
        let recorded = self
            .repo
            .record_decision(&approval_id, decision, payload.as_ref(), decided_by, Utc::now())
            .await
            .map_err(|e| ApprovalError::Repository(e.to_string()))?;
        let request = self.get(approval_id).await?;
        if !recorded {
            return Err(ApprovalError::AlreadyDecided {
                approval_id,
                decision: request.decision,
            });
        }
        tracing::info!(
            approval_id = %approval_id,
            execution_id = %request.execution_id,
            step_id = request.step_id.as_str(),
            decision = %decision,
            "approval decided"
        );
        Ok(request)
    }

    /// Pending requests whose expiry has passed, oldest first.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let pending = self.list(None, Some(ApprovalDecision::Pending)).await?;
        Ok(pending.into_iter().filter(|r| r.is_expired(now)).collect())
    }
}

// ---------------------------------------------------------------------------
// HumanApprovalHandler
// ---------------------------------------------------------------------------

/// Handler for the `human_approval` step type.
///
/// Parameters: `prompt` (template), `timeout_seconds`, `on_timeout`
/// (`deny` | `timeout` | `fail`, overriding the engine default). A decision
/// (`decision`, `payload`, `decided_by`) or `timed_out` is read from the
/// resume signal only.
pub struct HumanApprovalHandler<A: ApprovalRepository> {
    service: Arc<ApprovalService<A>>,
    default_policy: ApprovalTimeoutPolicy,
}

impl<A: ApprovalRepository> HumanApprovalHandler<A> {
    pub fn new(service: Arc<ApprovalService<A>>, default_policy: ApprovalTimeoutPolicy) -> Self {
        Self {
            service,
            default_policy,
        }
    }

    fn policy(&self, step: &StepDefinition) -> Result<ApprovalTimeoutPolicy, StepError> {
        match step.parameters.get("on_timeout") {
            None | Some(Value::Null) => Ok(self.default_policy),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                StepError::InvalidParameters(format!(
                    "'on_timeout' must be one of deny, timeout, fail (got {value})"
                ))
            }),
        }
    }

    fn timeout(step: &StepDefinition) -> Result<Option<Duration>, StepError> {
        match step.parameters.get("timeout_seconds") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .filter(|secs| *secs > 0)
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| {
                    StepError::InvalidParameters(
                        "'timeout_seconds' must be a positive integer".to_string(),
                    )
                }),
        }
    }

    /// The request owned by this step, if one was already created.
    async fn existing_request(
        &self,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, StepError> {
        let recorded = input
            .get(APPROVAL_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let found = match recorded {
            Some(approval_id) => match self.service.get(approval_id).await {
                Ok(request) => Some(request),
                Err(ApprovalError::NotFound(_)) => None,
                Err(e) => return Err(StepError::Unavailable(e.to_string())),
            },
            None => None,
        };
        match found {
            Some(request) => Ok(Some(request)),
            None => self
                .service
                .find_for_step(ctx.execution_id(), step_id)
                .await
                .map_err(|e| StepError::Unavailable(e.to_string())),
        }
    }

    /// Close a still-pending request; a concurrent decision wins.
    async fn close(
        &self,
        request: &ApprovalRequest,
        decision: ApprovalDecision,
        payload: Option<Value>,
        decided_by: Option<&str>,
    ) -> Result<ApprovalRequest, StepError> {
        match self
            .service
            .decide(request.approval_id, decision, payload, decided_by)
            .await
        {
            Ok(decided) => Ok(decided),
            Err(ApprovalError::AlreadyDecided { .. }) => self
                .service
                .get(request.approval_id)
                .await
                .map_err(|e| StepError::Unavailable(e.to_string())),
            Err(e) => Err(StepError::Unavailable(e.to_string())),
        }
    }

    fn decided(request: &ApprovalRequest) -> StepOutcome {
        let mut output = Map::new();
        output.insert("decision".to_string(), json!(request.decision));
        output.insert(
            "payload".to_string(),
            request.payload.clone().unwrap_or(Value::Null),
        );
        if request.decided_by.as_deref() == Some(TIMEOUT_DECIDER) {
            output.insert("timed_out".to_string(), Value::Bool(true));
        }
        StepOutcome::completed(output)
    }

    fn waiting(request: &ApprovalRequest, now: DateTime<Utc>) -> StepOutcome {
        let mut partial = Map::new();
        partial.insert(APPROVAL_ID_KEY.to_string(), json!(request.approval_id));
        let outcome = StepOutcome::waiting(partial);
        match request.expires_at {
            Some(expires_at) => {
                let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
                outcome.with_resume_after(remaining)
            }
            None => outcome,
        }
    }
}

impl<A: ApprovalRepository + 'static> StepHandler for HumanApprovalHandler<A> {
    async fn execute(
        &self,
        step: &StepDefinition,
        input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let policy = self.policy(step)?;
        let timeout = Self::timeout(step)?;
        let now = Utc::now();

        let Some(request) = self.existing_request(&input, ctx, &step.step_id).await? else {
            let template = step
                .parameters
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Approval required for step '{}'", step.display_name()));
            let prompt = inject(&template, &input, Some(ctx), &InjectOptions::default());
            let expires_at = timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .and_then(|t| now.checked_add_signed(t));
            let request = self
                .service
                .create(ctx.execution_id(), &step.step_id, &prompt, expires_at)
                .await
                .map_err(|e| StepError::Unavailable(e.to_string()))?;
            return Ok(Self::waiting(&request, now));
        };

        if !request.is_pending() {
            return Ok(Self::decided(&request));
        }

        // Mapped inputs never decide; only the signal that resumed the step.
        let signal = input
            .get(RESUME_SIGNAL_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // A decision delivered straight through `resume`, without the service.
        if let Some(raw) = signal.get("decision").and_then(Value::as_str) {
            let decision: ApprovalDecision = raw
                .parse()
                .map_err(StepError::InvalidParameters)?;
            let payload = signal.get("payload").cloned().filter(|p| !p.is_null());
            let decided = self
                .close(&request, decision, payload, signal.get("decided_by").and_then(Value::as_str))
                .await?;
            return Ok(Self::decided(&decided));
        }

        let timed_out = signal
            .get("timed_out")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || request.is_expired(now);
        if !timed_out {
            return Ok(Self::waiting(&request, now));
        }

        tracing::warn!(
            execution_id = %ctx.execution_id(),
            step_id = step.step_id.as_str(),
            approval_id = %request.approval_id,
            policy = ?policy,
            "approval timed out"
        );
        let closed = self
            .close(&request, ApprovalDecision::Denied, None, Some(TIMEOUT_DECIDER))
            .await?;
        if closed.decided_by.as_deref() != Some(TIMEOUT_DECIDER) {
            // A real decision landed first.
            return Ok(Self::decided(&closed));
        }
        Ok(match policy {
            ApprovalTimeoutPolicy::Deny => Self::decided(&closed),
            ApprovalTimeoutPolicy::Fail => StepOutcome::failed("approval timed out"),
            ApprovalTimeoutPolicy::Timeout => {
                StepOutcome::failed("approval timed out").with_timed_out()
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
