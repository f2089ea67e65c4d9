//! Conversation data model — messages, agent contributions, and the
//! context snapshot forwarded with each query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the assistant message of one exchange.
///
/// Updates are routed by this id, never by position in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeHandle(Uuid);

impl ExchangeHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id of the assistant message this handle targets.
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// An assistant turn that ended in failure.
    Error,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One intermediate output from a reasoning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContribution {
    pub agent_name: String,
    pub output_text: String,
    pub timestamp: DateTime<Utc>,
}

/// One agent's closing perspective, attached at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateEntry {
    pub agent_name: String,
    pub perspective_text: String,
}

/// A recommended next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action_text: String,
    /// Free-form on the wire (`high`, `medium`, `low` in practice).
    pub priority: String,
}

/// Everything a terminal `final` event sets on the open message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalPayload {
    pub content: String,
    pub insights: Vec<String>,
    pub actions: Vec<ActionItem>,
    pub debate: Vec<DebateEntry>,
    /// Opaque; rendered by a separate plan preview.
    pub plan_proposal: Option<serde_json::Value>,
}

/// One turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Unique message ID.
    pub id: Uuid,
    pub role: Role,
    /// Display text; empty for an assistant message until it closes.
    pub content: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debate: Vec<DebateEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insights: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionItem>,
    /// Agent outputs in arrival order. Append-only while open.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_deliberation: Vec<AgentContribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_proposal: Option<serde_json::Value>,
    /// Once true the message is frozen.
    pub closed: bool,
}

impl ConversationMessage {
    /// A user turn. Frozen from the start.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            closed: true,
            ..Self::blank(Uuid::new_v4(), Role::User, content.into())
        }
    }

    /// An empty, open assistant placeholder for `handle`.
    pub fn assistant_placeholder(handle: ExchangeHandle) -> Self {
        Self::blank(handle.id(), Role::Assistant, String::new())
    }

    fn blank(id: Uuid, role: Role, content: String) -> Self {
        Self {
            id,
            role,
            content,
            created_at: Utc::now(),
            debate: Vec::new(),
            insights: Vec::new(),
            actions: Vec::new(),
            raw_deliberation: Vec::new(),
            plan_proposal: None,
            closed: false,
        }
    }

    /// Whether this message still accepts updates.
    pub fn is_open(&self) -> bool {
        !self.closed
    }
}

// ── Context snapshot ────────────────────────────────────────────────────

/// Progress on one active goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSummary {
    pub title: String,
    /// Percent complete, 0–100.
    pub progress: f64,
}

/// The user's currently active action plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub title: String,
    #[serde(rename = "day")]
    pub current_day: u32,
    #[serde(rename = "focus")]
    pub focus_area: String,
}

/// What the user committed to ship today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitmentSummary {
    #[serde(rename = "commitment")]
    pub text: String,
    pub shipped: bool,
}

/// Read-only summary of dashboard state sent along with each query.
///
/// Assembled by the caller; this crate only forwards it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub active_goals: Vec<GoalSummary>,
    pub active_plan: Option<PlanSummary>,
    pub today_commitment: Option<CommitmentSummary>,
}

/// Notification broadcast to observers after every store mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationUpdate {
    /// A message was appended to the conversation.
    MessageAppended { message: ConversationMessage },
    /// An agent contribution was appended to an open message.
    StepApplied {
        id: Uuid,
        contribution: AgentContribution,
    },
    /// The message closed with a final answer.
    Finalized { message: ConversationMessage },
    /// The message closed as an error.
    Errored { message: ConversationMessage },
    /// Every message was removed.
    Cleared,
}
