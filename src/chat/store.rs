//! Conversation store — ordered in-memory message list with broadcast to
//! render-layer observers.

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use super::classify::ErrorKind;
use super::model::{
    AgentContribution, ContextSnapshot, ConversationMessage, ConversationUpdate, ExchangeHandle,
    FinalPayload, Role,
};
use crate::error::ChatError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Default)]
struct Conversation {
    messages: Vec<ConversationMessage>,
    /// The single exchange still awaiting a terminal event.
    open: Option<ExchangeHandle>,
}

impl Conversation {
    /// The open message for `handle`, if it exists and has not closed.
    fn open_message(&mut self, handle: ExchangeHandle) -> Option<&mut ConversationMessage> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.id == handle.id())
            .filter(|m| m.is_open())
    }

    fn release(&mut self, handle: ExchangeHandle) {
        if self.open == Some(handle) {
            self.open = None;
        }
    }
}

/// Single source of truth for one conversation's messages.
///
/// Every mutation happens under the write lock and broadcasts its
/// [`ConversationUpdate`] before the lock is released, so observers see
/// updates in exactly the order they were applied.
pub struct ConversationStore {
    inner: RwLock<Conversation>,
    tx: broadcast::Sender<ConversationUpdate>,
}

impl ConversationStore {
    /// Create an empty conversation.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            inner: RwLock::new(Conversation::default()),
            tx,
        })
    }

    /// Subscribe to conversation updates. Each renderer calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.tx.subscribe()
    }

    /// Start an exchange: append a frozen user message and an open assistant
    /// placeholder, returning the placeholder's handle.
    ///
    /// Fails with [`ChatError::Busy`] while another exchange is open and with
    /// [`ChatError::EmptyQuery`] for blank input; neither appends anything.
    pub async fn submit_query(
        &self,
        text: &str,
        context: ContextSnapshot,
    ) -> Result<ExchangeHandle, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyQuery);
        }

        let mut conv = self.inner.write().await;
        if let Some(open) = conv.open {
            warn!(exchange = %open, "Query rejected, exchange already open");
            return Err(ChatError::Busy { open });
        }

        let handle = ExchangeHandle::new();
        let user = ConversationMessage::user(text);
        let assistant = ConversationMessage::assistant_placeholder(handle);

        info!(
            exchange = %handle,
            goals = context.active_goals.len(),
            has_plan = context.active_plan.is_some(),
            "Exchange opened"
        );

        conv.messages.push(user.clone());
        let _ = self.tx.send(ConversationUpdate::MessageAppended { message: user });
        conv.messages.push(assistant.clone());
        let _ = self.tx.send(ConversationUpdate::MessageAppended { message: assistant });
        conv.open = Some(handle);

        Ok(handle)
    }

    /// Append an agent contribution. Returns false if the handle is unknown
    /// or already closed.
    pub async fn apply_step(&self, handle: ExchangeHandle, contribution: AgentContribution) -> bool {
        let mut conv = self.inner.write().await;
        let Some(msg) = conv.open_message(handle) else {
            return false;
        };

        debug!(
            exchange = %handle,
            agent = %contribution.agent_name,
            step = msg.raw_deliberation.len() + 1,
            "Agent step"
        );
        msg.raw_deliberation.push(contribution.clone());

        let _ = self.tx.send(ConversationUpdate::StepApplied {
            id: handle.id(),
            contribution,
        });
        true
    }

    /// Set the final answer and close. Returns false if already closed.
    pub async fn apply_final(&self, handle: ExchangeHandle, payload: FinalPayload) -> bool {
        let mut conv = self.inner.write().await;
        let Some(msg) = conv.open_message(handle) else {
            return false;
        };

        msg.content = payload.content;
        msg.insights = payload.insights;
        msg.actions = payload.actions;
        msg.debate = payload.debate;
        msg.plan_proposal = payload.plan_proposal;
        msg.closed = true;
        let finalized = msg.clone();

        info!(
            exchange = %handle,
            steps = finalized.raw_deliberation.len(),
            actions = finalized.actions.len(),
            "Exchange finalized"
        );

        conv.release(handle);
        let _ = self.tx.send(ConversationUpdate::Finalized { message: finalized });
        true
    }

    /// Close as an error with the classified text for `kind`.
    ///
    /// `raw_deliberation` is kept for diagnostics. Returns false if already
    /// closed.
    pub async fn apply_error(&self, handle: ExchangeHandle, kind: &ErrorKind) -> bool {
        let mut conv = self.inner.write().await;
        let Some(msg) = conv.open_message(handle) else {
            return false;
        };

        msg.role = Role::Error;
        msg.content = kind.user_message();
        msg.closed = true;
        let errored = msg.clone();

        warn!(
            exchange = %handle,
            kind = %kind,
            steps = errored.raw_deliberation.len(),
            "Exchange closed with error"
        );

        conv.release(handle);
        let _ = self.tx.send(ConversationUpdate::Errored { message: errored });
        true
    }

    /// Snapshot of every message, oldest first.
    pub async fn messages(&self) -> Vec<ConversationMessage> {
        self.inner.read().await.messages.clone()
    }

    /// Look up one message by its exchange handle.
    pub async fn message(&self, handle: ExchangeHandle) -> Option<ConversationMessage> {
        let conv = self.inner.read().await;
        conv.messages.iter().find(|m| m.id == handle.id()).cloned()
    }

    /// The exchange currently awaiting a terminal event, if any.
    pub async fn open_exchange(&self) -> Option<ExchangeHandle> {
        self.inner.read().await.open
    }

    /// Get the number of messages.
    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Check if the conversation is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }

    /// Drop every message. An open exchange is forgotten; its later events
    /// no longer match any message and are ignored.
    pub async fn clear(&self) -> usize {
        let mut conv = self.inner.write().await;
        let removed = conv.messages.len();
        conv.messages.clear();
        conv.open = None;

        info!(count = removed, "Conversation cleared");
        let _ = self.tx.send(ConversationUpdate::Cleared);
        removed
    }
}
