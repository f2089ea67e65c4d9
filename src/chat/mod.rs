//! Streaming deliberation consumer.
//!
//! A query goes into the [`ConversationStore`], the [`ChatTransport`] opens
//! the response stream, the [`StreamFramer`] cuts it into frames, and the
//! [`EventDispatcher`] applies each decoded event to the open message.

pub mod classify;
pub mod client;
pub mod dispatch;
pub mod framer;
pub mod model;
pub mod store;
pub mod transport;

pub use classify::{ErrorKind, classify_backend_error};
pub use client::{ChatClient, ExchangeOutcome, ExchangeStatus};
pub use dispatch::{Decoded, Dispatch, EventDispatcher, StreamEvent, decode_event};
pub use framer::{Frame, FrameTooLarge, Pushed, StreamFramer};
pub use model::{
    ActionItem, AgentContribution, CommitmentSummary, ContextSnapshot, ConversationMessage,
    ConversationUpdate, DebateEntry, ExchangeHandle, FinalPayload, GoalSummary, PlanSummary, Role,
};
pub use store::ConversationStore;
pub use transport::{ByteStream, ChatRequest, ChatTransport, HttpTransport};
