//! Event dispatcher — decodes frame payloads into [`StreamEvent`]s and
//! applies them to the conversation store.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::classify::ErrorKind;
use super::framer::Frame;
use super::model::{ActionItem, AgentContribution, DebateEntry, ExchangeHandle, FinalPayload};
use super::store::ConversationStore;
use crate::safety::strip_ansi;

// ── Wire protocol ───────────────────────────────────────────────────────

/// Event payload as sent by the deliberation backend.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Step {
        agent: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Final {
        data: WireFinal,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct WireFinal {
    #[serde(default)]
    final_response: String,
    #[serde(default)]
    key_insights: Vec<String>,
    #[serde(default)]
    actions: Vec<WireAction>,
    #[serde(default)]
    debate: Vec<WireDebate>,
    #[serde(default)]
    plan_proposal: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireAction {
    action: String,
    #[serde(default)]
    priority: String,
}

#[derive(Debug, Deserialize)]
struct WireDebate {
    agent: String,
    perspective: String,
}

const KNOWN_TYPES: &[&str] = &["step", "final", "error"];

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An agent produced intermediate output.
    Step(AgentContribution),
    /// The deliberation finished.
    Final(FinalPayload),
    /// The backend gave up.
    Error { message: String },
}

impl StreamEvent {
    /// Whether this event closes the exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final(_) | Self::Error { .. })
    }
}

/// Result of decoding one frame payload.
#[derive(Debug)]
pub enum Decoded {
    Event(StreamEvent),
    /// Valid JSON with a `type` this client does not know.
    Unknown(String),
    /// Not JSON, or JSON that does not match any event shape.
    Malformed(serde_json::Error),
}

/// Decode one frame payload. Agent output is sanitized here, at the boundary.
pub fn decode_event(payload: &str) -> Decoded {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return Decoded::Malformed(e),
    };

    if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
        if !KNOWN_TYPES.contains(&kind) {
            return Decoded::Unknown(kind.to_string());
        }
    }

    let wire: WireEvent = match serde_json::from_value(value) {
        Ok(w) => w,
        Err(e) => return Decoded::Malformed(e),
    };

    let event = match wire {
        WireEvent::Step {
            agent,
            output,
            timestamp,
        } => StreamEvent::Step(AgentContribution {
            agent_name: agent,
            output_text: strip_ansi(&output),
            timestamp: parse_timestamp(timestamp.as_deref()),
        }),
        WireEvent::Final { data } => StreamEvent::Final(FinalPayload {
            content: data.final_response,
            insights: data.key_insights,
            actions: data
                .actions
                .into_iter()
                .map(|a| ActionItem {
                    action_text: a.action,
                    priority: a.priority,
                })
                .collect(),
            debate: data
                .debate
                .into_iter()
                .map(|d| DebateEntry {
                    agent_name: d.agent,
                    perspective_text: strip_ansi(&d.perspective),
                })
                .collect(),
            plan_proposal: data.plan_proposal.filter(|p| !p.is_null()),
        }),
        WireEvent::Error { message } => StreamEvent::Error { message },
    };

    Decoded::Event(event)
}

/// Accepts RFC 3339 and offset-less ISO-8601 (taken as UTC). Falls back to now.
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    debug!(timestamp = %raw, "Unparsable step timestamp, using receive time");
    Utc::now()
}

// ── Dispatcher ──────────────────────────────────────────────────────────

/// What applying a frame did to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing terminal happened; keep reading.
    Continue,
    /// A `final` event closed the exchange.
    Finalized,
    /// An `error` event closed the exchange.
    Errored(ErrorKind),
}

/// Routes decoded events for one exchange into the store.
pub struct EventDispatcher {
    store: Arc<ConversationStore>,
    handle: ExchangeHandle,
}

impl EventDispatcher {
    pub fn new(store: Arc<ConversationStore>, handle: ExchangeHandle) -> Self {
        Self { store, handle }
    }

    pub fn handle(&self) -> ExchangeHandle {
        self.handle
    }

    /// Decode and apply one frame. Bad frames are logged and skipped.
    pub async fn dispatch(&self, frame: &Frame) -> Dispatch {
        match decode_event(&frame.data) {
            Decoded::Event(event) => self.apply(event).await,
            Decoded::Unknown(kind) => {
                warn!(exchange = %self.handle, event_type = %kind, "Ignoring unknown event type");
                Dispatch::Continue
            }
            Decoded::Malformed(e) => {
                warn!(
                    exchange = %self.handle,
                    error = %e,
                    payload_bytes = frame.data.len(),
                    "Dropping malformed frame"
                );
                Dispatch::Continue
            }
        }
    }

    /// Apply an already-decoded event. Events after close are ignored.
    pub async fn apply(&self, event: StreamEvent) -> Dispatch {
        match event {
            StreamEvent::Step(contribution) => {
                if !self.store.apply_step(self.handle, contribution).await {
                    debug!(exchange = %self.handle, "Step after close ignored");
                }
                Dispatch::Continue
            }
            StreamEvent::Final(payload) => {
                if self.store.apply_final(self.handle, payload).await {
                    Dispatch::Finalized
                } else {
                    debug!(exchange = %self.handle, "Final after close ignored");
                    Dispatch::Continue
                }
            }
            StreamEvent::Error { message } => {
                let kind = ErrorKind::Backend(message);
                if self.store.apply_error(self.handle, &kind).await {
                    Dispatch::Errored(kind)
                } else {
                    debug!(exchange = %self.handle, "Error after close ignored");
                    Dispatch::Continue
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::model::{ContextSnapshot, Role};

    fn frame(data: &str) -> Frame {
        Frame {
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_step_and_strips_ansi() {
        let decoded = decode_event(
            r#"{"type":"step","agent":"Analyst","output":"\u001b[32mChecking repos\u001b[0m","timestamp":"2025-01-01T10:00:00.123456"}"#,
        );
        let Decoded::Event(StreamEvent::Step(c)) = decoded else {
            panic!("expected step, got {:?}", decoded);
        };
        assert_eq!(c.agent_name, "Analyst");
        assert_eq!(c.output_text, "Checking repos");
        assert_eq!(c.timestamp.to_rfc3339(), "2025-01-01T10:00:00.123456+00:00");
    }

    #[test]
    fn decodes_final() {
        let decoded = decode_event(
            r#"{"type":"final","data":{"final_response":"Focus.","key_insights":["a"],"actions":[{"action":"Finish","priority":"high"}],"plan_proposal":null}}"#,
        );
        let Decoded::Event(StreamEvent::Final(p)) = decoded else {
            panic!("expected final, got {:?}", decoded);
        };
        assert_eq!(p.content, "Focus.");
        assert_eq!(p.insights, vec!["a"]);
        assert_eq!(p.actions[0].action_text, "Finish");
        assert_eq!(p.actions[0].priority, "high");
        assert!(p.plan_proposal.is_none());
        assert!(p.debate.is_empty());
    }

    #[test]
    fn unknown_and_malformed_are_distinguished() {
        assert!(matches!(
            decode_event(r#"{"type":"progress","pct":40}"#),
            Decoded::Unknown(kind) if kind == "progress"
        ));
        assert!(matches!(decode_event("{not json"), Decoded::Malformed(_)));
        assert!(matches!(
            decode_event(r#"{"type":"step"}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(decode_event(r#"{"agent":"x"}"#), Decoded::Malformed(_)));
    }

    #[test]
    fn timestamp_formats() {
        let ts = parse_timestamp(Some("2025-03-04T05:06:07Z"));
        assert_eq!(ts.to_rfc3339(), "2025-03-04T05:06:07+00:00");
        let ts = parse_timestamp(Some("2025-03-04T07:06:07+02:00"));
        assert_eq!(ts.to_rfc3339(), "2025-03-04T05:06:07+00:00");
        let before = Utc::now();
        assert!(parse_timestamp(Some("yesterday")) >= before);
    }

    #[tokio::test]
    async fn dispatch_routes_to_handle() {
        let store = ConversationStore::new();
        let handle = store
            .submit_query("hi", ContextSnapshot::default())
            .await
            .unwrap();
        let dispatcher = EventDispatcher::new(Arc::clone(&store), handle);

        let outcome = dispatcher
            .dispatch(&frame(r#"{"type":"step","agent":"A","output":"x"}"#))
            .await;
        assert_eq!(outcome, Dispatch::Continue);

        let outcome = dispatcher.dispatch(&frame("garbage")).await;
        assert_eq!(outcome, Dispatch::Continue);

        let outcome = dispatcher
            .dispatch(&frame(r#"{"type":"error","message":"boom"}"#))
            .await;
        assert_eq!(outcome, Dispatch::Errored(ErrorKind::Backend("boom".into())));

        let msg = store.message(handle).await.unwrap();
        assert_eq!(msg.role, Role::Error);
        assert_eq!(msg.content, "Error: boom");
        assert_eq!(msg.raw_deliberation.len(), 1);
    }

    #[tokio::test]
    async fn terminal_after_terminal_is_ignored() {
        let store = ConversationStore::new();
        let handle = store
            .submit_query("hi", ContextSnapshot::default())
            .await
            .unwrap();
        let dispatcher = EventDispatcher::new(Arc::clone(&store), handle);

        let first = dispatcher
            .dispatch(&frame(r#"{"type":"final","data":{"final_response":"done"}}"#))
            .await;
        assert_eq!(first, Dispatch::Finalized);

        let second = dispatcher
            .dispatch(&frame(r#"{"type":"error","message":"late"}"#))
            .await;
        assert_eq!(second, Dispatch::Continue);

        let msg = store.message(handle).await.unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "done");
    }
}
