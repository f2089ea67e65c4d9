//! Chat client — runs one exchange from submission to its terminal event.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::ErrorKind;
use super::dispatch::{Dispatch, EventDispatcher};
use super::framer::StreamFramer;
use super::model::{ContextSnapshot, ExchangeHandle};
use super::store::ConversationStore;
use super::transport::{ByteStream, ChatRequest, ChatTransport};
use crate::config::ChatConfig;
use crate::error::ChatError;

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    Finalized,
    Errored(ErrorKind),
}

/// Result of [`ChatClient::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub handle: ExchangeHandle,
    pub status: ExchangeStatus,
}

/// Submits queries and streams the deliberation into a [`ConversationStore`].
pub struct ChatClient {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    idle_timeout: Duration,
    max_frame_bytes: usize,
}

impl ChatClient {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            transport,
            idle_timeout: config.stream_idle_timeout,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// The store this client writes to.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Submit `text` and drive the exchange until it closes.
    ///
    /// Only [`ChatError::Busy`] and [`ChatError::EmptyQuery`] are returned as
    /// errors, and in both cases nothing was appended. Every other failure
    /// (transport, backend, cancellation) closes the assistant message as an
    /// error and is reported in the outcome. Nothing is retried.
    pub async fn send(
        &self,
        text: &str,
        context: ContextSnapshot,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, ChatError> {
        let handle = self.store.submit_query(text, context.clone()).await?;
        let guard = OpenExchangeGuard::new(Arc::clone(&self.store), handle);
        let request = ChatRequest {
            message: text.to_string(),
            context,
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transport.open_stream(&request) => Some(result),
        };

        let status = match opened {
            None => self.close(handle, ErrorKind::Cancelled).await,
            Some(Err(e)) => {
                warn!(exchange = %handle, error = %e, "Failed to open chat stream");
                self.close(handle, ErrorKind::RequestFailed).await
            }
            Some(Ok(stream)) => self.pump(handle, stream, &cancel).await,
        };
        guard.disarm();

        Ok(ExchangeOutcome { handle, status })
    }

    /// Feed chunks through the framer and dispatcher until a terminal event,
    /// end of stream, failure, timeout, or cancellation.
    ///
    /// The stream is dropped once the chunk carrying the terminal event has
    /// been dispatched; later frames in that chunk hit a closed message and
    /// are ignored.
    async fn pump(
        &self,
        handle: ExchangeHandle,
        mut stream: ByteStream,
        cancel: &CancellationToken,
    ) -> ExchangeStatus {
        let dispatcher = EventDispatcher::new(Arc::clone(&self.store), handle);
        let mut framer = StreamFramer::new(self.max_frame_bytes);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(exchange = %handle, "Exchange cancelled");
                    return self.close(handle, ErrorKind::Cancelled).await;
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let Ok(next) = next else {
                warn!(exchange = %handle, timeout = ?self.idle_timeout, "Chat stream idle");
                return self.close(handle, ErrorKind::TimedOut).await;
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!(exchange = %handle, error = %e, "Chat stream interrupted");
                    return self.close(handle, ErrorKind::ConnectionInterrupted).await;
                }
                None => break,
            };

            let pushed = framer.push(&chunk);

            let mut terminal = None;
            for frame in &pushed.frames {
                match dispatcher.dispatch(frame).await {
                    Dispatch::Continue => {}
                    Dispatch::Finalized => terminal = Some(ExchangeStatus::Finalized),
                    Dispatch::Errored(kind) => terminal = Some(ExchangeStatus::Errored(kind)),
                }
            }
            if let Some(status) = terminal {
                debug!(exchange = %handle, "Terminal event received, closing stream");
                framer.finish();
                return status;
            }
            if let Some(e) = pushed.overflow {
                warn!(exchange = %handle, error = %e, "Oversized frame");
                return self.close(handle, ErrorKind::FrameTooLarge).await;
            }
        }

        let pending_bytes = framer.finish();
        warn!(exchange = %handle, pending_bytes, "Stream ended without a terminal event");
        self.close(handle, ErrorKind::IncompleteResponse).await
    }

    async fn close(&self, handle: ExchangeHandle, kind: ErrorKind) -> ExchangeStatus {
        self.store.apply_error(handle, &kind).await;
        ExchangeStatus::Errored(kind)
    }
}

/// Closes the exchange as cancelled if `send` is dropped before it finishes.
struct OpenExchangeGuard {
    store: Arc<ConversationStore>,
    handle: ExchangeHandle,
    armed: bool,
}

impl OpenExchangeGuard {
    fn new(store: Arc<ConversationStore>, handle: ExchangeHandle) -> Self {
        Self {
            store,
            handle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenExchangeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(exchange = %self.handle, "No runtime to close abandoned exchange");
            return;
        };
        info!(exchange = %self.handle, "Exchange abandoned, closing as cancelled");
        let store = Arc::clone(&self.store);
        let handle = self.handle;
        runtime.spawn(async move {
            store.apply_error(handle, &ErrorKind::Cancelled).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::model::{ConversationUpdate, Role};
    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::Mutex;

    /// Replays canned chunks; a `None` entry yields a transport error.
    struct ScriptedTransport {
        chunks: Mutex<Option<Vec<Option<Vec<u8>>>>>,
        hang_after: bool,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<Option<&[u8]>>) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Some(
                    chunks.into_iter().map(|c| c.map(|b| b.to_vec())).collect(),
                )),
                hang_after: false,
            })
        }

        fn hanging(chunks: Vec<&[u8]>) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Some(chunks.into_iter().map(|b| Some(b.to_vec())).collect())),
                hang_after: true,
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, _request: &ChatRequest) -> Result<ByteStream, ChatError> {
            let chunks = self.chunks.lock().await.take().unwrap_or_default();
            let items = stream::iter(chunks.into_iter().map(|c| {
                c.ok_or_else(|| ChatError::Stream("connection reset".into()))
            }));
            if self.hang_after {
                Ok(Box::pin(items.chain(stream::pending())))
            } else {
                Ok(Box::pin(items))
            }
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl ChatTransport for RefusingTransport {
        async fn open_stream(&self, _request: &ChatRequest) -> Result<ByteStream, ChatError> {
            Err(ChatError::Http {
                status: 500,
                body: "boom".into(),
            })
        }
    }

    fn client(transport: Arc<dyn ChatTransport>) -> ChatClient {
        let config = ChatConfig {
            stream_idle_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        ChatClient::new(ConversationStore::new(), transport, &config)
    }

    const STEP_ANALYST: &[u8] = b"data: {\"type\":\"step\",\"agent\":\"Analyst\",\"output\":\"\\u001b[32mChecking repos\\u001b[0m\",\"timestamp\":\"2025-01-01T10:00:00\"}\n\n";
    const STEP_PSYCH: &[u8] = b"data: {\"type\":\"step\",\"agent\":\"Psychologist\",\"output\":\"Pattern detected\",\"timestamp\":\"2025-01-01T10:00:01\"}\n\n";
    const FINAL: &[u8] = b"data: {\"type\":\"final\",\"data\":{\"final_response\":\"Focus on depth, not breadth.\",\"key_insights\":[\"You context-switch often\"],\"actions\":[{\"action\":\"Finish current project\",\"priority\":\"high\"}],\"plan_proposal\":null}}\n\n";

    #[tokio::test]
    async fn end_to_end_example() {
        let mut body = Vec::new();
        body.extend_from_slice(STEP_ANALYST);
        body.extend_from_slice(STEP_PSYCH);
        body.extend_from_slice(FINAL);
        // deliver in awkward 7-byte pieces
        let chunks: Vec<Option<&[u8]>> = body.chunks(7).map(Some).collect();
        let client = client(ScriptedTransport::new(chunks));

        let outcome = client
            .send(
                "Should I learn a new framework?",
                ContextSnapshot::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Finalized);

        let msg = client.store().message(outcome.handle).await.unwrap();
        let steps: Vec<(&str, &str)> = msg
            .raw_deliberation
            .iter()
            .map(|c| (c.agent_name.as_str(), c.output_text.as_str()))
            .collect();
        assert_eq!(
            steps,
            vec![("Analyst", "Checking repos"), ("Psychologist", "Pattern detected")]
        );
        assert_eq!(msg.content, "Focus on depth, not breadth.");
        assert_eq!(msg.insights, vec!["You context-switch often"]);
        assert_eq!(msg.actions[0].action_text, "Finish current project");
        assert!(msg.closed);
        assert_eq!(client.store().open_exchange().await, None);
    }

    #[tokio::test]
    async fn malformed_frame_then_final() {
        let client = client(ScriptedTransport::new(vec![
            Some(&b"data: {\"type\":\"step\",\"agent\":\n\n"[..]),
            Some(FINAL),
        ]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Finalized);
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.content, "Focus on depth, not breadth.");
        assert!(msg.raw_deliberation.is_empty());
    }

    #[tokio::test]
    async fn step_after_final_is_ignored() {
        let client = client(ScriptedTransport::new(vec![
            Some(STEP_ANALYST),
            Some(FINAL),
            Some(STEP_PSYCH),
        ]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.raw_deliberation.len(), 1);
        assert_eq!(outcome.status, ExchangeStatus::Finalized);
    }

    #[tokio::test]
    async fn backend_error_event() {
        let client = client(ScriptedTransport::new(vec![
            Some(STEP_ANALYST),
            Some(STEP_PSYCH),
            Some(&b"data: {\"type\":\"error\",\"message\":\"Invalid API Key\"}\n\n"[..]),
        ]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        let ExchangeStatus::Errored(kind) = &outcome.status else {
            panic!("expected error, got {:?}", outcome.status);
        };
        assert!(kind.is_credential_error());

        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.role, Role::Error);
        assert_eq!(msg.raw_deliberation.len(), 2);
        assert_eq!(msg.content, crate::chat::classify::CREDENTIAL_MESSAGE);
    }

    #[tokio::test]
    async fn transport_failure_mid_stream() {
        let client = client(ScriptedTransport::new(vec![Some(STEP_ANALYST), None]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            ExchangeStatus::Errored(ErrorKind::ConnectionInterrupted)
        );
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.role, Role::Error);
        assert_eq!(msg.raw_deliberation.len(), 1);
        assert!(msg.closed);
    }

    #[tokio::test]
    async fn clean_eof_without_terminal() {
        let client = client(ScriptedTransport::new(vec![Some(STEP_ANALYST)]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            ExchangeStatus::Errored(ErrorKind::IncompleteResponse)
        );
        assert_eq!(client.store().open_exchange().await, None);
    }

    #[tokio::test]
    async fn refused_request() {
        let client = client(Arc::new(RefusingTransport));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Errored(ErrorKind::RequestFailed));
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.content, "Failed to get response. Please try again.");
    }

    #[tokio::test]
    async fn idle_timeout_closes_exchange() {
        let client = client(ScriptedTransport::hanging(vec![STEP_ANALYST]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Errored(ErrorKind::TimedOut));
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.raw_deliberation.len(), 1);
    }

    #[tokio::test]
    async fn returns_on_final_without_waiting_for_eof() {
        let client = client(ScriptedTransport::hanging(vec![FINAL]));
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            client.send("q", ContextSnapshot::default(), CancellationToken::new()),
        )
        .await
        .expect("send should return as soon as the final frame lands")
        .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Finalized);
    }

    #[tokio::test]
    async fn step_after_final_in_same_chunk_is_ignored() {
        let mut body = FINAL.to_vec();
        body.extend_from_slice(STEP_PSYCH);
        let client = client(ScriptedTransport::new(vec![Some(&body[..])]));
        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Finalized);
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert!(msg.raw_deliberation.is_empty());
    }

    #[tokio::test]
    async fn cancellation_closes_exchange() {
        let transport = ScriptedTransport::hanging(vec![STEP_ANALYST]);
        let client = Arc::new(ChatClient::new(
            ConversationStore::new(),
            transport,
            &ChatConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let mut rx = client.store().subscribe();

        let task = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .send("q", ContextSnapshot::default(), cancel)
                    .await
                    .unwrap()
            })
        };

        // wait until the step has landed, then abort
        loop {
            if let ConversationUpdate::StepApplied { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Errored(ErrorKind::Cancelled));
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.role, Role::Error);
        assert_eq!(msg.raw_deliberation.len(), 1);
        assert!(msg.closed);
    }

    #[tokio::test]
    async fn dropped_send_closes_exchange() {
        let client = client(ScriptedTransport::hanging(vec![STEP_ANALYST]));
        let mut rx = client.store().subscribe();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.send("q", ContextSnapshot::default(), CancellationToken::new()),
        )
        .await;
        assert!(abandoned.is_err());

        let closed = loop {
            if let ConversationUpdate::Errored { message } = rx.recv().await.unwrap() {
                break message;
            }
        };
        assert_eq!(closed.role, Role::Error);
        assert_eq!(closed.content, ErrorKind::Cancelled.user_message());
        assert_eq!(closed.raw_deliberation.len(), 1);
        assert_eq!(client.store().open_exchange().await, None);

        // the transport has nothing left, so the retry idles out
        let retry = client
            .send("q again", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(retry.handle.id(), closed.id);
        assert_eq!(retry.status, ExchangeStatus::Errored(ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn oversized_frame_keeps_earlier_steps() {
        let mut body = STEP_ANALYST.to_vec();
        body.extend(std::iter::repeat_n(b'x', 300));
        let transport = ScriptedTransport::new(vec![Some(&body[..])]);
        let config = ChatConfig {
            max_frame_bytes: 256,
            ..Default::default()
        };
        let client = ChatClient::new(ConversationStore::new(), transport, &config);

        let outcome = client
            .send("q", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Errored(ErrorKind::FrameTooLarge));
        let msg = client.store().message(outcome.handle).await.unwrap();
        assert_eq!(msg.raw_deliberation.len(), 1);
        assert_eq!(msg.raw_deliberation[0].output_text, "Checking repos");
    }

    #[tokio::test]
    async fn busy_while_open() {
        let transport = ScriptedTransport::hanging(vec![]);
        let client = Arc::new(ChatClient::new(
            ConversationStore::new(),
            transport,
            &ChatConfig::default(),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move { client.send("first", ContextSnapshot::default(), cancel).await })
        };

        while client.store().open_exchange().await.is_none() {
            tokio::task::yield_now().await;
        }

        let err = client
            .send("second", ContextSnapshot::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Busy { .. }));
        assert_eq!(client.store().len().await, 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
