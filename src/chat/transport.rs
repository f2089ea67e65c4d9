//! Transport seam — opens the streaming network exchange for a query.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use super::model::ContextSnapshot;
use crate::config::ChatConfig;
use crate::error::ChatError;

/// Header carrying the user's reasoning-backend key.
pub const CREDENTIAL_HEADER: &str = "X-Groq-Key";

/// Error bodies are only read this far.
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Raw response chunks, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChatError>> + Send>>;

/// Request body for one exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub context: ContextSnapshot,
}

/// Opens a streaming exchange with the deliberation backend.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send `request` and return the response body as a chunk stream.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;
}

/// HTTP transport: `POST {api_url}/chat/{username}` with a JSON body.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    credential: Option<SecretString>,
}

impl HttpTransport {
    /// Build a transport. The credential is passed in explicitly; it is sent
    /// as [`CREDENTIAL_HEADER`] when present.
    pub fn new(config: &ChatConfig, credential: Option<SecretString>) -> Result<Self, ChatError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.chat_url(),
            credential,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.credential {
            builder = builder.header(CREDENTIAL_HEADER, key.expose_secret());
        }

        debug!(url = %self.url, has_credential = self.credential.is_some(), "Opening chat stream");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = read_capped_body(response).await;
            warn!(status = %status, "Chat request refused");
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ChatError::from));
        Ok(Box::pin(stream))
    }
}

async fn read_capped_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
