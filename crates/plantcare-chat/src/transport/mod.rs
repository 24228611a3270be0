//! Transport contract between the reply pipeline and the chat endpoint.

use std::pin::Pin;

use bytes::Bytes;

use crate::errors::TransportError;
use crate::message::ConversationMessage;

mod http;

pub use http::HttpChatTransport;

/// Raw response body chunks, in arrival order.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// One chat request: the new prompt plus the turns that came before it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChatRequest {
    #[serde(skip)]
    pub submission_id: uuid::Uuid,
    pub new_message: String,
    pub conversation: Vec<ConversationMessage>,
}

impl ChatRequest {
    pub fn new(new_message: impl Into<String>, conversation: Vec<ConversationMessage>) -> Self {
        Self {
            submission_id: uuid::Uuid::new_v4(),
            new_message: new_message.into(),
            conversation,
        }
    }
}

/// Response metadata captured before the body is consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub content_type: Option<String>,
}

/// Successful response whose body has not been read yet.
pub struct ResponseStream {
    pub body: ByteStream,
    pub meta: ResponseMeta,
}

/// Opens streaming chat responses.
///
/// Implementations return `Err` for anything other than a success status; the body stream
/// only yields bytes of a successful response.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: ChatRequest) -> Result<ResponseStream, TransportError>;
}
