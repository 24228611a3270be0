//! Streaming client for the plant-care chat endpoint.
//!
//! A reply arrives as one text stream: a markdown introduction, a fenced `` ```json `` block
//! holding the recommended plants, then a markdown summary. The [`segmenter`] splits that
//! stream while it is still arriving; [`ChatSession`] projects the pieces onto the
//! conversation log so a front end can reveal each part as soon as it is complete.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use plantcare_chat::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ChatError> {
//! let config = ChatConfig::from_env()?;
//! let transport = HttpChatTransport::new(&config, Arc::new(Anonymous))?;
//! let session = ChatSession::builder(Arc::new(transport)).build()?;
//!
//! if let SubmitOutcome::Accepted(submission) = session.submit("Plants for a dark hallway?") {
//!     let result = submission.wait().await?;
//!     let snapshot = session.snapshot();
//!     if let Some(reply) = snapshot.find(&result.message_id) {
//!         println!("{}", reply.intro());
//!         for plant in reply.plants() {
//!             println!("- {}: {}", plant.common_name, plant.description);
//!         }
//!         println!("{}", reply.summary());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Bearer tokens, refresh, and the 401 retry policy.
pub mod auth;
/// Endpoint and client settings.
pub mod config;
/// Public error types.
pub mod errors;
/// Conversation log entries and reply status.
pub mod message;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Standalone reply runs and their cancellation handle.
pub mod run;
/// Incremental intro / JSON / summary splitter.
pub mod segmenter;
/// Conversation state and submission lifecycle.
pub mod session;
/// Reply events.
pub mod stream;
/// HTTP transport and its contract.
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{
    Anonymous, CredentialProvider, RefreshingCredentials, RetryPolicy, TokenStore, require_auth,
};
pub use config::{ChatConfig, RequestMethod};
pub use errors::{AuthError, ChatError, ReplyFailure, TransportError};
pub use message::{ConversationMessage, MessageStatus, PlantSummary, ReplyStage, Sender};
pub use observability::{ObservabilitySettings, init_observability};
pub use run::{AbortHandle, ReplyStream, start_reply};
pub use segmenter::{Degradation, FinalState, ParserPhase, SegmentDelta, StreamSegmenter};
pub use session::{
    ChatSession, ChatSessionBuilder, ConversationSnapshot, ConversationWatch, IgnoreReason,
    Submission, SubmissionResult, SubmitOutcome,
};
pub use stream::{ReplyEvent, ReplyOutcome};
pub use transport::{
    ByteStream, ChatRequest, ChatTransport, HttpChatTransport, ResponseMeta, ResponseStream,
};
