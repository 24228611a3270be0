//! Common imports for typical chat usage.
pub use crate::{
    Anonymous, ChatConfig, ChatError, ChatSession, ConversationMessage, ConversationSnapshot,
    HttpChatTransport, MessageStatus, PlantSummary, RefreshingCredentials, RequestMethod,
    SegmentDelta, StreamSegmenter, SubmitOutcome,
};
