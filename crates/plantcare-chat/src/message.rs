use std::fmt;

use chrono::{DateTime, Utc};

/// One plant recommended by the assistant, parsed from the fenced JSON block.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlantSummary {
    pub common_name: String,
    pub description: String,
    /// Image URL or path. The endpoint calls this field `url`.
    #[serde(rename = "url")]
    pub image_url: String,
}

impl PlantSummary {
    pub fn new(
        common_name: impl Into<String>,
        description: impl Into<String>,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            description: description.into(),
            image_url: image_url.into(),
        }
    }
}

/// Author of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

/// Human-readable status shown above an assistant turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageStatus {
    #[serde(rename = "processing...")]
    Processing,
    #[serde(rename = "Finding the best plants for you...")]
    FindingPlants,
    #[serde(rename = "done ✅")]
    Done,
    /// The endpoint answered with a non-success status.
    #[serde(rename = "Error fetching response ❌")]
    FetchFailed,
    /// The request could not be sent or the body stopped mid-stream.
    #[serde(rename = "error ❌")]
    StreamFailed,
}

impl MessageStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Processing => "processing...",
            Self::FindingPlants => "Finding the best plants for you...",
            Self::Done => "done ✅",
            Self::FetchFailed => "Error fetching response ❌",
            Self::StreamFailed => "error ❌",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Progress of one assistant reply.
///
/// `Idle -> AwaitingIntro -> AwaitingJson -> AwaitingSummary -> Done`, with `Error`
/// reachable from any stage except `Idle`. `Done` and `Error` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStage {
    Idle,
    AwaitingIntro,
    AwaitingJson,
    AwaitingSummary,
    Done,
    Error,
}

impl ReplyStage {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::AwaitingIntro => 1,
            Self::AwaitingJson => 2,
            Self::AwaitingSummary => 3,
            Self::Done => 4,
            Self::Error => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether moving to `next` is a forward transition of the reply state machine.
    pub fn can_advance_to(self, next: ReplyStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Idle => false,
            Self::Error => self != Self::Idle,
            _ => next.rank() > self.rank(),
        }
    }
}

/// A user or assistant turn in the conversation log.
///
/// Serializes with the camelCase keys the chat endpoint expects for history.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro_markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_plants: Option<Vec<PlantSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip)]
    pub stage: Option<ReplyStage>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::User,
            content: content.into(),
            timestamp: Utc::now(),
            intro_markdown: None,
            json_plants: None,
            summary_markdown: None,
            status: None,
            stage: None,
        }
    }

    /// Empty assistant turn that is filled in as the reply streams.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::Ai,
            content: String::new(),
            timestamp: Utc::now(),
            intro_markdown: None,
            json_plants: None,
            summary_markdown: None,
            status: Some(MessageStatus::Processing),
            stage: Some(ReplyStage::AwaitingIntro),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.sender == Sender::Ai
    }

    pub fn intro(&self) -> &str {
        self.intro_markdown.as_deref().unwrap_or("")
    }

    pub fn summary(&self) -> &str {
        self.summary_markdown.as_deref().unwrap_or("")
    }

    pub fn plants(&self) -> &[PlantSummary] {
        self.json_plants.as_deref().unwrap_or(&[])
    }

    /// Moves the reply stage forward; backward or post-terminal moves are ignored.
    pub(crate) fn advance_stage(&mut self, next: ReplyStage) -> bool {
        let current = self.stage.unwrap_or(ReplyStage::Idle);
        if current.can_advance_to(next) {
            self.stage = Some(next);
            true
        } else {
            false
        }
    }
}
