use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{ChatError, ReplyFailure};
use crate::message::{ConversationMessage, MessageStatus, ReplyStage};
use crate::run::{AbortHandle, ReplyStream, spawn_reply};
use crate::segmenter::{Degradation, SegmentDelta};
use crate::stream::ReplyEvent;
use crate::transport::{ChatRequest, ChatTransport};

const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// Immutable view of the conversation log.
///
/// Messages are shared between snapshots; an update copies only the message it touches.
#[derive(Clone, Debug, Default)]
pub struct ConversationSnapshot {
    messages: Vec<Arc<ConversationMessage>>,
    busy: bool,
}

impl ConversationSnapshot {
    pub fn messages(&self) -> &[Arc<ConversationMessage>] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True while a submission is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last(&self) -> Option<&ConversationMessage> {
        self.messages.last().map(Arc::as_ref)
    }

    pub fn find(&self, id: &str) -> Option<&ConversationMessage> {
        self.messages.iter().map(Arc::as_ref).find(|m| m.id == id)
    }
}

struct Active {
    submission_id: uuid::Uuid,
    index: usize,
    abort: AbortHandle,
}

struct SessionState {
    conversation: ConversationSnapshot,
    active: Option<Active>,
    closed: bool,
}

struct SessionInner {
    state: watch::Sender<SessionState>,
    transport: Arc<dyn ChatTransport>,
    stream_buffer_capacity: usize,
}

impl SessionInner {
    /// Applies `update` to the submission's assistant message if it is still the active one.
    fn apply<F>(&self, submission_id: uuid::Uuid, finish: bool, update: F) -> bool
    where
        F: FnOnce(&mut ConversationMessage),
    {
        self.state.send_if_modified(|state| {
            let Some(index) = state
                .active
                .as_ref()
                .filter(|active| active.submission_id == submission_id)
                .map(|active| active.index)
            else {
                return false;
            };
            if let Some(message) = state.conversation.messages.get_mut(index) {
                update(Arc::make_mut(message));
            }
            if finish {
                state.active = None;
                state.conversation.busy = false;
            }
            true
        })
    }

    /// Detaches the active submission (or only `only`, when given) and returns its abort handle.
    fn detach(&self, only: Option<uuid::Uuid>) -> Option<AbortHandle> {
        let mut detached = None;
        self.state.send_if_modified(|state| {
            let matches = state
                .active
                .as_ref()
                .is_some_and(|active| only.is_none_or(|id| id == active.submission_id));
            if !matches {
                return false;
            }
            detached = state.active.take().map(|active| active.abort);
            state.conversation.busy = false;
            true
        });
        detached
    }

    fn cancel(&self) -> bool {
        match self.detach(None) {
            Some(abort) => {
                abort.abort();
                true
            }
            None => false,
        }
    }

    fn close(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.closed;
            state.closed = true;
            changed
        });
        self.cancel();
    }
}

/// Closes the session once the last [`ChatSession`] clone is dropped.
struct CloseOnDrop(Arc<SessionInner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.0.state.borrow().active.is_some() {
            debug!("last session handle dropped; cancelling in-flight reply");
        }
        self.0.close();
    }
}

/// Why a submission was not started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyPrompt,
    /// Another submission is still in flight.
    Busy,
    Closed,
}

/// Result of [`ChatSession::submit`].
pub enum SubmitOutcome {
    Accepted(Submission),
    Ignored(IgnoreReason),
}

impl SubmitOutcome {
    pub fn accepted(self) -> Option<Submission> {
        match self {
            Self::Accepted(submission) => Some(submission),
            Self::Ignored(_) => None,
        }
    }

    pub fn ignored(&self) -> Option<IgnoreReason> {
        match self {
            Self::Accepted(_) => None,
            Self::Ignored(reason) => Some(*reason),
        }
    }
}

/// How a submission ended.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionResult {
    pub submission_id: uuid::Uuid,
    /// Id of the assistant message the reply was written to.
    pub message_id: String,
    pub stage: ReplyStage,
    pub degradation: Option<Degradation>,
    pub failure: Option<ReplyFailure>,
}

impl SubmissionResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Handle to one in-flight submission.
pub struct Submission {
    id: uuid::Uuid,
    message_id: String,
    abort: AbortHandle,
    session: Arc<SessionInner>,
    driver: JoinHandle<SubmissionResult>,
}

impl Submission {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Detaches this submission from the session, then cancels its reply.
    pub fn abort(&self) {
        self.session.detach(Some(self.id));
        self.abort.abort();
    }

    /// Waits for the reply to end.
    pub async fn wait(self) -> Result<SubmissionResult, ChatError> {
        self.driver.await.map_err(|e| {
            ChatError::protocol_msg(format!("submission {} driver failed: {e}", self.id))
        })
    }
}

/// Builder for [`ChatSession`].
pub struct ChatSessionBuilder {
    transport: Arc<dyn ChatTransport>,
    stream_buffer_capacity: usize,
    history: Vec<ConversationMessage>,
}

impl ChatSessionBuilder {
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Seeds the log with earlier turns.
    pub fn history(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.history = messages;
        self
    }

    pub fn build(self) -> Result<ChatSession, ChatError> {
        if self.stream_buffer_capacity == 0 {
            return Err(ChatError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        let conversation = ConversationSnapshot {
            messages: self.history.into_iter().map(Arc::new).collect(),
            busy: false,
        };
        let (state, _) = watch::channel(SessionState {
            conversation,
            active: None,
            closed: false,
        });
        let inner = Arc::new(SessionInner {
            state,
            transport: self.transport,
            stream_buffer_capacity: self.stream_buffer_capacity,
        });
        Ok(ChatSession {
            _close_on_drop: Arc::new(CloseOnDrop(inner.clone())),
            inner,
        })
    }
}

/// Owns the conversation log and at most one in-flight reply.
///
/// Deltas of the active reply are projected onto its assistant message as they arrive, so
/// subscribers see the intro, the plant list and the summary appear in order.
///
/// Clones share one log. Dropping the last clone closes the session like [`close`](Self::close).
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
    _close_on_drop: Arc<CloseOnDrop>,
}

impl ChatSession {
    pub fn builder(transport: Arc<dyn ChatTransport>) -> ChatSessionBuilder {
        ChatSessionBuilder {
            transport,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
            history: Vec::new(),
        }
    }

    /// Appends the prompt and an assistant placeholder, then starts streaming the reply.
    ///
    /// Must be called within a Tokio runtime.
    pub fn submit(&self, prompt: &str) -> SubmitOutcome {
        if prompt.trim().is_empty() {
            return SubmitOutcome::Ignored(IgnoreReason::EmptyPrompt);
        }

        let request_id = uuid::Uuid::new_v4();
        let (abort, abort_rx) = AbortHandle::pair();
        let placeholder = ConversationMessage::assistant_placeholder();
        let message_id = placeholder.id.clone();
        let mut outcome = Err(IgnoreReason::Closed);

        self.inner.state.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            if state.active.is_some() {
                outcome = Err(IgnoreReason::Busy);
                return false;
            }
            let prior: Vec<ConversationMessage> = state
                .conversation
                .messages
                .iter()
                .map(|m| ConversationMessage::clone(m))
                .collect();
            let messages = &mut state.conversation.messages;
            messages.push(Arc::new(ConversationMessage::user(prompt)));
            messages.push(Arc::new(placeholder.clone()));
            state.active = Some(Active {
                submission_id: request_id,
                index: messages.len() - 1,
                abort: abort.clone(),
            });
            state.conversation.busy = true;
            outcome = Ok(prior);
            true
        });

        let prior = match outcome {
            Ok(prior) => prior,
            Err(reason) => {
                debug!(?reason, "submission ignored");
                return SubmitOutcome::Ignored(reason);
            }
        };

        let request = ChatRequest {
            submission_id: request_id,
            new_message: prompt.to_string(),
            conversation: prior,
        };
        info!(submission_id = %request_id, history = request.conversation.len(), "submitting prompt");
        let stream = spawn_reply(
            self.inner.transport.clone(),
            request,
            self.inner.stream_buffer_capacity,
            abort_rx,
        );
        let driver = tokio::spawn(drive_submission(self.inner.clone(), stream, placeholder));

        SubmitOutcome::Accepted(Submission {
            id: request_id,
            message_id,
            abort,
            session: self.inner.clone(),
            driver,
        })
    }

    /// Cancels the in-flight submission, if any. Its message keeps what it received so far.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Cancels the in-flight submission and refuses further ones.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.borrow().conversation.busy
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.state.borrow().conversation.clone()
    }

    pub fn subscribe(&self) -> ConversationWatch {
        ConversationWatch {
            rx: self.inner.state.subscribe(),
        }
    }
}

/// Change notifications for a session's conversation log.
///
/// Bursts of updates are coalesced: a slow reader sees the latest snapshot, not every step.
pub struct ConversationWatch {
    rx: watch::Receiver<SessionState>,
}

impl ConversationWatch {
    /// Waits until the log changed since the last call.
    pub async fn changed(&mut self) -> Result<(), ChatError> {
        self.rx
            .changed()
            .await
            .map_err(|_| ChatError::protocol_msg("chat session dropped"))
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.rx.borrow().conversation.clone()
    }
}

async fn drive_submission(
    session: Arc<SessionInner>,
    mut stream: ReplyStream,
    placeholder: ConversationMessage,
) -> SubmissionResult {
    let submission_id = stream.submission_id();
    // Local copy of the message; keeps tracking the reply after a detach.
    let mut shadow = placeholder;

    while let Some(event) = stream.next_event().await {
        if let ReplyEvent::Delta { seq, delta, .. } = event {
            apply_delta(&mut shadow, &delta);
            let live = session.apply(submission_id, false, |message| apply_delta(message, &delta));
            if !live {
                debug!(submission_id = %submission_id, seq, "dropping delta for detached submission");
            }
        }
    }

    let (degradation, failure) = match stream.finish().await {
        Ok(outcome) => (outcome.degradation, None),
        Err(ChatError::ReplyFailed(failure)) => (None, Some(failure)),
        Err(other) => (
            None,
            Some(ReplyFailure::Transport {
                message: other.to_string(),
                status: None,
            }),
        ),
    };
    match &failure {
        None => {
            complete(&mut shadow);
            session.apply(submission_id, true, complete);
        }
        Some(failure) => {
            warn!(submission_id = %submission_id, error = %failure, "reply failed");
            fail(&mut shadow, failure);
            session.apply(submission_id, true, |message| fail(message, failure));
        }
    }

    SubmissionResult {
        submission_id,
        message_id: shadow.id.clone(),
        stage: shadow.stage.unwrap_or(ReplyStage::Idle),
        degradation,
        failure,
    }
}

fn apply_delta(message: &mut ConversationMessage, delta: &SegmentDelta) {
    match delta {
        SegmentDelta::Intro(text) => {
            message
                .intro_markdown
                .get_or_insert_with(String::new)
                .push_str(text);
            message.status = Some(MessageStatus::Processing);
        }
        SegmentDelta::JsonOpened => {
            message.advance_stage(ReplyStage::AwaitingJson);
            message.status = Some(MessageStatus::FindingPlants);
        }
        SegmentDelta::Plants(plants) => {
            message.json_plants = Some(plants.clone());
            message.advance_stage(ReplyStage::AwaitingSummary);
            message.status = Some(MessageStatus::Processing);
        }
        SegmentDelta::Summary(text) => {
            message
                .summary_markdown
                .get_or_insert_with(String::new)
                .push_str(text);
            message.status = Some(MessageStatus::Done);
        }
    }
}

fn complete(message: &mut ConversationMessage) {
    message.advance_stage(ReplyStage::Done);
    message.status = Some(MessageStatus::Done);
}

fn fail(message: &mut ConversationMessage, failure: &ReplyFailure) {
    message.advance_stage(ReplyStage::Error);
    message.status = Some(if failure.is_status_error() {
        MessageStatus::FetchFailed
    } else {
        MessageStatus::StreamFailed
    });
}
