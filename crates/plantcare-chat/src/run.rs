use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::errors::{ChatError, ReplyFailure};
use crate::segmenter::{SegmentDelta, StreamSegmenter};
use crate::stream::{ReplyEvent, ReplyOutcome};
use crate::transport::{ChatRequest, ChatTransport};

/// Handle used to request cancellation of a running reply.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is observed between body chunks and becomes visible as a terminal
    /// `ReplyEvent::Failed` with `ReplyFailure::Cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn pair() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }
}

/// Validates the request and starts streaming one reply on a background task.
pub fn start_reply(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    stream_buffer_capacity: usize,
) -> Result<ReplyStream, ChatError> {
    if stream_buffer_capacity == 0 {
        return Err(ChatError::Validation(
            "stream_buffer_capacity must be greater than 0".into(),
        ));
    }
    if request.new_message.trim().is_empty() {
        return Err(ChatError::Validation("prompt must not be empty".into()));
    }

    let (abort_handle, abort_rx) = AbortHandle::pair();
    let mut stream = spawn_reply(transport, request, stream_buffer_capacity, abort_rx);
    stream.abort_handle = Some(abort_handle);
    Ok(stream)
}

/// Spawns the reply task for an already validated request.
pub(crate) fn spawn_reply(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    stream_buffer_capacity: usize,
    abort_rx: watch::Receiver<bool>,
) -> ReplyStream {
    let (tx, rx) = mpsc::channel(stream_buffer_capacity);
    let (final_tx, final_rx) = oneshot::channel();
    let submission_id = request.submission_id;
    tokio::spawn(reply_task(transport, request, tx, final_tx, abort_rx));

    ReplyStream {
        submission_id,
        rx,
        final_rx,
        abort_handle: None,
        saw_terminal: false,
    }
}

/// Streaming handle returned by [`start_reply`].
///
/// Use `next_event()` to consume events as they arrive and `finish()` to obtain the final
/// result after the terminal event.
pub struct ReplyStream {
    submission_id: uuid::Uuid,
    rx: mpsc::Receiver<ReplyEvent>,
    final_rx: oneshot::Receiver<Result<ReplyOutcome, ChatError>>,
    abort_handle: Option<AbortHandle>,
    saw_terminal: bool,
}

impl ReplyStream {
    pub fn submission_id(&self) -> uuid::Uuid {
        self.submission_id
    }

    /// Returns a handle that can cancel the reply.
    ///
    /// `None` for replies owned by a `ChatSession`; cancel those through the session.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` after the channel is closed.
    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(ReplyEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains the stream (if needed) and returns the terminal result.
    pub async fn finish(mut self) -> Result<ReplyOutcome, ChatError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(ChatError::protocol_msg(format!(
                "reply task ended without final result (submission={})",
                self.submission_id
            ))),
        }
    }
}

async fn reply_task(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    tx: mpsc::Sender<ReplyEvent>,
    final_tx: oneshot::Sender<Result<ReplyOutcome, ChatError>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let submission_id = request.submission_id;

    if !send_event(&tx, ReplyEvent::Started { submission_id }).await {
        let _ = final_tx.send(Err(ChatError::protocol_msg(
            "reply receiver dropped before Started",
        )));
        return;
    }

    let opened = tokio::select! {
        opened = transport.open_stream(request) => opened,
        _ = wait_for_abort(&mut abort_rx) => {
            fail(&tx, final_tx, submission_id, ReplyFailure::Cancelled).await;
            return;
        }
    };
    let mut response = match opened {
        Ok(response) => response,
        Err(err) => {
            warn!(submission_id = %submission_id, error = %err, "chat stream could not be opened");
            fail(&tx, final_tx, submission_id, ReplyFailure::from(&err)).await;
            return;
        }
    };
    debug!(submission_id = %submission_id, status = response.meta.status, content_type = ?response.meta.content_type, "chat stream opened");

    let mut segmenter = StreamSegmenter::new();
    let mut seq = 0_u64;
    loop {
        tokio::select! {
            _ = wait_for_abort(&mut abort_rx) => {
                info!(submission_id = %submission_id, bytes = segmenter.bytes_in(), "reply cancelled");
                fail(&tx, final_tx, submission_id, ReplyFailure::Cancelled).await;
                return;
            }
            next = response.body.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        let deltas = segmenter.feed(&chunk);
                        if !emit_deltas(&tx, submission_id, &mut seq, deltas).await {
                            let _ = final_tx.send(Err(ChatError::protocol_msg("reply receiver dropped during output")));
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(submission_id = %submission_id, error = %err, bytes = segmenter.bytes_in(), "chat stream failed mid-body");
                        fail(&tx, final_tx, submission_id, ReplyFailure::from(&err)).await;
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    let bytes_received = segmenter.bytes_in();
    let mut state = segmenter.finish();
    let flushed = std::mem::take(&mut state.flushed);
    if !emit_deltas(&tx, submission_id, &mut seq, flushed).await {
        let _ = final_tx.send(Err(ChatError::protocol_msg(
            "reply receiver dropped during output",
        )));
        return;
    }

    let outcome = ReplyOutcome::from_final(submission_id, state, bytes_received);
    if let Some(degradation) = &outcome.degradation {
        warn!(submission_id = %submission_id, %degradation, "reply completed degraded");
    }
    info!(submission_id = %submission_id, bytes = bytes_received, deltas = seq, "reply completed");
    let sent = send_event(
        &tx,
        ReplyEvent::Completed {
            submission_id,
            outcome: outcome.clone(),
        },
    )
    .await;
    let _ = final_tx.send(if sent {
        Ok(outcome)
    } else {
        Err(ChatError::protocol_msg(
            "reply receiver dropped before completion",
        ))
    });
}

/// Resolves once an abort was requested. Pending forever if the handle is gone.
async fn wait_for_abort(abort_rx: &mut watch::Receiver<bool>) {
    let requested = abort_rx.wait_for(|aborted| *aborted).await.is_ok();
    if !requested {
        futures::future::pending::<()>().await;
    }
}

async fn emit_deltas(
    tx: &mpsc::Sender<ReplyEvent>,
    submission_id: uuid::Uuid,
    seq: &mut u64,
    deltas: Vec<SegmentDelta>,
) -> bool {
    for delta in deltas {
        debug!(submission_id = %submission_id, seq = *seq, "segment delta");
        let sent = send_event(
            tx,
            ReplyEvent::Delta {
                submission_id,
                seq: *seq,
                delta,
            },
        )
        .await;
        *seq = seq.saturating_add(1);
        if !sent {
            return false;
        }
    }
    true
}

async fn fail(
    tx: &mpsc::Sender<ReplyEvent>,
    final_tx: oneshot::Sender<Result<ReplyOutcome, ChatError>>,
    submission_id: uuid::Uuid,
    failure: ReplyFailure,
) {
    let _ = send_event(
        tx,
        ReplyEvent::Failed {
            submission_id,
            error: failure.clone(),
        },
    )
    .await;
    let _ = final_tx.send(Err(ChatError::ReplyFailed(failure)));
}

async fn send_event(tx: &mpsc::Sender<ReplyEvent>, event: ReplyEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::message::PlantSummary;
    use crate::segmenter::Degradation;
    use crate::transport::{ResponseMeta, ResponseStream};
    use bytes::Bytes;
    use futures::StreamExt as _;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum FakeBehavior {
        OpenError(TransportError),
        Chunks(Vec<Result<Bytes, TransportError>>),
        /// Yields the chunks, then never ends.
        ChunksThenPending(Vec<Bytes>),
    }

    pub(crate) struct FakeTransport {
        pub calls: AtomicUsize,
        pub requests: std::sync::Mutex<Vec<ChatRequest>>,
        pub behavior: FakeBehavior,
    }

    impl FakeTransport {
        pub(crate) fn new(behavior: FakeBehavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: std::sync::Mutex::new(Vec::new()),
                behavior,
            })
        }

        pub(crate) fn chunks(chunks: &[&str]) -> Arc<Self> {
            Self::new(FakeBehavior::Chunks(
                chunks
                    .iter()
                    .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
                    .collect(),
            ))
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for FakeTransport {
        async fn open_stream(&self, request: ChatRequest) -> Result<ResponseStream, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().expect("requests lock").push(request);
            let meta = ResponseMeta {
                status: 200,
                content_type: Some("text/plain".into()),
            };
            match &self.behavior {
                FakeBehavior::OpenError(err) => Err(err.clone()),
                FakeBehavior::Chunks(chunks) => Ok(ResponseStream {
                    body: Box::pin(stream::iter(chunks.clone())),
                    meta,
                }),
                FakeBehavior::ChunksThenPending(chunks) => {
                    let head = stream::iter(chunks.clone().into_iter().map(Ok));
                    Ok(ResponseStream {
                        body: Box::pin(head.chain(stream::pending())),
                        meta,
                    })
                }
            }
        }
    }

    const FERN_REPLY: [&str; 3] = [
        "Here are some plants:\n```json\n[{\"common_name\":\"Fe",
        "rn\",\"description\":\"Shade\",\"url\":\"/f.png\"}]\n``",
        "`\nEnjoy!",
    ];

    fn request(prompt: &str) -> ChatRequest {
        ChatRequest::new(prompt, Vec::new())
    }

    #[tokio::test]
    async fn validation_rejects_empty_prompt_and_zero_capacity() {
        let transport = FakeTransport::chunks(&[]);
        assert!(matches!(
            start_reply(transport.clone(), request("  "), 8),
            Err(ChatError::Validation(msg)) if msg.contains("prompt")
        ));
        assert!(matches!(
            start_reply(transport.clone(), request("hi"), 0),
            Err(ChatError::Validation(msg)) if msg.contains("stream_buffer_capacity")
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emits_started_then_ordered_deltas_then_completed() {
        let mut stream =
            start_reply(FakeTransport::chunks(&FERN_REPLY), request("ferns?"), 4).expect("start");

        let first = stream.next_event().await.expect("first event");
        assert!(matches!(first, ReplyEvent::Started { .. }));

        let mut seqs = Vec::new();
        let mut deltas = Vec::new();
        while let Some(event) = stream.next_event().await {
            match event {
                ReplyEvent::Delta { seq, delta, .. } => {
                    seqs.push(seq);
                    deltas.push(delta);
                }
                ReplyEvent::Completed { .. } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(seqs, (0..deltas.len() as u64).collect::<Vec<_>>());
        assert_eq!(
            deltas,
            vec![
                SegmentDelta::Intro("Here are some plants:\n".into()),
                SegmentDelta::JsonOpened,
                SegmentDelta::Plants(vec![PlantSummary::new("Fern", "Shade", "/f.png")]),
                SegmentDelta::Summary("\nEnjoy!".into()),
            ]
        );

        let outcome = stream.finish().await.expect("finish");
        assert_eq!(outcome.intro, "Here are some plants:\n");
        assert_eq!(outcome.summary, "\nEnjoy!");
        assert_eq!(outcome.plants.map(|p| p.len()), Some(1));
        assert!(outcome.degradation.is_none());
    }

    #[tokio::test]
    async fn no_fence_completes_degraded_with_intro_only() {
        let outcome = start_reply(
            FakeTransport::chunks(&["just some ", "text"]),
            request("hi"),
            4,
        )
        .expect("start")
        .finish()
        .await
        .expect("finish");
        assert_eq!(outcome.intro, "just some text");
        assert_eq!(outcome.summary, "");
        assert_eq!(outcome.degradation, Some(Degradation::MissingJsonBlock));
        assert_eq!(outcome.bytes_received, 14);
    }

    #[tokio::test]
    async fn open_error_becomes_terminal_failure_with_status() {
        let mut stream = start_reply(
            FakeTransport::new(FakeBehavior::OpenError(TransportError::Status {
                status: 502,
                body: "bad gateway".into(),
            })),
            request("hi"),
            4,
        )
        .expect("start");

        let mut failure = None;
        while let Some(event) = stream.next_event().await {
            if let ReplyEvent::Failed { error, .. } = event {
                failure = Some(error);
            }
        }
        let failure = failure.expect("failed event");
        assert!(failure.is_status_error());
        assert!(matches!(
            stream.finish().await,
            Err(ChatError::ReplyFailed(ReplyFailure::Transport {
                status: Some(502),
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn read_error_mid_body_keeps_earlier_deltas() {
        let mut stream = start_reply(
            FakeTransport::new(FakeBehavior::Chunks(vec![
                Ok(Bytes::from_static(b"Intro text ")),
                Ok(Bytes::from_static(b"```json\n[")),
                Err(TransportError::read("connection reset")),
            ])),
            request("hi"),
            4,
        )
        .expect("start");

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            ReplyEvent::Delta { delta: SegmentDelta::Intro(text), .. } if text == "Intro text "
        )));
        assert!(matches!(
            events.last(),
            Some(ReplyEvent::Failed {
                error: ReplyFailure::Transport { status: None, .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_emits_terminal_failure() {
        let mut stream = start_reply(
            FakeTransport::new(FakeBehavior::ChunksThenPending(vec![Bytes::from_static(
                b"Thinking about ",
            )])),
            request("hi"),
            4,
        )
        .expect("start");

        let abort = stream.abort_handle().expect("standalone reply has an abort handle");
        let _ = stream.next_event().await;
        abort.abort();

        let mut saw_cancel = false;
        while let Some(event) = stream.next_event().await {
            if let ReplyEvent::Failed {
                error: ReplyFailure::Cancelled,
                ..
            } = event
            {
                saw_cancel = true;
                break;
            }
        }
        assert!(saw_cancel);
        assert!(matches!(
            stream.finish().await,
            Err(ChatError::ReplyFailed(ReplyFailure::Cancelled))
        ));
    }
}
