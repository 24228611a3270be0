use crate::errors::ReplyFailure;
use crate::message::PlantSummary;
use crate::segmenter::{Degradation, FinalState, SegmentDelta};

/// Events exposed by `ReplyStream`.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyEvent {
    /// First event for every reply.
    Started { submission_id: uuid::Uuid },
    /// Segment delta, numbered from 0 in emission order.
    Delta {
        submission_id: uuid::Uuid,
        seq: u64,
        delta: SegmentDelta,
    },
    /// Terminal success event.
    Completed {
        submission_id: uuid::Uuid,
        outcome: ReplyOutcome,
    },
    /// Terminal failure event.
    Failed {
        submission_id: uuid::Uuid,
        error: ReplyFailure,
    },
}

impl ReplyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Segmented result of a reply whose body ended normally.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyOutcome {
    pub submission_id: uuid::Uuid,
    pub intro: String,
    /// `None` when the body never closed a JSON block.
    pub plants: Option<Vec<PlantSummary>>,
    pub summary: String,
    pub degradation: Option<Degradation>,
    pub bytes_received: usize,
}

impl ReplyOutcome {
    pub(crate) fn from_final(
        submission_id: uuid::Uuid,
        state: FinalState,
        bytes_received: usize,
    ) -> Self {
        Self {
            submission_id,
            intro: state.intro,
            plants: state.plants,
            summary: state.summary,
            degradation: state.degradation,
            bytes_received,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}
