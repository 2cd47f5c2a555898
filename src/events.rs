//! Event types for PetalMix

use crate::action::{ActionId, ActionKind};
use crate::stats::Stats;

#[derive(Debug, Clone, PartialEq)]
pub enum PetalMixEvent {
    ActionCompleted {
        action_id: ActionId,
        kind: ActionKind,
        done_frames: u64,
    },
    ActionCancelled {
        action_id: ActionId,
        kind: ActionKind,
        done_frames: u64,
    },
    ActionDropped {
        action_id: ActionId,
        kind: ActionKind,
    },
    /// Stream statistics fetched by `action_id` contain over- or underflows
    XrunsReported {
        action_id: ActionId,
        stats: Stats,
    },
    StreamStarted,
    StreamStopped,
    StreamError {
        error: String,
    },
}

impl PetalMixEvent {
    pub fn action_id(&self) -> Option<ActionId> {
        match self {
            Self::ActionCompleted { action_id, .. }
            | Self::ActionCancelled { action_id, .. }
            | Self::ActionDropped { action_id, .. }
            | Self::XrunsReported { action_id, .. } => Some(*action_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ActionDropped { .. } | Self::XrunsReported { .. } | Self::StreamError { .. }
        )
    }

    pub fn is_action_event(&self) -> bool {
        self.action_id().is_some()
    }
}
