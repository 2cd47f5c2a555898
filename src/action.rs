//! Scheduled units of audio work.
//!
//! This module provides the types describing what the scheduler does:
//! - [`Action`]: One play/record/cancel/stats-fetch request plus its progress and outcome
//! - [`ActionKind`]: Which of the six kinds an action is
//! - [`ActionState`]: Pending, active or finished (and why)
//! - [`Schedule`]: Requested start time and belated policy
//! - [`ChannelMapping`]: Which device channels an action reads or writes
//! - [`ActionHandle`]: What the control thread keeps while an action is in flight
//!
//! Actions are built and validated by
//! [`PetalMixController`](crate::PetalMixController), moved to the audio
//! callback through the submit queue, and moved back through the completion
//! queue once finished. While in flight they are only touched by the
//! scheduler; afterwards they are read-only and available from the handle.

use crate::error::{PetalMixError, Result};
use crate::ring_buffer::{RingConsumer, RingProducer};
use crate::stats::Stats;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Opaque identity of a submitted action.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PlayBuffer,
    RecordBuffer,
    PlayRingBuffer,
    RecordRingBuffer,
    Cancel,
    FetchAndResetStats,
}

impl ActionKind {
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::PlayBuffer | Self::PlayRingBuffer)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Self::RecordBuffer | Self::RecordRingBuffer)
    }

    /// `Cancel` and `FetchAndResetStats`, which move no audio.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Cancel | Self::FetchAndResetStats)
    }

    /// Whether the action runs until cancelled instead of for a frame count.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::PlayRingBuffer | Self::RecordRingBuffer)
    }
}

/// Why an action finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// All frames were transferred, or a control action took effect
    Completed,
    /// Stopped by a `Cancel` action
    Cancelled,
    /// The start time had passed and belated starts were not allowed
    Dropped,
}

/// Lifecycle of an action inside the scheduler.
///
/// `Pending -> Active -> Finished`, with `Pending -> Finished(Dropped)` for
/// belated actions and `Pending/Active -> Finished(Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Active,
    Finished(FinishReason),
}

/// When an action should start and what to do if that moment has passed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Stream time in seconds; `None` starts at the next opportunity
    pub start: Option<f64>,
    /// Start late instead of dropping the action when `start` has passed
    pub allow_belated: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            start: None,
            allow_belated: true,
        }
    }
}

impl Schedule {
    pub fn asap() -> Self {
        Self::default()
    }

    pub fn at(time: f64) -> Self {
        Self {
            start: Some(time),
            allow_belated: true,
        }
    }

    pub fn allow_belated(mut self, allow: bool) -> Self {
        self.allow_belated = allow;
        self
    }
}

/// Device channels used by an action, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMapping {
    /// Channels `1..=n`
    Count(usize),
    /// Explicit ordered channel numbers
    Channels(Vec<usize>),
}

impl From<usize> for ChannelMapping {
    fn from(count: usize) -> Self {
        Self::Count(count)
    }
}

impl From<Vec<usize>> for ChannelMapping {
    fn from(channels: Vec<usize>) -> Self {
        Self::Channels(channels)
    }
}

impl From<&[usize]> for ChannelMapping {
    fn from(channels: &[usize]) -> Self {
        Self::Channels(channels.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for ChannelMapping {
    fn from(channels: [usize; N]) -> Self {
        Self::Channels(channels.to_vec())
    }
}

impl ChannelMapping {
    /// Expand into explicit channel numbers and check them against the
    /// `max_channels` the stream has in the given direction.
    pub(crate) fn resolve(&self, max_channels: usize, direction: &str) -> Result<Vec<usize>> {
        if max_channels == 0 {
            return Err(PetalMixError::InvalidChannelMapping(format!(
                "stream has no {} channels",
                direction
            )));
        }

        let mapping: Vec<usize> = match self {
            Self::Count(count) => (1..=*count).collect(),
            Self::Channels(channels) => channels.clone(),
        };

        if mapping.is_empty() {
            return Err(PetalMixError::InvalidChannelMapping(
                "at least one channel is required".into(),
            ));
        }
        if mapping.iter().any(|&channel| channel < 1) {
            return Err(PetalMixError::InvalidChannelMapping(
                "channel numbers start with 1".into(),
            ));
        }
        if let Some(&channel) = mapping.iter().find(|&&channel| channel > max_channels) {
            return Err(PetalMixError::InvalidChannelMapping(format!(
                "channel {} is too large, the stream has {} {} channels",
                channel, max_channels, direction
            )));
        }

        Ok(mapping)
    }
}

/// Data an action transfers, or the control request it carries.
pub(crate) enum Payload {
    PlayBuffer(Arc<[f32]>),
    RecordBuffer(Vec<f32>),
    PlayRingBuffer(RingConsumer),
    RecordRingBuffer(RingProducer),
    /// Target and its kind
    Cancel(ActionId, ActionKind),
    FetchAndResetStats,
}

impl Payload {
    fn kind(&self) -> ActionKind {
        match self {
            Self::PlayBuffer(_) => ActionKind::PlayBuffer,
            Self::RecordBuffer(_) => ActionKind::RecordBuffer,
            Self::PlayRingBuffer(_) => ActionKind::PlayRingBuffer,
            Self::RecordRingBuffer(_) => ActionKind::RecordRingBuffer,
            Self::Cancel(..) => ActionKind::Cancel,
            Self::FetchAndResetStats => ActionKind::FetchAndResetStats,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlayBuffer(data) => write!(f, "PlayBuffer({} samples)", data.len()),
            Self::RecordBuffer(buffer) => write!(f, "RecordBuffer({} samples)", buffer.len()),
            Self::PlayRingBuffer(consumer) => {
                f.debug_tuple("PlayRingBuffer").field(consumer).finish()
            }
            Self::RecordRingBuffer(producer) => {
                f.debug_tuple("RecordRingBuffer").field(producer).finish()
            }
            Self::Cancel(target, _) => f.debug_tuple("Cancel").field(target).finish(),
            Self::FetchAndResetStats => write!(f, "FetchAndResetStats"),
        }
    }
}

/// One scheduled unit of audio work and its outcome.
#[derive(Debug)]
pub struct Action {
    pub(crate) id: ActionId,
    pub(crate) payload: Payload,
    pub(crate) state: ActionState,
    pub(crate) allow_belated: bool,
    /// Set once the scheduler has seen the start still ahead of a block
    pub(crate) seen_early: bool,
    pub(crate) requested_time: Option<f64>,
    pub(crate) actual_time: Option<f64>,
    /// `None` for ring-buffer actions, which run until cancelled
    pub(crate) total_frames: Option<u64>,
    pub(crate) done_frames: u64,
    pub(crate) mapping: Vec<usize>,
    pub(crate) stats: Stats,
    pub(crate) result_stats: Option<Stats>,
}

impl Action {
    fn new(id: ActionId, payload: Payload, mapping: Vec<usize>, schedule: Schedule) -> Self {
        let total_frames = match &payload {
            Payload::PlayBuffer(data) => Some((data.len() / mapping.len()) as u64),
            Payload::RecordBuffer(buffer) => Some((buffer.len() / mapping.len()) as u64),
            Payload::PlayRingBuffer(_) | Payload::RecordRingBuffer(_) => None,
            Payload::Cancel(..) | Payload::FetchAndResetStats => Some(0),
        };

        Self {
            id,
            payload,
            state: ActionState::Pending,
            allow_belated: schedule.allow_belated,
            seen_early: false,
            requested_time: schedule.start,
            actual_time: None,
            total_frames,
            done_frames: 0,
            mapping,
            stats: Stats::default(),
            result_stats: None,
        }
    }

    /// `mapping` must be non-empty and already validated.
    pub(crate) fn play_buffer(
        id: ActionId,
        data: Arc<[f32]>,
        mapping: Vec<usize>,
        schedule: Schedule,
    ) -> Self {
        Self::new(id, Payload::PlayBuffer(data), mapping, schedule)
    }

    pub(crate) fn record_buffer(
        id: ActionId,
        buffer: Vec<f32>,
        mapping: Vec<usize>,
        schedule: Schedule,
    ) -> Self {
        Self::new(id, Payload::RecordBuffer(buffer), mapping, schedule)
    }

    pub(crate) fn play_ring_buffer(
        id: ActionId,
        consumer: RingConsumer,
        mapping: Vec<usize>,
        schedule: Schedule,
    ) -> Self {
        Self::new(id, Payload::PlayRingBuffer(consumer), mapping, schedule)
    }

    pub(crate) fn record_ring_buffer(
        id: ActionId,
        producer: RingProducer,
        mapping: Vec<usize>,
        schedule: Schedule,
    ) -> Self {
        Self::new(id, Payload::RecordRingBuffer(producer), mapping, schedule)
    }

    pub(crate) fn cancel(
        id: ActionId,
        target: ActionId,
        target_kind: ActionKind,
        schedule: Schedule,
    ) -> Self {
        Self::new(id, Payload::Cancel(target, target_kind), Vec::new(), schedule)
    }

    pub(crate) fn fetch_and_reset_stats(id: ActionId, schedule: Schedule) -> Self {
        Self::new(id, Payload::FetchAndResetStats, Vec::new(), schedule)
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ActionState::Finished(_))
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.state {
            ActionState::Finished(reason) => Some(reason),
            _ => None,
        }
    }

    /// True for a finished action that never ran because it was belated.
    pub fn was_dropped(&self) -> bool {
        self.finish_reason() == Some(FinishReason::Dropped)
    }

    pub fn allow_belated(&self) -> bool {
        self.allow_belated
    }

    /// Requested start in stream time, `None` meaning "as soon as possible".
    pub fn requested_time(&self) -> Option<f64> {
        self.requested_time
    }

    /// Stream time at which the action started, `None` if it never started.
    pub fn actual_time(&self) -> Option<f64> {
        self.actual_time
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    pub fn done_frames(&self) -> u64 {
        self.done_frames
    }

    pub fn channels(&self) -> usize {
        self.mapping.len()
    }

    /// 1-based device channels, in the order of the action's interleaving.
    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }

    /// The action a `Cancel` action targets.
    pub fn target(&self) -> Option<ActionId> {
        match self.payload {
            Payload::Cancel(target, _) => Some(target),
            _ => None,
        }
    }

    /// Blocks and xruns observed while this action was active.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The stream statistics fetched by a `FetchAndResetStats` action.
    pub fn result_stats(&self) -> Option<&Stats> {
        self.result_stats.as_ref()
    }

    /// The recorded samples of a `RecordBuffer` action.
    pub fn recording(&self) -> Option<&[f32]> {
        match &self.payload {
            Payload::RecordBuffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn into_recording(self) -> Option<Vec<f32>> {
        match self.payload {
            Payload::RecordBuffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Give back the ring buffer half a `PlayRingBuffer` action read from.
    pub fn into_ring_consumer(self) -> Option<RingConsumer> {
        match self.payload {
            Payload::PlayRingBuffer(consumer) => Some(consumer),
            _ => None,
        }
    }

    /// Give back the ring buffer half a `RecordRingBuffer` action wrote to.
    pub fn into_ring_producer(self) -> Option<RingProducer> {
        match self.payload {
            Payload::RecordRingBuffer(producer) => Some(producer),
            _ => None,
        }
    }

    pub(crate) fn finish(&mut self, reason: FinishReason) {
        self.state = ActionState::Finished(reason);
    }
}

/// Control-thread handle of a submitted action.
///
/// The finished [`Action`] is deposited into the handle when the controller
/// drains it from the completion queue.
#[derive(Clone)]
pub struct ActionHandle {
    id: ActionId,
    kind: ActionKind,
    slot: Arc<OnceLock<Action>>,
}

impl ActionHandle {
    pub(crate) fn new(id: ActionId, kind: ActionKind) -> Self {
        Self {
            id,
            kind,
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn slot(&self) -> Arc<OnceLock<Action>> {
        Arc::clone(&self.slot)
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Whether the controller has observed this action on the completion queue.
    pub fn is_finished(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The finished action, once available.
    pub fn finished(&self) -> Option<&Action> {
        self.slot.get()
    }

    /// Take ownership of the finished action, e.g. to get a recording back.
    ///
    /// Returns the handle unchanged if the action has not finished yet or
    /// other clones of this handle are still alive.
    pub fn into_finished(self) -> std::result::Result<Action, Self> {
        if !self.is_finished() {
            return Err(self);
        }
        let Self { id, kind, slot } = self;
        match Arc::try_unwrap(slot) {
            Ok(cell) => cell.into_inner().ok_or_else(|| Self::new(id, kind)),
            Err(slot) => Err(Self { id, kind, slot }),
        }
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_from_count() {
        let mapping = ChannelMapping::from(3).resolve(4, "output").unwrap();
        assert_eq!(mapping, vec![1, 2, 3]);
    }

    #[test]
    fn test_mapping_explicit_order_is_kept() {
        let mapping = ChannelMapping::from([2, 1]).resolve(2, "output").unwrap();
        assert_eq!(mapping, vec![2, 1]);
    }

    #[test]
    fn test_mapping_rejects_out_of_range() {
        for mapping in [
            ChannelMapping::from([0, 1]),
            ChannelMapping::from([3]),
            ChannelMapping::from(0),
            ChannelMapping::from(5),
        ] {
            assert!(matches!(
                mapping.resolve(2, "output"),
                Err(PetalMixError::InvalidChannelMapping(_))
            ));
        }
    }

    #[test]
    fn test_mapping_without_channels_in_direction() {
        assert!(matches!(
            ChannelMapping::from(1).resolve(0, "input"),
            Err(PetalMixError::InvalidChannelMapping(_))
        ));
    }

    #[test]
    fn test_frame_counts() {
        let data: Arc<[f32]> = vec![0.0; 10].into();
        let action = Action::play_buffer(ActionId(1), data, vec![1, 2], Schedule::asap());
        assert_eq!(action.kind(), ActionKind::PlayBuffer);
        assert_eq!(action.total_frames(), Some(5));
        assert_eq!(action.state(), ActionState::Pending);
        assert_eq!(action.actual_time(), None);

        let (producer, _) = crate::RingBuffer::for_frames(1, 8).unwrap().split();
        let action = Action::record_ring_buffer(ActionId(2), producer, vec![1], Schedule::at(1.5));
        assert_eq!(action.total_frames(), None);
        assert_eq!(action.requested_time(), Some(1.5));
        assert!(action.kind().is_unbounded());
    }

    #[test]
    fn test_handle_returns_finished_action() {
        let handle = ActionHandle::new(ActionId(7), ActionKind::RecordBuffer);
        let slot = handle.slot();
        let handle = handle.into_finished().unwrap_err();

        let mut action =
            Action::record_buffer(ActionId(7), vec![0.25; 4], vec![1], Schedule::asap());
        action.finish(FinishReason::Completed);
        assert!(slot.set(action).is_ok());
        drop(slot);

        assert!(handle.is_finished());
        let action = handle.into_finished().expect("sole owner of a finished action");
        assert_eq!(action.into_recording(), Some(vec![0.25; 4]));
    }
}
