//! Control-thread side of a stream.
//!
//! [`PetalMixController`] builds and validates actions, moves them to the
//! [`Scheduler`] through the submit queues and collects them again from the
//! completion queue. `Cancel` and `FetchAndResetStats` travel on a queue of
//! their own, so a stream busy with audio can still be controlled.
//!
//! Every in-flight action stays registered until its completion has been
//! observed, then the finished action goes into the caller's [`ActionHandle`].
//! Submission only fails with [`PetalMixError::QueueFull`] when the queue it
//! goes on has no room.

use crate::action::{Action, ActionHandle, ActionId, ChannelMapping, FinishReason, Schedule};
use crate::action_queue::{ActionReceiver, ActionSender, action_queue};
use crate::config::PetalMixStreamDesc;
use crate::error::{PetalMixError, Result};
use crate::events::PetalMixEvent;
use crate::ring_buffer::{RingConsumer, RingProducer, SAMPLE_SIZE};
use crate::scheduler::{Scheduler, StreamClock};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Submits actions to a stream and tracks them until they finish.
///
/// Submission is single-producer: the controller takes `&mut self` for
/// everything that touches the queues.
pub struct PetalMixController {
    desc: PetalMixStreamDesc,
    submit: ActionSender,
    control: ActionSender,
    completions: ActionReceiver,
    in_flight: HashMap<ActionId, Arc<OnceLock<Action>>>,
    next_id: u64,
    clock: Arc<StreamClock>,
    event_sender: Sender<PetalMixEvent>,
    event_receiver: Receiver<PetalMixEvent>,
}

impl PetalMixController {
    /// Create the controller and the scheduler that goes into the audio callback.
    pub fn new(desc: &PetalMixStreamDesc) -> Result<(Self, Scheduler)> {
        desc.validate()?;

        let (submit, scheduler_submit) = action_queue(desc.queue_size)?;
        let (control, scheduler_control) = action_queue(desc.queue_size)?;
        let (scheduler_completions, completions) = action_queue(desc.completion_queue_size())?;
        let clock = Arc::new(StreamClock::default());
        let (event_sender, event_receiver) = unbounded();

        let scheduler = Scheduler::new(
            desc,
            scheduler_submit,
            scheduler_control,
            scheduler_completions,
            Arc::clone(&clock),
        );

        log::debug!(
            "Created PetalMix controller: {:?}, {} Hz, {} in / {} out, queue size {}, {} active",
            desc.direction,
            desc.sample_rate,
            desc.active_input_channels(),
            desc.active_output_channels(),
            desc.queue_size,
            desc.max_active_actions
        );

        let controller = Self {
            desc: desc.clone(),
            submit,
            control,
            completions,
            in_flight: HashMap::with_capacity(desc.active_capacity()),
            next_id: 0,
            clock,
            event_sender,
            event_receiver,
        };
        Ok((controller, scheduler))
    }

    pub fn desc(&self) -> &PetalMixStreamDesc {
        &self.desc
    }

    pub fn sample_rate(&self) -> u32 {
        self.desc.sample_rate
    }

    pub fn input_channels(&self) -> usize {
        self.desc.active_input_channels()
    }

    pub fn output_channels(&self) -> usize {
        self.desc.active_output_channels()
    }

    /// Stream time at the end of the most recently processed block.
    pub fn time(&self) -> f64 {
        self.clock.load()
    }

    /// Play interleaved samples on the mapped output channels.
    ///
    /// Trailing samples that do not fill a whole frame are ignored.
    pub fn play_buffer(
        &mut self,
        data: impl Into<Arc<[f32]>>,
        channels: impl Into<ChannelMapping>,
        schedule: Schedule,
    ) -> Result<ActionHandle> {
        let mapping = channels.into().resolve(self.output_channels(), "output")?;
        let id = self.allocate_id();
        self.submit(Action::play_buffer(id, data.into(), mapping, schedule))
    }

    /// Record into `buffer` from the mapped input channels until it is full.
    ///
    /// Take the buffer back with [`Action::into_recording`] once finished.
    pub fn record_buffer(
        &mut self,
        buffer: Vec<f32>,
        channels: impl Into<ChannelMapping>,
        schedule: Schedule,
    ) -> Result<ActionHandle> {
        let mapping = channels.into().resolve(self.input_channels(), "input")?;
        let id = self.allocate_id();
        self.submit(Action::record_buffer(id, buffer, mapping, schedule))
    }

    /// Play frames from a ring buffer until cancelled.
    ///
    /// Without a mapping, the ring's frame width decides the channel count.
    /// The consumer is dropped if the submission is rejected.
    pub fn play_ring_buffer(
        &mut self,
        consumer: RingConsumer,
        channels: Option<ChannelMapping>,
        schedule: Schedule,
    ) -> Result<ActionHandle> {
        let max_channels = self.output_channels();
        let mapping = ring_mapping(consumer.element_size(), channels, max_channels, "output")?;
        let id = self.allocate_id();
        self.submit(Action::play_ring_buffer(id, consumer, mapping, schedule))
    }

    /// Record frames into a ring buffer until cancelled.
    pub fn record_ring_buffer(
        &mut self,
        producer: RingProducer,
        channels: Option<ChannelMapping>,
        schedule: Schedule,
    ) -> Result<ActionHandle> {
        let max_channels = self.input_channels();
        let mapping = ring_mapping(producer.element_size(), channels, max_channels, "input")?;
        let id = self.allocate_id();
        self.submit(Action::record_ring_buffer(id, producer, mapping, schedule))
    }

    /// Stop `action` at the scheduled time.
    ///
    /// The returned handle finishes once the cancellation has taken effect.
    pub fn cancel(&mut self, action: &ActionHandle, schedule: Schedule) -> Result<ActionHandle> {
        let id = self.allocate_id();
        self.submit(Action::cancel(id, action.id(), action.kind(), schedule))
    }

    /// Snapshot and reset the stream statistics at the scheduled time.
    ///
    /// Read the snapshot from [`Action::result_stats`] once the handle has finished.
    pub fn fetch_and_reset_stats(&mut self, schedule: Schedule) -> Result<ActionHandle> {
        let id = self.allocate_id();
        self.submit(Action::fetch_and_reset_stats(id, schedule))
    }

    fn allocate_id(&mut self) -> ActionId {
        let id = ActionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn submit(&mut self, action: Action) -> Result<ActionHandle> {
        self.drain_completions();

        let handle = ActionHandle::new(action.id(), action.kind());
        let kind = action.kind();
        let requested_time = action.requested_time();
        let queue = if kind.is_control() {
            &mut self.control
        } else {
            &mut self.submit
        };
        if queue.try_push(Box::new(action)).is_err() {
            log::debug!("Rejecting {}: submit queue is full", handle.id());
            return Err(PetalMixError::QueueFull);
        }
        self.in_flight.insert(handle.id(), handle.slot());

        log::debug!(
            "Submitted {} ({:?}) for {}",
            handle.id(),
            kind,
            requested_time.map_or_else(|| "asap".to_string(), |t| format!("{:.6}s", t))
        );
        Ok(handle)
    }

    /// Collect finished actions from the scheduler.
    ///
    /// Returns the number of actions collected.
    ///
    /// # Panics
    ///
    /// If the completion queue hands back an action this controller never
    /// submitted.
    pub fn drain_completions(&mut self) -> usize {
        let mut count = 0;
        while let Some(action) = self.completions.try_pop() {
            let Some(slot) = self.in_flight.remove(&action.id()) else {
                panic!("completion queue returned untracked {}", action.id());
            };
            self.emit_completion_events(&action);
            // Each slot is filled exactly once, by the action it was made for.
            let _ = slot.set(*action);
            count += 1;
        }
        count
    }

    fn emit_completion_events(&self, action: &Action) {
        let action_id = action.id();
        let kind = action.kind();
        let event = match action.finish_reason() {
            Some(FinishReason::Cancelled) => PetalMixEvent::ActionCancelled {
                action_id,
                kind,
                done_frames: action.done_frames(),
            },
            Some(FinishReason::Dropped) => {
                log::warn!("{} ({:?}) was dropped, its start time had passed", action_id, kind);
                PetalMixEvent::ActionDropped { action_id, kind }
            }
            _ => PetalMixEvent::ActionCompleted {
                action_id,
                kind,
                done_frames: action.done_frames(),
            },
        };
        let _ = self.event_sender.send(event);

        if let Some(stats) = action.result_stats().filter(|stats| stats.has_xruns()) {
            log::warn!("Stream reported {} xruns: {:?}", stats.xruns(), stats);
            let _ = self.event_sender.send(PetalMixEvent::XrunsReported {
                action_id,
                stats: *stats,
            });
        }
    }

    /// Identities of all actions still in flight.
    pub fn active_actions(&mut self) -> HashSet<ActionId> {
        self.drain_completions();
        self.in_flight.keys().copied().collect()
    }

    pub fn is_active(&mut self, action: &ActionHandle) -> bool {
        self.drain_completions();
        self.in_flight.contains_key(&action.id())
    }

    /// Block until `action` (or every action, for `None`) has finished,
    /// checking every `poll_interval`.
    pub fn wait(&mut self, action: Option<&ActionHandle>, poll_interval: Duration) {
        while self.is_waiting_on(action) {
            std::thread::sleep(poll_interval);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns whether the awaited actions finished in time.
    pub fn wait_timeout(
        &mut self,
        action: Option<&ActionHandle>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_waiting_on(action) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(poll_interval.min(deadline - now));
        }
        true
    }

    fn is_waiting_on(&mut self, action: Option<&ActionHandle>) -> bool {
        match action {
            Some(action) => self.is_active(action),
            None => !self.active_actions().is_empty(),
        }
    }

    /// All events emitted since the last poll, without blocking.
    pub fn poll_events(&self) -> Vec<PetalMixEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// Sender for the controller's event channel, e.g. for the device engine.
    pub fn event_sender(&self) -> Sender<PetalMixEvent> {
        self.event_sender.clone()
    }
}

/// Resolve the mapping of a ring-buffer action and check that the ring's
/// elements are whole frames of it.
fn ring_mapping(
    element_size: usize,
    channels: Option<ChannelMapping>,
    max_channels: usize,
    direction: &str,
) -> Result<Vec<usize>> {
    let channels = channels.unwrap_or(ChannelMapping::Count(element_size / SAMPLE_SIZE));
    let mapping = channels.resolve(max_channels, direction)?;
    let expected = mapping.len() * SAMPLE_SIZE;
    if element_size != expected {
        return Err(PetalMixError::IncompatibleElementSize {
            element_size,
            expected,
        });
    }
    Ok(mapping)
}
