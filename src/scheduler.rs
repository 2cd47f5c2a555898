//! The audio callback body.
//!
//! [`Scheduler::process`] runs once per audio block on the realtime thread.
//! Per block it:
//!
//! 1. Admits waiting actions in submission order: audio actions up to
//!    `max_active_actions`, then `Cancel`/`FetchAndResetStats` into a
//!    reserve of their own
//! 2. Advances each active action against the block: starts it when its
//!    requested time falls inside the block, mixes played samples into the
//!    output (summing, so overlapping actions mix), copies recorded samples
//!    out of the input, and carries out `Cancel`/`FetchAndResetStats`
//! 3. Moves finished actions onto the completion queue while it has room;
//!    the rest stay in the active set for a later block
//! 4. Updates the stream statistics and the shared stream clock
//!
//! The scheduler never allocates, locks, blocks or logs. The active set is
//! preallocated and admission stops at its limits, so it never grows.

use crate::action::{Action, ActionId, ActionKind, ActionState, FinishReason, Payload};
use crate::action_queue::{ActionReceiver, ActionSender};
use crate::config::PetalMixStreamDesc;
use crate::ring_buffer::{SAMPLE_SIZE, sample_at, store_sample};
use crate::stats::{Stats, XrunFlags};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Timing and status of one audio block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockInfo {
    /// Number of frames in the block
    pub frames: usize,
    /// Stream time at which the first input frame was captured
    pub input_time: f64,
    /// Stream time at which the first output frame will be played
    pub output_time: f64,
    /// Over-/underflows the device reported for this block
    pub xruns: XrunFlags,
}

impl BlockInfo {
    /// A block whose input and output share the same start time.
    pub fn new(frames: usize, time: f64) -> Self {
        Self {
            frames,
            input_time: time,
            output_time: time,
            xruns: XrunFlags::none(),
        }
    }

    pub fn with_times(mut self, input_time: f64, output_time: f64) -> Self {
        self.input_time = input_time;
        self.output_time = output_time;
        self
    }

    pub fn with_xruns(mut self, xruns: XrunFlags) -> Self {
        self.xruns = xruns;
        self
    }
}

/// Latest stream time seen by the scheduler, readable from the control thread.
#[derive(Debug, Default)]
pub(crate) struct StreamClock {
    seconds: AtomicU64,
}

impl StreamClock {
    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.seconds.load(Ordering::Acquire))
    }

    fn store(&self, seconds: f64) {
        self.seconds.store(seconds.to_bits(), Ordering::Release);
    }
}

/// Realtime side of a stream: owns the active actions and the live stats.
#[derive(Debug)]
pub struct Scheduler {
    input_channels: usize,
    output_channels: usize,
    sample_rate: f64,
    submit: ActionReceiver,
    control: ActionReceiver,
    completions: ActionSender,
    active: Vec<Box<Action>>,
    max_active_actions: usize,
    control_reserve: usize,
    /// Newest audio action taken off the submit queue
    last_admitted: Option<ActionId>,
    stats: Stats,
    clock: Arc<StreamClock>,
}

impl Scheduler {
    pub(crate) fn new(
        desc: &PetalMixStreamDesc,
        submit: ActionReceiver,
        control: ActionReceiver,
        completions: ActionSender,
        clock: Arc<StreamClock>,
    ) -> Self {
        Self {
            input_channels: desc.active_input_channels(),
            output_channels: desc.active_output_channels(),
            sample_rate: desc.sample_rate as f64,
            submit,
            control,
            completions,
            active: Vec::with_capacity(desc.active_capacity()),
            max_active_actions: desc.max_active_actions,
            control_reserve: desc.queue_size,
            last_admitted: None,
            stats: Stats::default(),
            clock,
        }
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Live stream statistics (only meaningful while no block is running).
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of admitted actions that have not been retired yet.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Process one block.
    ///
    /// `input` holds `info.frames` interleaved frames of `input_channels()`
    /// samples (empty without input); `output` has room for `info.frames`
    /// frames of `output_channels()` samples and is overwritten.
    pub fn process(&mut self, input: &[f32], output: &mut [f32], info: &BlockInfo) {
        let frames = info.frames;
        let input = &input[..frames * self.input_channels];
        let output = &mut output[..frames * self.output_channels];
        output.fill(0.0);

        self.admit();
        for index in 0..self.active.len() {
            self.advance(index, input, output, info);
        }
        self.retire();

        self.stats.record_block(frames);
        self.stats.record_xruns(info.xruns);

        let block_time = if self.output_channels > 0 {
            info.output_time
        } else {
            info.input_time
        };
        self.clock.store(block_time + frames as f64 / self.sample_rate);
    }

    fn admit(&mut self) {
        let control = self.active.iter().filter(|a| a.kind().is_control()).count();
        let mut audio = self.active.len() - control;

        // Anything over the limits stays queued for a later block.
        while audio < self.max_active_actions {
            let Some(action) = self.submit.try_pop() else {
                break;
            };
            self.last_admitted = Some(action.id);
            self.active.push(action);
            audio += 1;
        }
        for _ in control..self.control_reserve {
            let Some(action) = self.control.try_pop() else {
                break;
            };
            self.active.push(action);
        }
    }

    fn io_time(&self, kind: ActionKind, info: &BlockInfo) -> f64 {
        if kind.is_playing() {
            info.output_time
        } else if kind.is_recording() || self.output_channels == 0 {
            info.input_time
        } else {
            info.output_time
        }
    }

    fn advance(&mut self, index: usize, input: &[f32], output: &mut [f32], info: &BlockInfo) {
        let io_time = self.io_time(self.active[index].kind(), info);
        let sample_rate = self.sample_rate;
        let frames = info.frames;

        let action: &mut Action = &mut self.active[index];
        let offset = match action.state {
            ActionState::Pending => match start(action, io_time, frames, sample_rate) {
                Some(offset) => offset,
                None => return,
            },
            ActionState::Active => 0,
            ActionState::Finished(_) => return,
        };
        let window = frames - offset;

        let cancel_target = match &mut action.payload {
            Payload::PlayBuffer(data) => {
                let channels = action.mapping.len();
                let done = action.done_frames as usize;
                let count = remaining(action.total_frames, action.done_frames).min(window);
                mix_frames(
                    &data[done * channels..],
                    count,
                    &action.mapping,
                    &mut output[offset * self.output_channels..],
                    self.output_channels,
                );
                action.done_frames += count as u64;
                action.stats.record_block(window);
                None
            }
            Payload::RecordBuffer(buffer) => {
                let channels = action.mapping.len();
                let done = action.done_frames as usize;
                let count = remaining(action.total_frames, action.done_frames).min(window);
                capture_frames(
                    &input[offset * self.input_channels..],
                    self.input_channels,
                    count,
                    &action.mapping,
                    &mut buffer[done * channels..],
                );
                action.done_frames += count as u64;
                action.stats.record_block(window);
                None
            }
            Payload::PlayRingBuffer(consumer) => {
                let element_size = consumer.element_size();
                let regions = consumer.get_read_regions(window);
                let count = regions.elements;
                let first_frames = regions.first.len() / element_size;
                let target = &mut output[offset * self.output_channels..];
                mix_bytes(regions.first, &action.mapping, target, self.output_channels);
                mix_bytes(
                    regions.second,
                    &action.mapping,
                    &mut target[first_frames * self.output_channels..],
                    self.output_channels,
                );
                consumer.advance_read_index(count);
                action.done_frames += count as u64;
                action.stats.record_block(window);
                if count < window {
                    self.stats.output_underflows += 1;
                    action.stats.output_underflows += 1;
                }
                None
            }
            Payload::RecordRingBuffer(producer) => {
                let element_size = producer.element_size();
                let regions = producer.get_write_regions(window);
                let count = regions.elements;
                let first_frames = regions.first.len() / element_size;
                let source = &input[offset * self.input_channels..];
                capture_bytes(source, self.input_channels, &action.mapping, regions.first);
                capture_bytes(
                    &source[first_frames * self.input_channels..],
                    self.input_channels,
                    &action.mapping,
                    regions.second,
                );
                producer.advance_write_index(count);
                action.done_frames += count as u64;
                action.stats.record_block(window);
                if count < window {
                    self.stats.input_overflows += 1;
                    action.stats.input_overflows += 1;
                }
                None
            }
            Payload::Cancel(target, target_kind) => Some((*target, *target_kind)),
            Payload::FetchAndResetStats => {
                action.result_stats = Some(self.stats.take());
                None
            }
        };

        match action.payload {
            Payload::PlayBuffer(_) | Payload::RecordBuffer(_) => {
                action.stats.record_xruns(info.xruns);
                if action.total_frames == Some(action.done_frames) {
                    action.finish(FinishReason::Completed);
                }
            }
            Payload::PlayRingBuffer(_) | Payload::RecordRingBuffer(_) => {
                action.stats.record_xruns(info.xruns);
            }
            Payload::FetchAndResetStats => action.finish(FinishReason::Completed),
            Payload::Cancel(..) => {}
        }

        if let Some((target, target_kind)) = cancel_target {
            if self.cancel(target, target_kind) {
                self.active[index].finish(FinishReason::Completed);
            }
        }
    }

    /// Finish `target` as cancelled.
    ///
    /// Returns `false` while the target still waits on the submit queue, so
    /// the cancel is retried next block. A target that already finished
    /// makes the cancel a no-op.
    fn cancel(&mut self, target: ActionId, target_kind: ActionKind) -> bool {
        if let Some(action) = self
            .active
            .iter_mut()
            .find(|action| action.id == target && !action.is_finished())
        {
            action.finish(FinishReason::Cancelled);
            return true;
        }
        target_kind.is_control() || self.last_admitted.is_some_and(|last| target <= last)
    }

    fn retire(&mut self) {
        let mut index = 0;
        while index < self.active.len() {
            if !self.active[index].is_finished() {
                index += 1;
                continue;
            }
            if self.completions.is_full() {
                break;
            }
            // Vec::remove keeps admission order and never reallocates.
            let action = self.active.remove(index);
            if let Err(action) = self.completions.try_push(action) {
                // The controller is gone.
                self.active.insert(index, action);
                break;
            }
        }
    }
}

/// Decide whether a pending action starts in this block.
///
/// Returns the frame offset into the block at which it starts. Marks the
/// action as dropped when it is belated and belated starts are not allowed.
fn start(action: &mut Action, io_time: f64, frames: usize, sample_rate: f64) -> Option<usize> {
    let offset = match action.requested_time {
        None => {
            action.actual_time = Some(io_time);
            0
        }
        Some(requested) if requested >= io_time => {
            let offset = ((requested - io_time) * sample_rate).round() as usize;
            if offset >= frames {
                // Too early. Timestamps jitter, so the block that should
                // contain the start may report a time slightly past it.
                action.seen_early = true;
                return None;
            }
            action.actual_time = Some(io_time + offset as f64 / sample_rate);
            offset
        }
        Some(_) if action.allow_belated || action.seen_early => {
            action.actual_time = Some(io_time);
            0
        }
        Some(_) => {
            action.finish(FinishReason::Dropped);
            return None;
        }
    };
    action.state = ActionState::Active;
    Some(offset)
}

fn remaining(total_frames: Option<u64>, done_frames: u64) -> usize {
    total_frames.map_or(usize::MAX, |total| (total - done_frames) as usize)
}

/// Add `frames` interleaved frames of `source` into the mapped channels of `target`.
fn mix_frames(
    source: &[f32],
    frames: usize,
    mapping: &[usize],
    target: &mut [f32],
    target_channels: usize,
) {
    let frames_in = source.chunks_exact(mapping.len()).take(frames);
    for (frame, out) in frames_in.zip(target.chunks_exact_mut(target_channels)) {
        for (&sample, &channel) in frame.iter().zip(mapping) {
            out[channel - 1] += sample;
        }
    }
}

/// Copy the mapped channels of `frames` frames of `source` into `target`.
fn capture_frames(
    source: &[f32],
    source_channels: usize,
    frames: usize,
    mapping: &[usize],
    target: &mut [f32],
) {
    let frames_in = source.chunks_exact(source_channels).take(frames);
    for (frame, out) in frames_in.zip(target.chunks_exact_mut(mapping.len())) {
        for (slot, &channel) in out.iter_mut().zip(mapping) {
            *slot = frame[channel - 1];
        }
    }
}

/// Like [`mix_frames`], reading float frames out of ring buffer bytes.
fn mix_bytes(source: &[u8], mapping: &[usize], target: &mut [f32], target_channels: usize) {
    let channels = mapping.len();
    let frames = source.len() / (channels * SAMPLE_SIZE);
    for (frame, out) in target.chunks_exact_mut(target_channels).take(frames).enumerate() {
        for (index, &channel) in mapping.iter().enumerate() {
            out[channel - 1] += sample_at(source, frame * channels + index);
        }
    }
}

/// Like [`capture_frames`], writing float frames into ring buffer bytes.
fn capture_bytes(source: &[f32], source_channels: usize, mapping: &[usize], target: &mut [u8]) {
    let channels = mapping.len();
    let frames = target.len() / (channels * SAMPLE_SIZE);
    for (frame, input) in source.chunks_exact(source_channels).take(frames).enumerate() {
        for (index, &channel) in mapping.iter().enumerate() {
            store_sample(target, frame * channels + index, input[channel - 1]);
        }
    }
}
