//! Configuration for PetalMix streams

use crate::error::{PetalMixError, Result};
use std::time::Duration;

/// Which directions a stream transfers audio in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Recording only
    Input,
    /// Playback only
    Output,
    /// Playback and recording in the same callback
    Duplex,
}

impl Direction {
    pub fn has_input(&self) -> bool {
        matches!(self, Self::Input | Self::Duplex)
    }

    pub fn has_output(&self) -> bool {
        matches!(self, Self::Output | Self::Duplex)
    }
}

/// Configuration descriptor for a PetalMix stream
#[derive(Debug, Clone)]
pub struct PetalMixStreamDesc {
    /// Directions the stream is opened for
    pub direction: Direction,
    /// Sample rate of the stream, fixed for its lifetime
    pub sample_rate: u32,
    /// Number of device input channels (ignored without input)
    pub input_channels: u16,
    /// Number of device output channels (ignored without output)
    pub output_channels: u16,
    /// Fixed device block size in frames (None uses the device default)
    pub block_size: Option<u32>,
    /// Largest block the scheduler handles at once; larger device blocks are
    /// processed in consecutive chunks. Sizes the preallocated callback scratch.
    pub max_block_frames: usize,
    /// Capacity of the submit queues: how many submissions can wait for the
    /// callback at once (power of two)
    pub queue_size: usize,
    /// Number of play/record actions the callback keeps active at once.
    /// Further ones wait in the submit queue. Cancel and stats actions have
    /// `queue_size` slots of their own on top.
    pub max_active_actions: usize,
    /// Amount of captured audio a duplex device stream can buffer between
    /// its input and output callbacks
    pub duplex_buffer: Duration,
}

impl Default for PetalMixStreamDesc {
    fn default() -> Self {
        Self {
            direction: Direction::Output,
            sample_rate: 48000,
            input_channels: 1,
            output_channels: 2,
            block_size: None,
            max_block_frames: 4096,
            queue_size: 16,
            max_active_actions: 64,
            duplex_buffer: Duration::from_millis(100),
        }
    }
}

impl PetalMixStreamDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(channels: u16) -> Self {
        Self::default().direction(Direction::Output).output_channels(channels)
    }

    pub fn input(channels: u16) -> Self {
        Self::default().direction(Direction::Input).input_channels(channels)
    }

    pub fn duplex(input_channels: u16, output_channels: u16) -> Self {
        Self::default()
            .direction(Direction::Duplex)
            .input_channels(input_channels)
            .output_channels(output_channels)
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn input_channels(mut self, channels: u16) -> Self {
        self.input_channels = channels;
        self
    }

    pub fn output_channels(mut self, channels: u16) -> Self {
        self.output_channels = channels;
        self
    }

    pub fn block_size(mut self, frames: u32) -> Self {
        self.block_size = Some(frames);
        self
    }

    pub fn max_block_frames(mut self, frames: usize) -> Self {
        self.max_block_frames = frames;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn max_active_actions(mut self, count: usize) -> Self {
        self.max_active_actions = count;
        self
    }

    pub fn duplex_buffer(mut self, duration: Duration) -> Self {
        self.duplex_buffer = duration;
        self
    }

    /// Input channels actually in use (0 without input).
    pub fn active_input_channels(&self) -> usize {
        if self.direction.has_input() {
            self.input_channels as usize
        } else {
            0
        }
    }

    /// Output channels actually in use (0 without output).
    pub fn active_output_channels(&self) -> usize {
        if self.direction.has_output() {
            self.output_channels as usize
        } else {
            0
        }
    }

    /// Slots of the callback's active set: data actions plus the control reserve.
    pub fn active_capacity(&self) -> usize {
        self.max_active_actions + self.queue_size
    }

    /// Capacity of the completion queue, enough for a full active set.
    pub fn completion_queue_size(&self) -> usize {
        self.active_capacity().next_power_of_two()
    }

    /// Number of frames of the duplex bridge ring, rounded up to a power of two.
    pub fn duplex_buffer_frames(&self) -> usize {
        let frames = (self.duplex_buffer.as_secs_f64() * self.sample_rate as f64).ceil() as usize;
        frames.max(self.max_block_frames).next_power_of_two()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalMixError::Configuration(
                "sample rate must be greater than zero".into(),
            ));
        }
        if !self.queue_size.is_power_of_two() {
            return Err(PetalMixError::Configuration(format!(
                "queue size must be a power of two, got {}",
                self.queue_size
            )));
        }
        if self.direction.has_input() && self.input_channels == 0 {
            return Err(PetalMixError::Configuration(
                "an input stream needs at least one input channel".into(),
            ));
        }
        if self.direction.has_output() && self.output_channels == 0 {
            return Err(PetalMixError::Configuration(
                "an output stream needs at least one output channel".into(),
            ));
        }
        if self.max_active_actions == 0 {
            return Err(PetalMixError::Configuration(
                "max_active_actions must be greater than zero".into(),
            ));
        }
        if self.max_block_frames == 0 {
            return Err(PetalMixError::Configuration(
                "max_block_frames must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
