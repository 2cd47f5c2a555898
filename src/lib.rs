//! PetalMix: sample-accurate playback and recording scheduled from a
//! realtime audio callback.
//!
//! A [`PetalMixController`] on the control thread submits actions (play or
//! record a buffer, play or record through a [`RingBuffer`], cancel, fetch
//! statistics), each with a start time in stream seconds. The paired
//! [`Scheduler`] runs inside the audio callback, where it starts every action
//! at the exact frame of its start time, mixes overlapping playback and
//! hands finished actions back. The callback side never allocates, locks or
//! blocks. [`PetalMixEngine`] drives the scheduler from cpal devices.
//!
//! ```no_run
//! use petalmix::{PetalMixController, PetalMixEngine, PetalMixStreamDesc, Schedule};
//! use std::time::Duration;
//!
//! # fn main() -> petalmix::Result<()> {
//! let desc = PetalMixStreamDesc::output(2);
//! let (mut controller, scheduler) = PetalMixController::new(&desc)?;
//! let mut engine = PetalMixEngine::new(desc, scheduler, controller.event_sender())?;
//! engine.start()?;
//!
//! let click = vec![1.0; 64];
//! let start = controller.time() + 0.5;
//! let handle = controller.play_buffer(click, [1, 2], Schedule::at(start))?;
//! controller.wait(Some(&handle), Duration::from_millis(10));
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod action_queue;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod ring_buffer;
pub mod scheduler;
pub mod stats;

pub use action::{
    Action, ActionHandle, ActionId, ActionKind, ActionState, ChannelMapping, FinishReason, Schedule,
};
pub use action_queue::{ActionReceiver, ActionSender, action_queue};
pub use config::{Direction, PetalMixStreamDesc};
pub use controller::PetalMixController;
pub use engine::PetalMixEngine;
pub use error::{PetalMixError, Result};
pub use events::PetalMixEvent;
pub use ring_buffer::{
    ReadRegions, RingBuffer, RingConsumer, RingProducer, SAMPLE_SIZE, WriteRegions,
};
pub use scheduler::{BlockInfo, Scheduler};
pub use stats::{Stats, XrunFlags};
