//! Error types for PetalMix

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetalMixError {
    #[error("Action queue is full")]
    QueueFull,

    #[error("Incompatible element size: ring buffer has {element_size} bytes, expected {expected}")]
    IncompatibleElementSize { element_size: usize, expected: usize },

    #[error("Invalid channel mapping: {0}")]
    InvalidChannelMapping(String),

    #[error("Ring buffer error: {0}")]
    RingBuffer(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PetalMixError>;
