//! Block and xrun statistics.

/// Over-/underflow flags reported by the audio device for one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XrunFlags {
    pub input_underflow: bool,
    pub input_overflow: bool,
    pub output_underflow: bool,
    pub output_overflow: bool,
}

impl XrunFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !(self.input_underflow
            || self.input_overflow
            || self.output_underflow
            || self.output_overflow)
    }
}

/// Counters accumulated by the scheduler, once per processed block.
///
/// The stream keeps one live instance which is only ever snapshotted and
/// zeroed from inside the callback (see `FetchAndResetStats` actions), so
/// increments and resets never race. Every action additionally carries its
/// own instance covering the blocks in which it was active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks observed
    pub blocks: u64,
    /// Smallest block size in frames (0 until the first block)
    pub min_blocksize: u64,
    /// Largest block size in frames
    pub max_blocksize: u64,
    pub input_underflows: u64,
    pub input_overflows: u64,
    pub output_underflows: u64,
    pub output_overflows: u64,
}

impl Stats {
    /// Account for one block of `frames` frames.
    pub fn record_block(&mut self, frames: usize) {
        let frames = frames as u64;
        if self.blocks == 0 {
            self.min_blocksize = frames;
            self.max_blocksize = frames;
        } else {
            self.min_blocksize = self.min_blocksize.min(frames);
            self.max_blocksize = self.max_blocksize.max(frames);
        }
        self.blocks += 1;
    }

    /// Merge hardware-reported xrun flags into the counters.
    pub fn record_xruns(&mut self, flags: XrunFlags) {
        self.input_underflows += flags.input_underflow as u64;
        self.input_overflows += flags.input_overflow as u64;
        self.output_underflows += flags.output_underflow as u64;
        self.output_overflows += flags.output_overflow as u64;
    }

    /// Total number of over- and underflows.
    pub fn xruns(&self) -> u64 {
        self.input_underflows
            + self.input_overflows
            + self.output_underflows
            + self.output_overflows
    }

    pub fn has_xruns(&self) -> bool {
        self.xruns() > 0
    }

    /// Return the current counters and zero them.
    pub fn take(&mut self) -> Stats {
        std::mem::take(self)
    }
}
