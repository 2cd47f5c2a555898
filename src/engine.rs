use crate::config::{Direction, PetalMixStreamDesc};
use crate::error::{PetalMixError, Result};
use crate::events::PetalMixEvent;
use crate::ring_buffer::{RingBuffer, RingConsumer, RingProducer};
use crate::scheduler::{BlockInfo, Scheduler};
use crate::stats::{Stats, XrunFlags};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// How long `stop` waits for the audio callback to hand the scheduler back.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Audio engine that drives a [`Scheduler`] from the default cpal devices
///
/// Output-only streams run the scheduler in the output callback and
/// input-only streams in the input callback. Duplex streams open both
/// devices and hand captured frames to the output callback through a
/// lock-free ring buffer, so the scheduler sees both directions in one call.
///
/// Stream time is the sample clock: frames processed since the first start
/// divided by the sample rate. The scheduler lives in the audio callback
/// while running and comes back to the engine when the streams are torn
/// down, so a stopped engine can be started again.
pub struct PetalMixEngine {
    desc: PetalMixStreamDesc,
    scheduler: Option<Scheduler>,
    released: Receiver<Scheduler>,
    release: Sender<Scheduler>,
    streams: Vec<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_processed: Arc<AtomicUsize>,
    event_sender: Sender<PetalMixEvent>,
}

impl PetalMixEngine {
    /// Create a new audio engine for the scheduler of a controller created from `desc`
    pub fn new(
        desc: PetalMixStreamDesc,
        scheduler: Scheduler,
        event_sender: Sender<PetalMixEvent>,
    ) -> Result<Self> {
        desc.validate()?;
        if scheduler.input_channels() != desc.active_input_channels()
            || scheduler.output_channels() != desc.active_output_channels()
        {
            return Err(PetalMixError::Engine(
                "Scheduler was created for a different stream configuration".into(),
            ));
        }

        let (release, released) = bounded(1);
        Ok(Self {
            desc,
            scheduler: Some(scheduler),
            released,
            release,
            streams: Vec::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            frames_processed: Arc::new(AtomicUsize::new(0)),
            event_sender,
        })
    }

    /// Open the device streams and start processing
    ///
    /// The scheduler moves into the audio callback until [`stop`](Self::stop).
    /// If opening or starting a stream fails, the scheduler stays with the
    /// engine and `start` can be retried.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let streams = match self.open_streams() {
            Ok(streams) => streams,
            Err(e) => {
                self.reclaim_scheduler(RELEASE_TIMEOUT);
                return Err(e);
            }
        };

        // Callbacks output silence until this is set.
        self.is_running.store(true, Ordering::Relaxed);
        if let Err(e) = streams.iter().try_for_each(|stream| stream.play()) {
            self.is_running.store(false, Ordering::Relaxed);
            drop(streams);
            self.reclaim_scheduler(RELEASE_TIMEOUT);
            return Err(PetalMixError::AudioDevice(format!(
                "Failed to start stream: {}",
                e
            )));
        }
        self.streams = streams;

        log::info!(
            "PetalMix engine started: {:?} at {} Hz",
            self.desc.direction,
            self.desc.sample_rate
        );
        let _ = self.event_sender.send(PetalMixEvent::StreamStarted);
        Ok(())
    }

    /// Stop the audio engine
    pub fn stop(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            return Ok(());
        }
        self.is_running.store(false, Ordering::Relaxed);
        // Dropping the streams stops them and releases the scheduler.
        self.streams.clear();
        if !self.reclaim_scheduler(RELEASE_TIMEOUT) {
            log::warn!("Audio callback did not release the scheduler");
        }

        log::info!(
            "PetalMix engine stopped after {} frames",
            self.frames_processed()
        );
        let _ = self.event_sender.send(PetalMixEvent::StreamStopped);
        Ok(())
    }

    /// Check if the engine is currently running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Get the number of audio frames processed since start
    pub fn frames_processed(&self) -> usize {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Stream statistics accumulated since the last fetch
    ///
    /// Only available while stopped; a running stream is queried with
    /// [`fetch_and_reset_stats`].
    ///
    /// [`fetch_and_reset_stats`]: crate::PetalMixController::fetch_and_reset_stats
    pub fn stats(&mut self) -> Result<Stats> {
        if self.is_running() {
            return Err(PetalMixError::Engine(
                "Stats are only readable while the engine is stopped".into(),
            ));
        }
        self.reclaim_scheduler(Duration::ZERO);
        self.scheduler
            .as_ref()
            .map(|scheduler| *scheduler.stats())
            .ok_or_else(|| {
                PetalMixError::Engine("Audio callback still holds the scheduler".into())
            })
    }

    pub fn config(&self) -> &PetalMixStreamDesc {
        &self.desc
    }

    /// Take the scheduler back from a released callback, waiting up to `timeout`.
    fn reclaim_scheduler(&mut self, timeout: Duration) -> bool {
        if self.scheduler.is_none() {
            self.scheduler = if timeout.is_zero() {
                self.released.try_recv().ok()
            } else {
                self.released.recv_timeout(timeout).ok()
            };
        }
        self.scheduler.is_some()
    }

    /// Hand the scheduler to a new callback runner.
    fn runner(&mut self, bridge: Option<BridgeReader>) -> Result<BlockRunner> {
        self.reclaim_scheduler(Duration::ZERO);
        let scheduler = self.scheduler.take().ok_or_else(|| {
            PetalMixError::Engine("Audio callback still holds the scheduler".into())
        })?;
        Ok(BlockRunner::new(
            &self.desc,
            scheduler,
            bridge,
            self.frames_processed.clone(),
            self.release.clone(),
        ))
    }

    fn open_streams(&mut self) -> Result<Vec<cpal::Stream>> {
        let host = cpal::default_host();
        match self.desc.direction {
            Direction::Output => {
                let device = host.default_output_device().ok_or_else(|| {
                    PetalMixError::AudioDevice("No default output device available".into())
                })?;
                let runner = self.runner(None)?;
                Ok(vec![self.build_output_stream(&device, runner)?])
            }
            Direction::Input => {
                let device = host.default_input_device().ok_or_else(|| {
                    PetalMixError::AudioDevice("No default input device available".into())
                })?;
                let runner = self.runner(None)?;
                Ok(vec![
                    self.build_input_stream(&device, InputSink::Scheduler(runner))?,
                ])
            }
            Direction::Duplex => {
                let input_device = host.default_input_device().ok_or_else(|| {
                    PetalMixError::AudioDevice("No default input device available".into())
                })?;
                let output_device = host.default_output_device().ok_or_else(|| {
                    PetalMixError::AudioDevice("No default output device available".into())
                })?;

                let (reader, writer) = bridge(&self.desc)?;
                let runner = self.runner(Some(reader))?;
                let input = self.build_input_stream(&input_device, InputSink::Bridge(writer))?;
                let output = self.build_output_stream(&output_device, runner)?;
                Ok(vec![input, output])
            }
        }
    }

    fn stream_config(&self, channels: u16) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.desc.sample_rate),
            buffer_size: match self.desc.block_size {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        }
    }

    fn build_output_stream(
        &self,
        device: &cpal::Device,
        runner: BlockRunner,
    ) -> Result<cpal::Stream> {
        let config = self.stream_config(self.desc.output_channels);
        let default_config = device.default_output_config().map_err(|e| {
            PetalMixError::AudioDevice(format!("Failed to get default output config: {}", e))
        })?;

        match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_output_stream::<f32>(device, &config, runner),
            cpal::SampleFormat::I16 => self.create_output_stream::<i16>(device, &config, runner),
            cpal::SampleFormat::U16 => self.create_output_stream::<u16>(device, &config, runner),
            format => Err(PetalMixError::AudioFormat(format!(
                "Unsupported output sample format {:?}",
                format
            ))),
        }
    }

    fn build_input_stream(&self, device: &cpal::Device, sink: InputSink) -> Result<cpal::Stream> {
        let config = self.stream_config(self.desc.input_channels);
        let default_config = device.default_input_config().map_err(|e| {
            PetalMixError::AudioDevice(format!("Failed to get default input config: {}", e))
        })?;

        match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_input_stream::<f32>(device, &config, sink),
            cpal::SampleFormat::I16 => self.create_input_stream::<i16>(device, &config, sink),
            cpal::SampleFormat::U16 => self.create_input_stream::<u16>(device, &config, sink),
            format => Err(PetalMixError::AudioFormat(format!(
                "Unsupported input sample format {:?}",
                format
            ))),
        }
    }

    /// Create a typed output stream
    fn create_output_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut runner: BlockRunner,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let is_running = self.is_running.clone();
        let events = self.event_sender.clone();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) {
                        for sample in data.iter_mut() {
                            *sample = T::from_sample(0.0f32);
                        }
                        return;
                    }
                    runner.render(data);
                },
                move |err| {
                    log::error!("Audio output stream error: {}", err);
                    let _ = events.send(PetalMixEvent::StreamError {
                        error: err.to_string(),
                    });
                },
                None,
            )
            .map_err(|e| {
                PetalMixError::AudioDevice(format!("Failed to build output stream: {}", e))
            })
    }

    /// Create a typed input stream
    fn create_input_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut sink: InputSink,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let is_running = self.is_running.clone();
        let events = self.event_sender.clone();

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) {
                        return;
                    }
                    match &mut sink {
                        InputSink::Scheduler(runner) => runner.capture(data),
                        InputSink::Bridge(writer) => writer.push(data),
                    }
                },
                move |err| {
                    log::error!("Audio input stream error: {}", err);
                    let _ = events.send(PetalMixEvent::StreamError {
                        error: err.to_string(),
                    });
                },
                None,
            )
            .map_err(|e| {
                PetalMixError::AudioDevice(format!("Failed to build input stream: {}", e))
            })
    }
}

impl Drop for PetalMixEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Where an input callback delivers captured frames.
enum InputSink {
    Scheduler(BlockRunner),
    Bridge(BridgeWriter),
}

/// Create both ends of the duplex bridge.
fn bridge(desc: &PetalMixStreamDesc) -> Result<(BridgeReader, BridgeWriter)> {
    let channels = desc.active_input_channels();
    let (producer, consumer) =
        RingBuffer::for_frames(channels, desc.duplex_buffer_frames())?.split();
    let overflowed = Arc::new(AtomicBool::new(false));

    let reader = BridgeReader {
        consumer,
        overflowed: overflowed.clone(),
    };
    let writer = BridgeWriter {
        producer,
        overflowed,
        channels,
        scratch: vec![0.0; desc.max_block_frames * channels],
    };
    Ok((reader, writer))
}

/// Input side of the duplex bridge, runs in the input callback.
struct BridgeWriter {
    producer: RingProducer,
    overflowed: Arc<AtomicBool>,
    channels: usize,
    scratch: Vec<f32>,
}

impl BridgeWriter {
    fn push<T>(&mut self, data: &[T])
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let chunk_frames = self.scratch.len() / self.channels;
        for chunk in data.chunks(chunk_frames * self.channels) {
            let frames = chunk.len() / self.channels;
            let samples = &mut self.scratch[..frames * self.channels];
            for (value, &sample) in samples.iter_mut().zip(chunk) {
                *value = sample.to_sample::<f32>();
            }
            if self.producer.write_samples(samples) < frames {
                self.overflowed.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Output side of the duplex bridge.
struct BridgeReader {
    consumer: RingConsumer,
    overflowed: Arc<AtomicBool>,
}

/// Runs the scheduler over device buffers of any size, in chunks of at most
/// `max_block_frames`, using preallocated scratch buffers.
///
/// Sends the scheduler back to the engine when dropped.
struct BlockRunner {
    scheduler: Option<Scheduler>,
    release: Sender<Scheduler>,
    bridge: Option<BridgeReader>,
    max_block_frames: usize,
    input: Vec<f32>,
    output: Vec<f32>,
    sample_rate: f64,
    sample_clock: u64,
    frames_processed: Arc<AtomicUsize>,
}

impl BlockRunner {
    fn new(
        desc: &PetalMixStreamDesc,
        scheduler: Scheduler,
        bridge: Option<BridgeReader>,
        frames_processed: Arc<AtomicUsize>,
        release: Sender<Scheduler>,
    ) -> Self {
        Self {
            input: vec![0.0; desc.max_block_frames * scheduler.input_channels()],
            output: vec![0.0; desc.max_block_frames * scheduler.output_channels()],
            scheduler: Some(scheduler),
            release,
            bridge,
            max_block_frames: desc.max_block_frames,
            sample_rate: desc.sample_rate as f64,
            // A restarted stream continues the clock of the previous one.
            sample_clock: frames_processed.load(Ordering::Relaxed) as u64,
            frames_processed,
        }
    }

    fn next_block(sample_clock: &mut u64, sample_rate: f64, frames: usize) -> BlockInfo {
        let time = *sample_clock as f64 / sample_rate;
        *sample_clock += frames as u64;
        BlockInfo::new(frames, time)
    }

    /// Fill an output buffer, pulling bridged input for duplex streams.
    fn render<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let output_channels = scheduler.output_channels();
        let input_channels = scheduler.input_channels();

        for chunk in data.chunks_mut(self.max_block_frames * output_channels) {
            let frames = chunk.len() / output_channels;
            let mut xruns = XrunFlags::none();

            let input_len = match self.bridge.as_mut() {
                Some(bridge) => {
                    let input = &mut self.input[..frames * input_channels];
                    let read = bridge.consumer.read_samples(input);
                    if read < frames {
                        input[read * input_channels..].fill(0.0);
                        xruns.input_underflow = true;
                    }
                    xruns.input_overflow = bridge.overflowed.swap(false, Ordering::Relaxed);
                    input.len()
                }
                None => 0,
            };

            let info = Self::next_block(&mut self.sample_clock, self.sample_rate, frames)
                .with_xruns(xruns);
            let output = &mut self.output[..frames * output_channels];
            scheduler.process(&self.input[..input_len], output, &info);
            for (sample, &value) in chunk.iter_mut().zip(output.iter()) {
                *sample = T::from_sample(value);
            }
        }

        self.frames_processed
            .fetch_add(data.len() / output_channels, Ordering::Relaxed);
    }

    /// Feed a captured buffer of an input-only stream to the scheduler.
    fn capture<T>(&mut self, data: &[T])
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let input_channels = scheduler.input_channels();

        for chunk in data.chunks(self.max_block_frames * input_channels) {
            let frames = chunk.len() / input_channels;
            let input = &mut self.input[..frames * input_channels];
            for (value, &sample) in input.iter_mut().zip(chunk) {
                *value = sample.to_sample::<f32>();
            }

            let info = Self::next_block(&mut self.sample_clock, self.sample_rate, frames);
            scheduler.process(&self.input[..frames * input_channels], &mut [], &info);
        }

        self.frames_processed
            .fetch_add(data.len() / input_channels, Ordering::Relaxed);
    }
}

impl Drop for BlockRunner {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            // Fails only once the engine is gone, and the scheduler with it.
            let _ = self.release.send(scheduler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Schedule;
    use crate::controller::PetalMixController;

    fn engine(desc: &PetalMixStreamDesc) -> (PetalMixController, PetalMixEngine) {
        let (controller, scheduler) = PetalMixController::new(desc).unwrap();
        let engine = PetalMixEngine::new(desc.clone(), scheduler, controller.event_sender());
        (controller, engine.unwrap())
    }

    #[test]
    fn test_engine_rejects_mismatched_scheduler() {
        let (controller, scheduler) =
            PetalMixController::new(&PetalMixStreamDesc::output(2)).unwrap();
        let result = PetalMixEngine::new(
            PetalMixStreamDesc::output(1),
            scheduler,
            controller.event_sender(),
        );
        assert!(matches!(result, Err(PetalMixError::Engine(_))));
    }

    #[test]
    fn test_large_device_buffers_are_chunked() {
        let desc = PetalMixStreamDesc::output(1).max_block_frames(64);
        let (mut controller, mut engine) = engine(&desc);
        controller.play_buffer(vec![0.5; 100], 1, Schedule::asap()).unwrap();

        let mut runner = engine.runner(None).unwrap();
        let mut data = vec![0.0f32; 200];
        runner.render(&mut data);
        drop(runner);

        assert!(data[..100].iter().all(|&s| s == 0.5));
        assert!(data[100..].iter().all(|&s| s == 0.0));
        assert_eq!(engine.frames_processed(), 200);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.blocks, 4);
        assert_eq!((stats.min_blocksize, stats.max_blocksize), (8, 64));
        assert!((controller.time() - 200.0 / 48000.0).abs() < 1e-12);
    }

    #[test]
    fn test_integer_output_is_converted() {
        let desc = PetalMixStreamDesc::output(1);
        let (mut controller, mut engine) = engine(&desc);
        controller.play_buffer(vec![1.0, -1.0, 0.0], 1, Schedule::asap()).unwrap();

        let mut data = vec![0i16; 3];
        engine.runner(None).unwrap().render(&mut data);
        assert!(data[0] > 32000);
        assert!(data[1] < -32000);
        assert_eq!(data[2], 0);
    }

    #[test]
    fn test_input_stream_records_captured_frames() {
        let desc = PetalMixStreamDesc::input(2).max_block_frames(4);
        let (mut controller, mut engine) = engine(&desc);
        let recording = controller
            .record_buffer(vec![0.0; 12], 2, Schedule::asap())
            .unwrap();

        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        engine.runner(None).unwrap().capture(&data);
        controller.drain_completions();

        let action = recording.into_finished().unwrap();
        let expected: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(action.into_recording().unwrap(), expected);
    }

    #[test]
    fn test_duplex_bridge_delivers_input_and_reports_xruns() {
        let desc = PetalMixStreamDesc::duplex(1, 1)
            .max_block_frames(8)
            .duplex_buffer(Duration::ZERO);
        let (mut controller, mut engine) = engine(&desc);
        let (reader, mut writer) = bridge(&desc).unwrap();
        let mut runner = engine.runner(Some(reader)).unwrap();

        let recording = controller.record_buffer(vec![0.0; 8], 1, Schedule::asap()).unwrap();

        // The bridge holds 8 frames; the rest is lost.
        writer.push(&[0.25f32; 12]);
        runner.render(&mut [0.0f32; 8]);
        // Nothing new has arrived for this block.
        runner.render(&mut [0.0f32; 8]);
        drop(runner);
        controller.drain_completions();

        let recorded = recording.into_finished().unwrap().into_recording().unwrap();
        assert_eq!(recorded, vec![0.25; 8]);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.input_overflows, 1);
        assert_eq!(stats.input_underflows, 1);
    }

    #[test]
    fn test_stats_readable_before_start() {
        let (_controller, mut engine) = engine(&PetalMixStreamDesc::output(1));
        assert_eq!(engine.stats().unwrap(), Stats::default());
    }

    #[test]
    fn test_stats_rejected_while_running() {
        let (_controller, mut engine) = engine(&PetalMixStreamDesc::output(1));
        engine.is_running.store(true, Ordering::Relaxed);
        assert!(matches!(engine.stats(), Err(PetalMixError::Engine(_))));
        engine.is_running.store(false, Ordering::Relaxed);
    }

    #[test]
    fn test_stats_survive_released_callback() {
        let (controller, mut engine) = engine(&PetalMixStreamDesc::output(1));
        let mut runner = engine.runner(None).unwrap();
        runner.render(&mut [0.0f32; 64]);

        // The callback still owns the scheduler.
        assert!(engine.stats().is_err());
        drop(runner);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.min_blocksize, 64);

        // A restarted callback continues the stream clock and the stats.
        let mut runner = engine.runner(None).unwrap();
        runner.render(&mut [0.0f32; 64]);
        drop(runner);
        assert!((controller.time() - 128.0 / 48000.0).abs() < 1e-12);
        assert_eq!(engine.stats().unwrap().blocks, 2);
    }

    #[test]
    fn test_scheduler_kept_when_stream_is_never_built() {
        let (_controller, mut engine) = engine(&PetalMixStreamDesc::output(1));
        let runner = engine.runner(None).unwrap();
        assert!(matches!(engine.runner(None), Err(PetalMixError::Engine(_))));

        // A failed stream build drops the callback, and the runner with it.
        drop(runner);
        assert!(engine.runner(None).is_ok());
    }
}
