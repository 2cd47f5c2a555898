use petalmix::{
    ActionKind, BlockInfo, FinishReason, PetalMixController, PetalMixError, PetalMixEvent,
    PetalMixStreamDesc, RingBuffer, Schedule, Scheduler, Stats,
};
use std::time::Duration;

const RATE: u32 = 48000;
const BLOCK: usize = 256;

/// Feeds fixed-size blocks to a scheduler on a running sample clock.
struct FakeDevice {
    scheduler: Scheduler,
    frames: u64,
}

impl FakeDevice {
    fn new(scheduler: Scheduler) -> Self {
        Self { scheduler, frames: 0 }
    }

    fn time(&self) -> f64 {
        self.frames as f64 / RATE as f64
    }

    fn run_block(&mut self, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0; BLOCK * self.scheduler.output_channels()];
        let info = BlockInfo::new(BLOCK, self.time());
        self.scheduler.process(input, &mut output, &info);
        self.frames += BLOCK as u64;
        output
    }

    fn run_blocks(&mut self, count: usize) -> Vec<f32> {
        let silence = vec![0.0; BLOCK * self.scheduler.input_channels()];
        (0..count).flat_map(|_| self.run_block(&silence)).collect()
    }
}

fn output_stream() -> (PetalMixController, FakeDevice) {
    let desc = PetalMixStreamDesc::output(1).sample_rate(RATE);
    let (controller, scheduler) = PetalMixController::new(&desc).unwrap();
    (controller, FakeDevice::new(scheduler))
}

#[test]
fn test_play_buffer_across_blocks() {
    let (mut controller, mut device) = output_stream();
    let handle = controller.play_buffer(vec![1.0; 1000], 1, Schedule::asap()).unwrap();

    let output = device.run_blocks(4);
    assert!(output[..1000].iter().all(|&s| s == 1.0));
    assert!(output[1000..].iter().all(|&s| s == 0.0));

    controller.wait(Some(&handle), Duration::from_millis(1));
    let action = handle.finished().unwrap();
    assert_eq!(action.done_frames(), 1000);
    assert_eq!(action.total_frames(), Some(1000));
    assert_eq!(action.actual_time(), Some(0.0));
    assert_eq!(action.finish_reason(), Some(FinishReason::Completed));
    assert_eq!(action.stats().blocks, 4);
}

#[test]
fn test_scheduled_click_lands_on_exact_frame() {
    let (mut controller, mut device) = output_stream();
    device.run_blocks(2);

    // 300 frames after the current block boundary.
    let start = controller.time() + 300.0 / RATE as f64;
    let handle = controller.play_buffer(vec![1.0], 1, Schedule::at(start)).unwrap();

    let output = device.run_blocks(2);
    let click: Vec<usize> = output
        .iter()
        .enumerate()
        .filter(|(_, s)| **s != 0.0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(click, vec![300]);

    controller.drain_completions();
    let actual = handle.finished().unwrap().actual_time().unwrap();
    assert!((actual - start).abs() < 0.5 / RATE as f64);
}

#[test]
fn test_delay_line_through_ring_buffers() {
    let desc = PetalMixStreamDesc::duplex(1, 1).sample_rate(RATE);
    let (mut controller, scheduler) = PetalMixController::new(&desc).unwrap();
    let mut device = FakeDevice::new(scheduler);

    let (producer, consumer) = RingBuffer::for_frames(1, 1024).unwrap().split();
    // Start playing one block after recording began.
    let start = controller.time() + BLOCK as f64 / RATE as f64;
    let recording = controller.record_ring_buffer(producer, None, Schedule::asap()).unwrap();
    let playing = controller
        .play_ring_buffer(consumer, None, Schedule::at(start))
        .unwrap();

    let ramp: Vec<f32> = (0..BLOCK).map(|i| i as f32).collect();
    let first = device.run_block(&ramp);
    let second = device.run_block(&vec![0.0; BLOCK]);
    assert!(first.iter().all(|&s| s == 0.0));
    assert_eq!(second, ramp);

    controller.cancel(&recording, Schedule::asap()).unwrap();
    controller.cancel(&playing, Schedule::asap()).unwrap();
    device.run_blocks(1);
    controller.wait(None, Duration::from_millis(1));

    let recorded = recording.finished().unwrap();
    assert_eq!(recorded.finish_reason(), Some(FinishReason::Cancelled));
    assert_eq!(recorded.done_frames(), 3 * BLOCK as u64);
    let played = playing.finished().unwrap();
    assert_eq!(played.done_frames(), 2 * BLOCK as u64);
    assert_eq!(played.stats().output_underflows, 0);
}

#[test]
fn test_stats_fetch_covers_blocks_since_last_fetch() {
    let (mut controller, mut device) = output_stream();
    device.run_blocks(5);

    let first = controller.fetch_and_reset_stats(Schedule::asap()).unwrap();
    device.run_blocks(3);
    let second = controller.fetch_and_reset_stats(Schedule::asap()).unwrap();
    device.run_blocks(1);
    controller.drain_completions();

    let first = *first.finished().unwrap().result_stats().unwrap();
    assert_eq!(first.blocks, 5);
    assert_eq!(first.min_blocksize, BLOCK as u64);
    assert!(!first.has_xruns());

    // The block carrying the first fetch is counted after its reset.
    let second = *second.finished().unwrap().result_stats().unwrap();
    assert_eq!(second.blocks, 3);
    assert_ne!(second, Stats::default());
}

#[test]
fn test_belated_and_cancelled_outcomes_in_events() {
    let (mut controller, mut device) = output_stream();
    device.run_blocks(4);

    let late = controller
        .play_buffer(vec![1.0; 10], 1, Schedule::at(0.0).allow_belated(false))
        .unwrap();
    let long = controller.play_buffer(vec![1.0; 10_000], 1, Schedule::asap()).unwrap();
    device.run_blocks(1);
    let cancel = controller.cancel(&long, Schedule::asap()).unwrap();
    device.run_blocks(1);
    controller.drain_completions();

    let events = controller.poll_events();
    assert!(events.contains(&PetalMixEvent::ActionDropped {
        action_id: late.id(),
        kind: ActionKind::PlayBuffer,
    }));
    assert!(events.contains(&PetalMixEvent::ActionCancelled {
        action_id: long.id(),
        kind: ActionKind::PlayBuffer,
        done_frames: 2 * BLOCK as u64,
    }));
    assert!(events.contains(&PetalMixEvent::ActionCompleted {
        action_id: cancel.id(),
        kind: ActionKind::Cancel,
        done_frames: 0,
    }));

    let late = late.finished().unwrap();
    assert!(late.was_dropped());
    assert_eq!(late.actual_time(), None);
}

#[test]
fn test_queue_full_is_reported_not_blocking() {
    let desc = PetalMixStreamDesc::output(1).sample_rate(RATE).queue_size(4);
    let (mut controller, _scheduler) = PetalMixController::new(&desc).unwrap();

    let mut accepted = 0;
    let error = loop {
        match controller.play_buffer(vec![0.0; 8], 1, Schedule::asap()) {
            Ok(_) => accepted += 1,
            Err(e) => break e,
        }
    };
    assert_eq!(accepted, 4);
    assert!(matches!(error, PetalMixError::QueueFull));
}

#[test]
fn test_audio_thread_drives_actions_to_completion() {
    let (mut controller, device) = output_stream();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            controller
                .play_buffer(vec![0.1; 300 * (i + 1)], 1, Schedule::asap())
                .unwrap()
        })
        .collect();

    let audio = std::thread::spawn(move || {
        let mut device = device;
        for _ in 0..10 {
            device.run_blocks(1);
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    assert!(controller.wait_timeout(None, Duration::from_secs(10), Duration::from_millis(1)));
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.finished().unwrap().done_frames(), 300 * (i as u64 + 1));
    }
    audio.join().unwrap();
}
