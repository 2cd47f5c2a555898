use anyhow::Result;
use petalmix::{PetalMixController, PetalMixEngine, PetalMixStreamDesc, RingBuffer, Schedule};
use std::time::Duration;

/// Records the default input and plays it back on the output after a fixed
/// delay, using one ring buffer between a record and a play action.
fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let delay = 0.5;
    let desc = PetalMixStreamDesc::duplex(1, 1).sample_rate(48000).block_size(256);
    let (mut controller, scheduler) = PetalMixController::new(&desc)?;
    let mut engine = PetalMixEngine::new(desc.clone(), scheduler, controller.event_sender())?;
    engine.start()?;

    let frames = ((delay * 2.0) * desc.sample_rate as f64) as usize;
    let (producer, consumer) = RingBuffer::for_frames(1, frames.next_power_of_two())?.split();

    let start = controller.time() + 0.1;
    let recording = controller.record_ring_buffer(producer, None, Schedule::at(start))?;
    let playing = controller.play_ring_buffer(consumer, None, Schedule::at(start + delay))?;
    log::info!("Delaying input by {:.2}s for 10 seconds", delay);

    std::thread::sleep(Duration::from_secs(10));

    controller.cancel(&recording, Schedule::asap())?;
    controller.cancel(&playing, Schedule::asap())?;
    controller.wait(None, Duration::from_millis(10));

    for handle in [&recording, &playing] {
        if let Some(action) = handle.finished() {
            log::info!(
                "{} ({:?}): {} frames, {} xruns",
                action.id(),
                action.kind(),
                action.done_frames(),
                action.stats().xruns()
            );
        }
    }

    engine.stop()?;
    Ok(())
}
