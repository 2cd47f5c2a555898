use anyhow::Result;
use petalmix::{PetalMixController, PetalMixEngine, PetalMixStreamDesc, Schedule};
use std::time::Duration;

/// Plays a short tone on a precise beat grid, then prints the stream statistics.
fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let desc = PetalMixStreamDesc::output(2).sample_rate(48000);
    let (mut controller, scheduler) = PetalMixController::new(&desc)?;
    let mut engine = PetalMixEngine::new(desc.clone(), scheduler, controller.event_sender())?;
    engine.start()?;

    let tone = beep(desc.sample_rate, 880.0, Duration::from_millis(60));
    let beat = 0.5;
    let first = controller.time() + 0.3;

    let mut handles = Vec::new();
    for i in 0..8 {
        let channel: usize = if i % 2 == 0 { 1 } else { 2 };
        let start = first + i as f64 * beat;
        handles.push(controller.play_buffer(tone.clone(), [channel], Schedule::at(start))?);
    }
    log::info!("Scheduled {} beeps starting at {:.3}s", handles.len(), first);

    controller.wait(None, Duration::from_millis(20));
    for handle in &handles {
        if let Some(action) = handle.finished() {
            log::info!(
                "{}: requested {:.6}s, started {:?}",
                action.id(),
                action.requested_time().unwrap_or_default(),
                action.actual_time()
            );
        }
    }

    let fetch = controller.fetch_and_reset_stats(Schedule::asap())?;
    controller.wait(Some(&fetch), Duration::from_millis(10));
    if let Some(stats) = fetch.finished().and_then(|action| action.result_stats()) {
        log::info!("Stream statistics: {:?}", stats);
    }

    for event in controller.poll_events() {
        log::debug!("Event: {:?}", event);
    }

    log::info!("Frames processed: {}", engine.frames_processed());
    engine.stop()?;
    log::info!("Statistics since the last fetch: {:?}", engine.stats()?);
    Ok(())
}

fn beep(sample_rate: u32, frequency: f32, duration: Duration) -> Vec<f32> {
    let frames = (duration.as_secs_f32() * sample_rate as f32) as usize;
    (0..frames)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let fade = 1.0 - i as f32 / frames as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.2 * fade
        })
        .collect()
}
