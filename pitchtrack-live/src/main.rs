//! # pitchtrack-live
//!
//! Listens to the default microphone and prints the pitch samples the
//! detection session reconstructs from each captured block.
//!
//! ## Architecture
//! - **Audio callback thread**: CPAL stream, cuts input into fixed-size blocks
//! - **Estimator thread**: YIN analysis of submitted segments
//! - **Main thread**: owns the detection session, drains and prints samples
//! - **Communication**: Crossbeam channels between all three

mod audio;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::StreamTrait;
use pitchtrack_core::{
    AudioBuffer, DetectionSession, DetectorConfig, PitchSample, ThreadedEstimator, YinAnalyzer,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pitchtrack-live", about = "Print live pitch samples from the default microphone")]
struct Args {
    /// JSON detector configuration; defaults are used when the file is missing.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to listen, in seconds.
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Minimum RMS amplitude a segment needs before pitch analysis.
    #[arg(long, default_value_t = 0.01)]
    amplitude_threshold: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DetectorConfig::load_or_default(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DetectorConfig::default(),
    };

    let estimator = ThreadedEstimator::spawn(YinAnalyzer::new(args.amplitude_threshold))?;
    let mut session = DetectionSession::new(config, estimator)?;

    let (block_tx, block_rx) = crossbeam_channel::bounded::<audio::CapturedBlock>(8);
    let (stream, sample_rate) =
        audio::start_audio_capture(block_tx).context("starting audio capture")?;
    tracing::info!(seconds = args.seconds, "listening");

    let deadline = crossbeam_channel::after(Duration::from_secs(args.seconds));
    loop {
        crossbeam_channel::select! {
            recv(block_rx) -> msg => match msg {
                Ok(block) => {
                    let buffer = AudioBuffer::new(&block.samples, sample_rate);
                    // Timestamps count back from the end of the block
                    let end_ms = block.start_ms + buffer.duration_ms();
                    if let Err(e) = session.detect(&buffer, block.start_ms, end_ms) {
                        tracing::warn!("detection failed: {}", e);
                    }
                    while let Some(sample) = session.pop_next() {
                        print_sample(&sample);
                    }
                }
                Err(_) => {
                    tracing::warn!("audio channel closed");
                    break;
                }
            },
            recv(deadline) -> _ => break,
        }
    }

    if let Err(e) = stream.pause() {
        tracing::warn!("error pausing stream: {}", e);
    }
    drop(stream);

    // Collect whatever the estimator finished for the last block
    session.wait_for_call(Duration::from_millis(200));
    while let Some(sample) = session.pop_next() {
        print_sample(&sample);
    }
    if session.dropped() > 0 {
        tracing::info!(dropped = session.dropped(), "samples dropped by the result queue");
    }
    tracing::info!("done");
    Ok(())
}

fn print_sample(sample: &PitchSample) {
    println!(
        "{:>10.1} ms  {:<4} {:>8.2} Hz  {:>+6.1} cents  {:>5.1} dB",
        sample.timestamp_ms,
        sample.pitch.note,
        sample.pitch.frequency,
        sample.pitch.cents,
        sample.loudness_db
    );
}
