//! # Audio Capture Module
//!
//! Real-time capture from the default input device using CPAL. Incoming
//! samples are downmixed to mono, cut into fixed-size blocks and sent to the
//! detection loop together with their position on the capture clock.

use anyhow::{Result, anyhow};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

/// Frames per block handed to the detection session (~93 ms at 44.1 kHz).
pub const BUFFER_SIZE: usize = 4096;

const TARGET_SAMPLE_RATE: u32 = 44100;

/// One fixed-size mono block.
#[derive(Debug, Clone)]
pub struct CapturedBlock {
    pub samples: Vec<f32>,
    /// Capture-clock time of the first frame, in milliseconds since the stream started.
    pub start_ms: f64,
}

/// Starts audio capture from the default input device.
///
/// # Returns
/// * `Ok((stream, sample_rate))` - Stream handle (keep it alive) and sample rate
/// * `Err(e)` - No device, no usable f32 format, or the stream failed to start
pub fn start_audio_capture(sender: Sender<CapturedBlock>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;

    let device_name = device.name()?;
    tracing::info!(device = %device_name, "using audio input device");

    let configs = device.supported_input_configs()?.collect::<Vec<_>>();
    let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
        .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

    let min_rate = supported_config.min_sample_rate().0;
    let max_rate = supported_config.max_sample_rate().0;
    let sample_rate = cpal::SampleRate(TARGET_SAMPLE_RATE.clamp(min_rate, max_rate));
    let config = supported_config.with_sample_rate(sample_rate);

    let sample_rate_val = config.sample_rate().0;
    let channels = config.channels() as usize;
    let config: cpal::StreamConfig = config.into();

    tracing::info!(sample_rate = sample_rate_val, channels, "selected input format");

    let err_fn = |err| tracing::error!("an error occurred on the audio stream: {}", err);

    let mut audio_buffer: Vec<f32> = Vec::with_capacity(BUFFER_SIZE * 2);
    let mut frames_sent: u64 = 0;

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            audio_buffer.extend(
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );

            while audio_buffer.len() >= BUFFER_SIZE {
                let block = CapturedBlock {
                    samples: audio_buffer[..BUFFER_SIZE].to_vec(),
                    start_ms: frames_sent as f64 / sample_rate_val as f64 * 1000.0,
                };
                frames_sent += BUFFER_SIZE as u64;

                // Drop the block if the detection loop is behind
                if sender.try_send(block).is_err() {
                    tracing::debug!("detection loop is behind, dropping block");
                }

                audio_buffer.drain(..BUFFER_SIZE);
            }
        },
        err_fn,
        None,
    )?;

    stream.play()?;

    Ok((stream, sample_rate_val))
}

/// Picks the f32 input configuration whose rate range is closest to `target_rate`,
/// preferring mono.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
            let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
            let in_range =
                c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0;
            (!in_range, c.channels() != 1, min_diff.min(max_diff))
        })
}
