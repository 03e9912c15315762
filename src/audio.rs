//! Realtime playback through the default `cpal` output device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{error, info};

use crate::runtime::processor::Processor;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,
    #[error(transparent)]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error(transparent)]
    Build(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    Play(#[from] cpal::PlayStreamError),
}

/// Sample rate of the default output device, to configure the runtime with.
pub fn default_sample_rate() -> Result<f32, AudioError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoDevice)?;
    Ok(device.default_output_config()?.sample_rate().0 as f32)
}

/// Starts a stream that pulls samples from `processor` and writes each one
/// to every channel. Playback stops when the stream is dropped.
pub fn play(mut processor: Processor) -> Result<cpal::Stream, AudioError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoDevice)?;
    let default_config = device.default_output_config()?;
    let config = cpal::StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(512),
    };
    let channels = config.channels as usize;
    let mut mono = Vec::new();

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            mono.resize(frames, 0.0);
            processor.process_block(&mut mono);
            for (frame, sample) in data.chunks_mut(channels).zip(&mono) {
                frame.fill(*sample);
            }
        },
        |err| error!(%err, "audio stream error"),
        None,
    )?;
    stream.play()?;
    info!(sample_rate = config.sample_rate.0, channels, "audio stream started");
    Ok(stream)
}
