//! Offline rendering of a [`Processor`] to memory or to a WAV file.

use std::path::Path;

use tracing::info;

use crate::runtime::processor::Processor;

const BLOCK: usize = 256;

/// Runs `processor` for `frames` samples.
pub fn render(processor: &mut Processor, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames];
    for block in out.chunks_mut(BLOCK) {
        processor.process_block(block);
    }
    out
}

/// Renders `duration_secs` of audio into a stereo 32 bit float WAV file,
/// the same sample on both channels.
pub fn render_to_wav(
    processor: &mut Processor,
    sample_rate: f32,
    duration_secs: f32,
    path: impl AsRef<Path>,
) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: sample_rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let path = path.as_ref();
    let mut writer = hound::WavWriter::create(path, spec)?;
    let frames = (duration_secs * sample_rate) as usize;

    let mut block = [0.0; BLOCK];
    let mut remaining = frames;
    while remaining > 0 {
        let len = remaining.min(BLOCK);
        processor.process_block(&mut block[..len]);
        for sample in &block[..len] {
            writer.write_sample(*sample)?;
            writer.write_sample(*sample)?;
        }
        remaining -= len;
    }
    writer.finalize()?;
    info!(path = %path.display(), frames, "rendered wav");
    Ok(())
}
