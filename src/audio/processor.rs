//! # Audio Frame Processing
//!
//! Small PCM helpers shared by the session core and the local engines:
//!
//! - **Frame gating**: frames shorter than the configured minimum carry too
//!   little audio to be worth an engine round-trip and are dropped.
//! - **Keep-alive frames**: zeroed PCM sent to idle transcribers.
//! - **Level and duration**: RMS level and playback length of a frame, used
//!   by the local transcriber to find speech boundaries.
//!
//! All audio is little-endian signed 16-bit PCM.

use crate::engines::AudioFormat;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::Cursor;

/// Per-registry audio policy derived from the session configuration.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    format: AudioFormat,
    min_frame_bytes: usize,
    silence: Bytes,
}

impl AudioProcessor {
    pub fn new(format: AudioFormat, min_frame_bytes: usize, keep_alive_frame_bytes: usize) -> Self {
        Self {
            format,
            min_frame_bytes,
            silence: Bytes::from(vec![0u8; keep_alive_frame_bytes]),
        }
    }

    /// Whether a frame is large enough to forward to the transcriber.
    pub fn admit(&self, frame: &[u8]) -> bool {
        frame.len() >= self.min_frame_bytes
    }

    /// A zeroed frame of the configured keep-alive size. Cloning is cheap.
    pub fn silence_frame(&self) -> Bytes {
        self.silence.clone()
    }

    pub fn duration_ms(&self, frame: &[u8]) -> f64 {
        frame_duration_ms(frame.len(), self.format)
    }
}

/// Playback length of `len` bytes of PCM in `format`.
pub fn frame_duration_ms(len: usize, format: AudioFormat) -> f64 {
    let bytes_per_second = format.bytes_per_second();
    if bytes_per_second == 0 {
        return 0.0;
    }
    len as f64 * 1000.0 / bytes_per_second as f64
}

/// RMS level of a 16-bit PCM frame, normalised to `0.0..=1.0`.
///
/// A trailing odd byte is ignored.
pub fn rms_level(frame: &[u8]) -> f32 {
    let mut cursor = Cursor::new(frame);
    let mut sum_squares = 0f64;
    let mut samples = 0usize;

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        let normalised = sample as f64 / 32768.0;
        sum_squares += normalised * normalised;
        samples += 1;
    }

    if samples == 0 {
        return 0.0;
    }
    (sum_squares / samples as f64).sqrt() as f32
}

/// Render a sine tone as 16-bit PCM.
///
/// `phase` is advanced so consecutive calls produce a continuous waveform.
pub fn sine_pcm(frequency_hz: f32, amplitude: f32, samples: usize, sample_rate: u32, phase: &mut f32) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples * 2);
    let step = std::f32::consts::TAU * frequency_hz / sample_rate as f32;

    for _ in 0..samples {
        let value = (phase.sin() * amplitude * i16::MAX as f32) as i16;
        // Writing into a Vec cannot fail.
        let _ = pcm.write_i16::<LittleEndian>(value);
        *phase = (*phase + step) % std::f32::consts::TAU;
    }
    pcm
}
