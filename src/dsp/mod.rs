//! Signal-processing building blocks used by the mixer.

pub mod biquad;
pub mod hrtf;
pub mod limiter;
pub mod mix;
pub mod nfc;
pub mod panning;
pub mod resampler;
pub mod uhj;

/// Frames processed per mixing pass; larger blocks are split.
pub const BUFFER_LINE_SIZE: usize = 1024;

/// One channel of a mixing bus.
pub type BufferLine = [f32; BUFFER_LINE_SIZE];

/// Upper bound on dry-bus channels (third-order ambisonics).
pub const MAX_OUTPUT_CHANNELS: usize = 16;

pub const MIXER_FRAC_BITS: u32 = 16;
pub const MIXER_FRAC_ONE: u32 = 1 << MIXER_FRAC_BITS;
pub const MIXER_FRAC_MASK: u32 = MIXER_FRAC_ONE - 1;

/// Largest pitch multiple a voice can step through its samples.
pub const MAX_PITCH: u32 = 10;

/// Samples of history a resampler needs around its input.
pub const MAX_RESAMPLER_PADDING: usize = 24;
pub const MAX_RESAMPLER_EDGE: usize = MAX_RESAMPLER_PADDING / 2;

/// +60dB
pub const GAIN_MIX_MAX: f32 = 1000.0;
/// -100dB
pub const GAIN_SILENCE_THRESHOLD: f32 = 0.00001;

pub const SPEED_OF_SOUND_METERS_PER_SEC: f32 = 343.3;
pub const AIR_ABSORB_GAIN_HF: f32 = 0.99426;

/// Allocates a zeroed bus of `channels` lines.
pub(crate) fn new_bus(channels: usize) -> Vec<BufferLine> {
    vec![[0.0; BUFFER_LINE_SIZE]; channels]
}
