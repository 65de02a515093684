//! Look-ahead peak limiter for the final output bus.

use super::BufferLine;

/// Look-ahead is one millisecond, rounded up to whole samples.
const LOOKAHEAD_PER_SECOND: usize = 1000;
const RELEASE_SECONDS: f32 = 0.2;

/// Delays the signal by a fixed look-ahead so gain reduction is in place
/// before a peak reaches the output.
#[derive(Debug, Clone)]
pub struct Limiter {
    threshold: f32,
    lookahead: usize,
    release: f32,
    /// Per-channel delay lines of `lookahead` samples.
    delay: Vec<Vec<f32>>,
    delay_pos: usize,
    /// Peaks of the last `lookahead + 1` input frames.
    peaks: Vec<f32>,
    peak_pos: usize,
    hold: f32,
    gain: f32,
}

impl Limiter {
    pub fn new(channels: usize, sample_rate: u32, threshold: f32) -> Self {
        let lookahead = (sample_rate as usize).div_ceil(LOOKAHEAD_PER_SECOND).max(1);
        Self {
            threshold,
            lookahead,
            release: (-1.0 / (RELEASE_SECONDS * sample_rate as f32)).exp(),
            delay: vec![vec![0.0; lookahead]; channels],
            delay_pos: 0,
            peaks: vec![0.0; lookahead + 1],
            peak_pos: 0,
            hold: 0.0,
            gain: 1.0,
        }
    }

    /// Added output latency in samples.
    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    pub fn current_gain(&self) -> f32 {
        self.gain
    }

    /// Limits the first `count` samples of each line in place.
    ///
    /// The window covers every frame still in the delay line, so the gain
    /// applied to a frame never lets it exceed the threshold.
    pub fn process(&mut self, bus: &mut [BufferLine], count: usize) {
        let channels = bus.len().min(self.delay.len());
        let window = self.peaks.len();
        for i in 0..count {
            let peak = bus[..channels]
                .iter()
                .fold(0.0f32, |acc, line| acc.max(line[i].abs()));
            self.peaks[self.peak_pos] = peak;
            self.peak_pos = (self.peak_pos + 1) % window;

            let window_peak = self.peaks.iter().copied().fold(0.0f32, f32::max);
            self.hold = window_peak.max(self.hold * self.release);
            self.gain = if self.hold > self.threshold {
                self.threshold / self.hold
            } else {
                1.0
            };

            for (line, delay) in bus[..channels].iter_mut().zip(self.delay.iter_mut()) {
                let delayed = std::mem::replace(&mut delay[self.delay_pos], line[i]);
                line[i] = delayed * self.gain;
            }
            self.delay_pos = (self.delay_pos + 1) % self.lookahead;
        }
    }
}
