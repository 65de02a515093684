//! First-order near-field filter.
//!
//! Combines a bass boost for the source distance (`w0`) with a bass cut for
//! the speaker distance (`w1`). Both are `speed_of_sound / (distance * rate)`.

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NfcFilter {
    base_gain: f32,
    gain: f32,
    b1: f32,
    a1: f32,
    z: f32,
}

impl NfcFilter {
    pub fn new(w0: f32, w1: f32) -> Self {
        let r = 0.5 * w1;
        let g = 1.0 + r;
        let base_gain = 1.0 / g;
        let a1 = 2.0 * r / g;

        let mut filter = Self {
            base_gain,
            gain: base_gain,
            b1: 0.0,
            a1,
            z: 0.0,
        };
        filter.adjust(w0);
        filter
    }

    /// Retunes the boost for a new source distance, keeping state.
    pub fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let g = 1.0 + r;
        self.gain = self.base_gain * g;
        self.b1 = 2.0 * r / g;
    }

    pub fn clear(&mut self) {
        self.z = 0.0;
    }

    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        let (gain, b1, a1) = (self.gain, self.b1, self.a1);
        let mut z = self.z;
        for sample in samples.iter_mut() {
            let y = *sample * gain - a1 * z;
            let out = y + b1 * z;
            z += y;
            *sample = out;
        }
        self.z = z;
    }
}
