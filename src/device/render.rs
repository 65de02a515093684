//! The per-block mix driver and the device post-processing chain.

use super::output::{OutputSample, write_interleaved};
use super::{DeviceParams, DeviceShared, OutputMode};
use crate::config::DeviceDesc;
use crate::dsp::limiter::Limiter;
use crate::dsp::uhj::{UHJ_DELAY, UhjEncoder};
use crate::dsp::{BUFFER_LINE_SIZE, BufferLine, MAX_OUTPUT_CHANNELS, new_bus};
use crate::format::DevFmtType;
use crate::voice::MixScratch;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::Ordering;

const DITHER_SEED: u64 = 22222;

/// Triangular-PDF dither quantising to a fixed number of bits.
struct Dither {
    scale: f32,
    rng: SmallRng,
}

impl Dither {
    fn new(depth: u32) -> Self {
        Self {
            scale: (1u64 << depth.saturating_sub(1).min(31)) as f32,
            rng: SmallRng::seed_from_u64(DITHER_SEED),
        }
    }

    fn apply(&mut self, lines: &mut [BufferLine], count: usize) {
        let inv_scale = 1.0 / self.scale;
        for line in lines {
            for sample in &mut line[..count] {
                let noise = self.rng.random::<f32>() - self.rng.random::<f32>();
                *sample = (*sample * self.scale + noise).round() * inv_scale;
            }
        }
    }
}

/// Mixer-owned buses and post-processors for one device configuration.
pub(crate) struct Renderer {
    pub(crate) params: Arc<DeviceParams>,
    /// Where voices and effect slots mix.
    pub(crate) dry: Vec<BufferLine>,
    /// Encoded output when the dry bus is not in the output layout.
    real: Vec<BufferLine>,
    uhj: Option<UhjEncoder>,
    limiter: Option<Limiter>,
    dither: Option<Dither>,
    gain_boost: f32,
    pub(crate) scratch: MixScratch,
}

impl Renderer {
    pub(crate) fn new(params: Arc<DeviceParams>, desc: &DeviceDesc) -> Self {
        let out_channels = params.channels.count();
        let (uhj, real) = if params.mode == OutputMode::Uhj {
            (Some(UhjEncoder::new()), new_bus(out_channels))
        } else {
            (None, Vec::new())
        };
        let limiter = desc
            .limiter_enabled()
            .then(|| Limiter::new(out_channels, params.sample_rate, limiter_threshold(params.sample_type)));
        Self {
            dry: new_bus(params.dry_panner.channel_count()),
            real,
            uhj,
            limiter,
            dither: desc.effective_dither_depth().map(Dither::new),
            gain_boost: desc.gain_boost(),
            scratch: MixScratch::new(),
            params,
        }
    }

    pub(crate) fn output_channels(&self) -> usize {
        self.params.channels.count()
    }

    /// Look-ahead of the post-processing chain in samples.
    pub(crate) fn fixed_latency(&self) -> usize {
        self.uhj.as_ref().map_or(0, |_| UHJ_DELAY) + self.limiter.as_ref().map_or(0, Limiter::lookahead)
    }

    fn clear(&mut self, count: usize) {
        for line in &mut self.dry {
            line[..count].fill(0.0);
        }
    }

    fn post_process(&mut self, count: usize) {
        if self.gain_boost != 1.0 {
            for line in &mut self.dry {
                for sample in &mut line[..count] {
                    *sample *= self.gain_boost;
                }
            }
        }

        let output = match self.uhj.as_mut() {
            Some(uhj) => {
                let (left, right) = self.real.split_at_mut(1);
                uhj.encode(&self.dry, &mut left[0][..count], &mut right[0][..count], count);
                &mut self.real[..]
            }
            None => &mut self.dry[..],
        };
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.process(output, count);
        }
        if let Some(dither) = self.dither.as_mut() {
            dither.apply(output, count);
        }
    }

    fn write<T: OutputSample>(&self, out: &mut [T], count: usize) {
        let source = if self.uhj.is_some() { &self.real } else { &self.dry };
        let channels = self.output_channels();
        let mut lines: [&[f32]; MAX_OUTPUT_CHANNELS] = [&[]; MAX_OUTPUT_CHANNELS];
        for (line, bus) in lines.iter_mut().zip(source.iter()).take(channels) {
            *line = &bus[..count];
        }
        write_interleaved(&lines[..channels], out, count);
    }
}

fn limiter_threshold(sample_type: DevFmtType) -> f32 {
    match sample_type {
        DevFmtType::F32 => 1.0,
        other => 1.0 - 1.0 / (1u64 << (other.bits() - 1)) as f32,
    }
}

impl DeviceShared {
    /// Renders interleaved frames filling `out`. Called from the backend's
    /// audio thread, or from the caller for loopback devices.
    pub(crate) fn render<T: OutputSample>(&self, out: &mut [T]) {
        let mut guard = self.renderer.lock();
        let renderer = &mut *guard;
        let channels = renderer.output_channels();
        let total = out.len() / channels;

        let mut done = 0;
        while done < total {
            let count = (total - done).min(BUFFER_LINE_SIZE);
            {
                let pass = self.mix_count.begin();
                renderer.clear(count);
                let Renderer {
                    params,
                    dry,
                    scratch,
                    ..
                } = &mut *renderer;
                for context in self.contexts.load(&pass).iter() {
                    context.mix_block(&pass, params, dry, scratch, count);
                }
                renderer.post_process(count);
                renderer.write(&mut out[done * channels..(done + count) * channels], count);
                self.samples_done.fetch_add(count as u64, Ordering::SeqCst);
            }
            done += count;
        }
    }

    /// Marks the device lost. Only the first call has any effect.
    pub(crate) fn handle_disconnect(&self, message: &str) {
        let _renderer = self.renderer.lock();
        let pass = self.mix_count.begin();
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        log::warn!("Device disconnected: {}", message);
        for context in self.contexts.load(&pass).iter() {
            context.disconnect(&pass, message);
        }
    }
}
