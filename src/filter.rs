//! Filter objects. Only their values are ever copied into a source path.

use crate::error::{AlError, Result};

pub const LOWPASS_FREQUENCY_REFERENCE: f32 = 5000.0;
pub const HIGHPASS_FREQUENCY_REFERENCE: f32 = 250.0;

/// Lowest gain a filter stage is allowed to reach.
pub(crate) const MIN_FILTER_GAIN: f32 = 0.00001;

/// Lightweight, type-safe handle for filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(pub(crate) u32);

impl FilterId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FilterId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    #[default]
    Null,
    LowPass,
    HighPass,
    BandPass,
}

/// One property assignment on a filter object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterProperty {
    Kind(FilterKind),
    Gain(f32),
    GainHf(f32),
    GainLf(f32),
}

/// Gains and shelf references applied on a direct or send path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: LOWPASS_FREQUENCY_REFERENCE,
            gain_lf: 1.0,
            lf_reference: HIGHPASS_FREQUENCY_REFERENCE,
        }
    }
}

/// A filter object as stored in the device's filter table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDesc {
    pub kind: FilterKind,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
}

impl Default for FilterDesc {
    fn default() -> Self {
        Self {
            kind: FilterKind::Null,
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

impl FilterDesc {
    pub(crate) fn set(&mut self, property: FilterProperty) -> Result<()> {
        let kind = self.kind_name();
        let check = |name: &str, value: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(value)
            } else {
                Err(AlError::InvalidValue(format!(
                    "{} filter {} out of range: {}",
                    kind, name, value
                )))
            }
        };
        match property {
            FilterProperty::Kind(kind) => {
                *self = Self {
                    kind,
                    ..Self::default()
                };
            }
            FilterProperty::Gain(value) => {
                if self.kind == FilterKind::Null {
                    return Err(self.unsupported("gain"));
                }
                self.gain = check("gain", value)?;
            }
            FilterProperty::GainHf(value) => {
                if !matches!(self.kind, FilterKind::LowPass | FilterKind::BandPass) {
                    return Err(self.unsupported("gain HF"));
                }
                self.gain_hf = check("gain HF", value)?;
            }
            FilterProperty::GainLf(value) => {
                if !matches!(self.kind, FilterKind::HighPass | FilterKind::BandPass) {
                    return Err(self.unsupported("gain LF"));
                }
                self.gain_lf = check("gain LF", value)?;
            }
        }
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            FilterKind::Null => "null",
            FilterKind::LowPass => "low-pass",
            FilterKind::HighPass => "high-pass",
            FilterKind::BandPass => "band-pass",
        }
    }

    fn unsupported(&self, what: &str) -> AlError {
        AlError::InvalidEnum(format!("{} filter has no {} property", self.kind_name(), what))
    }

    /// Values copied onto a source path.
    pub(crate) fn params(&self) -> FilterParams {
        let mut params = FilterParams::default();
        match self.kind {
            FilterKind::Null => {}
            FilterKind::LowPass => {
                params.gain = self.gain;
                params.gain_hf = self.gain_hf;
            }
            FilterKind::HighPass => {
                params.gain = self.gain;
                params.gain_lf = self.gain_lf;
            }
            FilterKind::BandPass => {
                params.gain = self.gain;
                params.gain_hf = self.gain_hf;
                params.gain_lf = self.gain_lf;
            }
        }
        params
    }
}
