//! Error types for alsonic

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid enum: {0}")]
    InvalidEnum(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AlError {
    /// The compact code latched on a context when this error is raised.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::InvalidEnum(_) | Self::Configuration(_) => ErrorCode::InvalidEnum,
            Self::InvalidValue(_) => ErrorCode::InvalidValue,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Self::InvalidDevice(_) | Self::AudioDevice(_) => ErrorCode::InvalidDevice,
        }
    }
}

/// Last-error codes as reported by `get_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    NoError,
    InvalidName,
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
    InvalidDevice,
}

/// Holds the first error raised since the last read.
#[derive(Debug, Default)]
pub(crate) struct ErrorLatch {
    last: Mutex<ErrorCode>,
}

impl ErrorLatch {
    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            log::debug!("latching error: {}", err);
            let mut last = self.last.lock();
            if *last == ErrorCode::NoError {
                *last = err.code();
            }
        }
        result
    }

    pub(crate) fn take(&self) -> ErrorCode {
        std::mem::take(&mut *self.last.lock())
    }
}

pub type Result<T> = std::result::Result<T, AlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_keeps_first_error() {
        let latch = ErrorLatch::default();
        let _ = latch.record::<()>(Err(AlError::InvalidValue("gain".into())));
        let _ = latch.record::<()>(Err(AlError::InvalidName("7".into())));
        assert_eq!(latch.take(), ErrorCode::InvalidValue);
        assert_eq!(latch.take(), ErrorCode::NoError);
    }

    #[test]
    fn test_ok_does_not_latch() {
        let latch = ErrorLatch::default();
        assert_eq!(latch.record(Ok(3)), Ok(3));
        assert_eq!(latch.take(), ErrorCode::NoError);
    }
}
