//! Math types for alsonic

pub use glam::{Mat3, Vec3};

/// A forward/up vector pair, as used by the listener and directional sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub at: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(at: Vec3, up: Vec3) -> Self {
        Self { at, up }
    }

    /// Rotation taking world space into this orientation's local frame.
    ///
    /// The local frame is right-handed with -Z forward and +Y up. Returns
    /// `None` when the vectors are degenerate or parallel.
    pub fn basis(&self) -> Option<Mat3> {
        let n = self.at.try_normalize()?;
        let v = self.up.try_normalize()?;
        let u = n.cross(v).try_normalize()?;
        let v = u.cross(n);
        Some(Mat3::from_cols(u, v, -n).transpose())
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            at: Vec3::NEG_Z,
            up: Vec3::Y,
        }
    }
}
