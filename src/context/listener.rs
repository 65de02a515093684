//! Listener state and the context-wide values derived from it.

use crate::dsp::SPEED_OF_SOUND_METERS_PER_SEC;
use crate::error::{AlError, Result};
use crate::math::{Mat3, Orientation, Vec3};
use crate::source::DistanceModel;

/// Listener as set through the API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listener {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orientation: Orientation,
    pub gain: f32,
    pub meters_per_unit: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orientation: Orientation::default(),
            gain: 1.0,
            meters_per_unit: 1.0,
        }
    }
}

/// Context-wide playback values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextProps {
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    pub distance_model: DistanceModel,
    /// Let each source pick its own distance model.
    pub source_distance_model: bool,
}

impl Default for ContextProps {
    fn default() -> Self {
        Self {
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            distance_model: DistanceModel::InverseClamped,
            source_distance_model: false,
        }
    }
}

/// Listener and context values in the form the mixer consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ListenerParams {
    /// World to listener rotation.
    pub(crate) matrix: Mat3,
    pub(crate) position: Vec3,
    /// Already in listener space.
    pub(crate) velocity: Vec3,
    pub(crate) gain: f32,
    pub(crate) meters_per_unit: f32,
    pub(crate) doppler_factor: f32,
    /// Speed of sound scaled by the doppler velocity.
    pub(crate) speed_of_sound: f32,
    pub(crate) source_distance_model: bool,
    pub(crate) distance_model: DistanceModel,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self::new(&Listener::default(), &ContextProps::default())
    }
}

impl ListenerParams {
    pub(crate) fn new(listener: &Listener, props: &ContextProps) -> Self {
        let matrix = listener.orientation.basis().unwrap_or(Mat3::IDENTITY);
        Self {
            matrix,
            position: listener.position,
            velocity: matrix * listener.velocity,
            gain: listener.gain,
            meters_per_unit: listener.meters_per_unit,
            doppler_factor: props.doppler_factor,
            speed_of_sound: props.speed_of_sound * props.doppler_velocity,
            source_distance_model: props.source_distance_model,
            distance_model: props.distance_model,
        }
    }
}

fn finite_vec(name: &str, value: Vec3) -> Result<Vec3> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(AlError::InvalidValue(format!("listener {} is not finite", name)))
    }
}

fn positive(name: &str, value: f32) -> Result<f32> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(AlError::InvalidValue(format!("{} out of range: {}", name, value)))
    }
}

impl Listener {
    pub(crate) fn set_position(&mut self, position: Vec3) -> Result<()> {
        self.position = finite_vec("position", position)?;
        Ok(())
    }

    pub(crate) fn set_velocity(&mut self, velocity: Vec3) -> Result<()> {
        self.velocity = finite_vec("velocity", velocity)?;
        Ok(())
    }

    pub(crate) fn set_orientation(&mut self, orientation: Orientation) -> Result<()> {
        finite_vec("orientation", orientation.at)?;
        finite_vec("orientation", orientation.up)?;
        if orientation.basis().is_none() {
            return Err(AlError::InvalidValue(
                "listener orientation vectors are degenerate".into(),
            ));
        }
        self.orientation = orientation;
        Ok(())
    }

    pub(crate) fn set_gain(&mut self, gain: f32) -> Result<()> {
        if !(gain >= 0.0 && gain.is_finite()) {
            return Err(AlError::InvalidValue(format!(
                "listener gain out of range: {}",
                gain
            )));
        }
        self.gain = gain;
        Ok(())
    }

    pub(crate) fn set_meters_per_unit(&mut self, meters: f32) -> Result<()> {
        self.meters_per_unit = positive("meters per unit", meters)?;
        Ok(())
    }
}

impl ContextProps {
    pub(crate) fn set_doppler_factor(&mut self, factor: f32) -> Result<()> {
        if !(factor >= 0.0 && factor.is_finite()) {
            return Err(AlError::InvalidValue(format!(
                "doppler factor out of range: {}",
                factor
            )));
        }
        self.doppler_factor = factor;
        Ok(())
    }

    pub(crate) fn set_doppler_velocity(&mut self, velocity: f32) -> Result<()> {
        self.doppler_velocity = positive("doppler velocity", velocity)?;
        Ok(())
    }

    pub(crate) fn set_speed_of_sound(&mut self, speed: f32) -> Result<()> {
        self.speed_of_sound = positive("speed of sound", speed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_velocity_is_rotated_into_listener_space() {
        let listener = Listener {
            orientation: Orientation::new(Vec3::X, Vec3::Y),
            velocity: Vec3::new(3.0, 0.0, 0.0),
            ..Listener::default()
        };
        let params = ListenerParams::new(&listener, &ContextProps::default());
        assert_abs_diff_eq!(params.velocity.z, -3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_speed_of_sound_scales_with_doppler_velocity() {
        let mut props = ContextProps::default();
        props.set_doppler_velocity(2.0).unwrap();
        let params = ListenerParams::new(&Listener::default(), &props);
        assert_abs_diff_eq!(params.speed_of_sound, SPEED_OF_SOUND_METERS_PER_SEC * 2.0);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut listener = Listener::default();
        assert!(listener.set_gain(-1.0).is_err());
        assert!(listener.set_meters_per_unit(0.0).is_err());
        assert!(listener.set_position(Vec3::new(f32::NAN, 0.0, 0.0)).is_err());
        assert!(
            listener
                .set_orientation(Orientation::new(Vec3::Y, Vec3::Y))
                .is_err()
        );
        let mut props = ContextProps::default();
        assert!(props.set_speed_of_sound(0.0).is_err());
        assert!(props.set_doppler_factor(-0.5).is_err());
    }
}
