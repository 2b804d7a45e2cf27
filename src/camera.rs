//! Semantic camera value.
//!
//! The iteration controller compares cameras field-wise by value to
//! decide whether accumulated samples are still valid. Comparison is
//! exact: any floating-point drift counts as a move and triggers a
//! restart. Smoothing or dead-zones belong to the camera-input
//! collaborator, not here.

use glam::Vec3;

/// Camera pose and projection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// View direction, assumed normalized.
    pub direction: Vec3,
    /// Up vector, assumed normalized.
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub vfov_degrees: f32,
}

impl Camera {
    pub fn new(position: Vec3, direction: Vec3, up: Vec3, vfov_degrees: f32) -> Self {
        Self {
            position,
            direction,
            up,
            vfov_degrees,
        }
    }

    /// Ray-generation basis vectors (u, v, w) for the given aspect
    /// ratio: `w` is the unit view direction, `u` spans half the image
    /// width and `v` half the image height in world units at unit
    /// distance.
    pub fn basis(&self, aspect_ratio: f32) -> (Vec3, Vec3, Vec3) {
        let w = self.direction;
        let tan_half = (0.5 * self.vfov_degrees.to_radians()).tan();
        let u = w.cross(self.up).normalize() * tan_half * aspect_ratio;
        let v = u.cross(w).normalize() * tan_half;
        (u, v, w)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            vfov_degrees: 70.0,
        }
    }
}
