//! Transform component

use bevy_ecs::prelude::*;
use glam::{EulerRot, Mat4, Quat, Vec3};

/// Translation, Euler rotation (radians) and scale.
/// The rotation applies X first, then Y, then Z (`Rz * Ry * Rx`).
/// The model matrix is derived on demand.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn rotation_quat(&self) -> Quat {
        Quat::from_euler(EulerRot::ZYX, self.rotation.z, self.rotation.y, self.rotation.x)
    }

    /// Model matrix: translate * rotate * scale
    pub fn transform(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation_quat(), self.translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        assert_eq!(Transform::default().transform(), Mat4::IDENTITY);
    }

    #[test]
    fn test_scale_then_translate() {
        let t = Transform::from_translation(Vec3::new(1.0, 2.0, 3.0)).with_scale(Vec3::splat(2.0));
        let p = t.transform().transform_point3(Vec3::X);
        assert!((p - Vec3::new(3.0, 2.0, 3.0)).length() < 1e-5);
    }

    #[test]
    fn test_rotation_applied_before_translation() {
        let t = Transform::from_translation(Vec3::new(0.0, 0.0, 5.0))
            .with_rotation(Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0));
        let p = t.transform().transform_point3(Vec3::X);
        // +X rotated a quarter turn about +Y lands on -Z
        assert!((p - Vec3::new(0.0, 0.0, 4.0)).length() < 1e-5);
    }

    #[test]
    fn test_rotation_order_is_x_then_y_then_z() {
        use std::f32::consts::FRAC_PI_2;
        let t = Transform::new().with_rotation(Vec3::new(FRAC_PI_2, FRAC_PI_2, 0.0));
        let p = t.transform().transform_vector3(Vec3::Z);
        // X takes +Z to -Y, and Y leaves -Y alone
        assert!((p - Vec3::NEG_Y).length() < 1e-5, "got {p}");
    }

    #[test]
    fn test_rotation_matches_composed_axes() {
        let rotation = Vec3::new(0.3, -1.1, 2.0);
        let t = Transform::new().with_rotation(rotation);
        let expected = Mat4::from_rotation_z(rotation.z)
            * Mat4::from_rotation_y(rotation.y)
            * Mat4::from_rotation_x(rotation.x);
        assert!(t.transform().abs_diff_eq(expected, 1e-5));
    }
}
