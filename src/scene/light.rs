//! Light types for the scene

use bevy_ecs::prelude::*;
use glam::Vec3;

/// Light variant with its kind-specific data.
/// Point and spot positions come from the Transform on the same entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional {
        direction: Vec3,
    },
    Point {
        range: f32,
    },
    Spot {
        direction: Vec3,
        range: f32,
        /// Full-intensity half angle, radians
        inner_cutoff: f32,
        /// Zero-intensity half angle, radians
        outer_cutoff: f32,
    },
    /// Counted but not shaded by the deferred lighting pass
    Area {
        width: f32,
        height: f32,
    },
}

impl LightKind {
    pub fn name(&self) -> &'static str {
        match self {
            LightKind::Directional { .. } => "Directional",
            LightKind::Point { .. } => "Point",
            LightKind::Spot { .. } => "Spot",
            LightKind::Area { .. } => "Area",
        }
    }
}

/// Light component
#[derive(Component, Debug, Clone, PartialEq)]
pub struct LightComponent {
    pub color: Vec3,
    pub intensity: f32,
    pub kind: LightKind,
}

impl Default for LightComponent {
    fn default() -> Self {
        Self::point(Vec3::ONE, 1.0, 10.0)
    }
}

impl LightComponent {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Directional {
                direction: direction.normalize_or_zero(),
            },
        }
    }

    pub fn point(color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Point { range },
        }
    }

    pub fn spot(
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        range: f32,
        inner_cutoff: f32,
        outer_cutoff: f32,
    ) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Spot {
                direction: direction.normalize_or_zero(),
                range,
                inner_cutoff,
                outer_cutoff,
            },
        }
    }

    pub fn area(color: Vec3, intensity: f32, width: f32, height: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Area { width, height },
        }
    }
}
