//! Per-frame light collection
//!
//! Lights are packed into a fixed-size uniform block at binding 1. The block
//! has room for [`MAX_POINT_LIGHTS`] point lights, [`MAX_SPOT_LIGHTS`] spot
//! lights and one directional light; anything beyond that is dropped and
//! counted in [`LightStats`]. Every record is 64 bytes and unused records are
//! all zero, which the shader treats as "off" (`w == 0` in the first vector).

use super::shadow_pass::ShadowFrustum;
use crate::backend::*;
use crate::scene::{LightComponent, LightKind, Scene};
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

pub const MAX_POINT_LIGHTS: usize = 4;
pub const MAX_SPOT_LIGHTS: usize = 4;

/// Binding point of the light block
pub const LIGHTS_BINDING: u32 = 1;

/// Point light record (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuPointLight {
    /// xyz = world position, w = 1 when the slot is in use
    pub position: Vec4,
    /// rgb = color, w = intensity
    pub color: Vec4,
    /// x = range
    pub params: Vec4,
    pub _pad: Vec4,
}

/// Spot light record (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuSpotLight {
    /// xyz = world position, w = 1 when the slot is in use
    pub position: Vec4,
    /// xyz = normalized direction
    pub direction: Vec4,
    /// rgb = color, w = intensity
    pub color: Vec4,
    /// x = range, y = cos(inner cutoff), z = cos(outer cutoff)
    pub params: Vec4,
}

/// Directional light record (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    /// xyz = normalized direction the light travels, w = 1 when present
    pub direction: Vec4,
    /// rgb = color, w = intensity
    pub color: Vec4,
    /// Transform translation of the light entity
    pub position: Vec4,
    pub _pad: Vec4,
}

/// The whole light uniform block (576 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniformBlock {
    pub point_lights: [GpuPointLight; MAX_POINT_LIGHTS],
    pub spot_lights: [GpuSpotLight; MAX_SPOT_LIGHTS],
    pub directional: GpuDirectionalLight,
}

impl LightUniformBlock {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// What the last aggregation saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightStats {
    pub point: usize,
    pub spot: usize,
    pub directional: usize,
    pub dropped_point: usize,
    pub dropped_spot: usize,
    /// Directional lights overwritten by a later one in scan order
    pub extra_directional: usize,
    /// Area lights, which the lighting pass does not shade
    pub unsupported_area: usize,
}

impl LightStats {
    pub fn total_dropped(&self) -> usize {
        self.dropped_point + self.dropped_spot + self.extra_directional + self.unsupported_area
    }
}

/// CPU copy of the light block plus the buffer it is flushed to
pub struct LightAggregator {
    block: LightUniformBlock,
    buffer: UniformBufferHandle,
    stats: LightStats,
}

impl LightAggregator {
    pub fn new<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Self> {
        let buffer =
            backend.create_uniform_buffer("lights", LightUniformBlock::SIZE, LIGHTS_BINDING)?;
        Ok(Self {
            block: LightUniformBlock::zeroed(),
            buffer,
            stats: LightStats::default(),
        })
    }

    /// Zero every record and the counters
    pub fn reset(&mut self) {
        self.block = LightUniformBlock::zeroed();
        self.stats = LightStats::default();
    }

    /// Overwrite the single directional record
    pub fn add_directional(&mut self, light: &LightComponent, direction: Vec3, world_position: Vec3) {
        self.block.directional = GpuDirectionalLight {
            direction: direction.normalize_or_zero().extend(1.0),
            color: light.color.extend(light.intensity),
            position: world_position.extend(0.0),
            _pad: Vec4::ZERO,
        };
    }

    /// Fill point record `slot`; out-of-range slots are ignored
    pub fn add_point(&mut self, light: &LightComponent, world_position: Vec3, range: f32, slot: usize) {
        let Some(record) = self.block.point_lights.get_mut(slot) else {
            return;
        };
        *record = GpuPointLight {
            position: world_position.extend(1.0),
            color: light.color.extend(light.intensity),
            params: Vec4::new(range, 0.0, 0.0, 0.0),
            _pad: Vec4::ZERO,
        };
    }

    /// Fill spot record `slot`; cutoffs are half angles in radians
    #[allow(clippy::too_many_arguments)]
    pub fn add_spot(
        &mut self,
        light: &LightComponent,
        world_position: Vec3,
        direction: Vec3,
        range: f32,
        inner_cutoff: f32,
        outer_cutoff: f32,
        slot: usize,
    ) {
        let Some(record) = self.block.spot_lights.get_mut(slot) else {
            return;
        };
        *record = GpuSpotLight {
            position: world_position.extend(1.0),
            direction: direction.normalize_or_zero().extend(0.0),
            color: light.color.extend(light.intensity),
            params: Vec4::new(range, inner_cutoff.cos(), outer_cutoff.cos(), 0.0),
        };
    }

    /// Scan the scene once and fill the block in scan order. A directional
    /// light also steers the shadow frustum.
    pub fn aggregate(&mut self, scene: &mut Scene, frustum: &mut ShadowFrustum) -> LightStats {
        let mut stats = LightStats::default();

        scene.for_each_light(|_, transform, light| {
            let position = transform.translation;
            match light.kind {
                LightKind::Directional { direction } => {
                    if stats.directional > 0 {
                        stats.extra_directional += 1;
                    }
                    stats.directional += 1;
                    self.add_directional(light, direction, position);
                    frustum.set_direction(direction);
                }
                LightKind::Point { range } => {
                    if stats.point >= MAX_POINT_LIGHTS {
                        stats.dropped_point += 1;
                    }
                    self.add_point(light, position, range, stats.point);
                    stats.point += 1;
                }
                LightKind::Spot {
                    direction,
                    range,
                    inner_cutoff,
                    outer_cutoff,
                } => {
                    if stats.spot >= MAX_SPOT_LIGHTS {
                        stats.dropped_spot += 1;
                    }
                    self.add_spot(
                        light,
                        position,
                        direction,
                        range,
                        inner_cutoff,
                        outer_cutoff,
                        stats.spot,
                    );
                    stats.spot += 1;
                }
                LightKind::Area { .. } => stats.unsupported_area += 1,
            }
        });

        if stats.total_dropped() > 0 {
            log::debug!(
                "Lights over capacity: {} point, {} spot, {} directional, {} area dropped",
                stats.dropped_point,
                stats.dropped_spot,
                stats.extra_directional,
                stats.unsupported_area
            );
        }

        self.stats = stats;
        stats
    }

    /// Upload the whole block
    pub fn flush<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.write_uniform_buffer(self.buffer, bytemuck::bytes_of(&self.block));
    }

    pub fn block(&self) -> &LightUniformBlock {
        &self.block
    }

    pub fn stats(&self) -> LightStats {
        self.stats
    }
}
