//! Deferred Renderer - multi-pass scene renderer for a 3D editor viewport
//!
//! Two backends implement [`backend::GraphicsBackend`]:
//! - **wgpu**: offscreen rendering on any adapter wgpu supports
//! - **headless**: records commands without a GPU, for tests and CI
//!
//! # Features
//! - Directional-light shadow map with PCF or PCSS filtering
//! - G-buffer with an integer entity-id attachment for picking
//! - Deferred GGX lighting for point, spot and directional lights
//! - Image-based lighting and background from an equirectangular HDR map
//! - Optional FXAA
//! - Typed shader parameter blocks validated against the WGSL at load time
//! - Entity Component System (ECS) based scenes using Bevy ECS

pub mod backend;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use backend::{GraphicsBackend, HeadlessBackend, WgpuBackend};
pub use pipeline::RenderSettings;
pub use renderer::{FramePhase, FrameStats, PipelineShader, RendererError, SceneRenderer};
pub use scene::{Scene, SharedScene};

use std::path::PathBuf;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Initial viewport width
    pub width: u32,
    /// Initial viewport height
    pub height: u32,
    /// Edge of the square shadow map
    pub shadow_map_size: u32,
    /// Directory holding `<name>.wgsl` overrides. Without it the embedded
    /// sources are used and reloads recompile them.
    pub shader_dir: Option<PathBuf>,
    /// Seed for the Poisson sample disks
    pub poisson_seed: u64,
    /// Initial tunables
    pub settings: RenderSettings,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            shadow_map_size: pipeline::shadow_pass::DEFAULT_SHADOW_MAP_SIZE,
            shader_dir: None,
            poisson_seed: 0x5eed,
            settings: RenderSettings::default(),
        }
    }
}
