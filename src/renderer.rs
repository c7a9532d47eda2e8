//! Scene renderer
//!
//! [`SceneRenderer`] owns the backend and every pass, and drives one frame as
//! `begin_scene` → `render_scene` → `end_scene`:
//!
//! 1. Shadow pass (depth from the directional light)
//! 2. G-buffer pass (position, normal, albedo, material, entity id)
//! 3. Deferred lighting with PCF/PCSS shadows and the environment background
//! 4. FXAA when enabled
//!
//! The scene is shared with the editor and only borrowed for the duration of
//! `render_scene`.

use crate::backend::*;
use crate::pipeline::gbuffer_pass::{CAMERA_BINDING, ENTITY_ID_ATTACHMENT};
use crate::pipeline::lighting_pass::LightingInputs;
use crate::pipeline::poisson::{POISSON_MIN_DISTANCE, POISSON_SAMPLE_COUNT};
use crate::pipeline::shadow_pass::{ShadowUniformData, SHADOW_BINDING};
use crate::pipeline::*;
use crate::resources::*;
use crate::scene::{Camera, CameraUniformData, SharedScene};
use crate::shader::{Shader, ShaderError, ShaderParameters};
use crate::RendererConfig;
use glam::Vec3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use thiserror::Error;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to create {resource}: {source}")]
    Initialization {
        resource: &'static str,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("Invalid renderer configuration: {0}")]
    InvalidConfig(String),
}

/// The fixed shaders owned by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineShader {
    Shadow,
    GBuffer,
    Lighting,
    Fxaa,
    Background,
}

/// Where the renderer is within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePhase {
    #[default]
    Idle,
    Begun,
    Rendered,
}

/// Counters for the last completed frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub shadow_draws: usize,
    pub gbuffer_draws: usize,
    pub lights: LightStats,
}

/// Multi-pass deferred renderer for one viewport
pub struct SceneRenderer<B: GraphicsBackend> {
    backend: B,
    settings: RenderSettings,
    shader_dir: Option<PathBuf>,
    viewport: (u32, u32),

    scene: Option<SharedScene>,
    environment: Option<Environment>,

    camera_buffer: UniformBufferHandle,
    shadow_buffer: UniformBufferHandle,
    lights: LightAggregator,
    shadow_frustum: ShadowFrustum,

    shadow_pass: ShadowPass,
    gbuffer_pass: GBufferPass,
    lighting_pass: LightingPass,
    fxaa_pass: FxaaPass,
    background_shader: Shader<BackgroundParams>,

    quad: MeshHandle,
    blocker_disk: PoissonDisk,
    pcf_disk: PoissonDisk,
    blocker_texture: TextureHandle,
    pcf_texture: TextureHandle,
    defaults: DefaultTextures,
    fallback_material: Material,

    phase: FramePhase,
    stats: FrameStats,
}

fn check_size(what: &str, width: u32, height: u32, max: u32) -> Result<(), RendererError> {
    let limit = max.min(MAX_FRAMEBUFFER_SIZE);
    if width == 0 || height == 0 || width > limit || height > limit {
        return Err(RendererError::InvalidConfig(format!(
            "{what} {width}x{height} must be within 1..={limit}"
        )));
    }
    Ok(())
}

impl<B: GraphicsBackend> SceneRenderer<B> {
    /// Allocate every target, compile the shader set and build the static
    /// resources. Nothing is drawn until a scene is set.
    pub fn initialize(mut backend: B, config: RendererConfig) -> Result<Self, RendererError> {
        log::info!(
            "Initializing scene renderer on {} ({}x{}, shadow map {})",
            backend.name(),
            config.width,
            config.height,
            config.shadow_map_size
        );

        let max = backend.max_texture_dimension();
        check_size("viewport", config.width, config.height, max)?;
        check_size("shadow map", config.shadow_map_size, config.shadow_map_size, max)?;

        let settings = config.settings;
        let shader_dir = config.shader_dir;
        let dir = shader_dir.as_deref();

        let camera_buffer = backend
            .create_uniform_buffer(
                "camera",
                std::mem::size_of::<CameraUniformData>() as u64,
                CAMERA_BINDING,
            )
            .map_err(|source| RendererError::Initialization {
                resource: "camera uniform buffer",
                source,
            })?;
        let shadow_buffer = backend
            .create_uniform_buffer(
                "shadow",
                std::mem::size_of::<ShadowUniformData>() as u64,
                SHADOW_BINDING,
            )
            .map_err(|source| RendererError::Initialization {
                resource: "shadow uniform buffer",
                source,
            })?;
        let lights =
            LightAggregator::new(&mut backend).map_err(|source| RendererError::Initialization {
                resource: "light uniform buffer",
                source,
            })?;

        let shadow_pass = ShadowPass::new(&mut backend, config.shadow_map_size, dir)?;
        let gbuffer_pass = GBufferPass::new(&mut backend, config.width, config.height, dir)?;
        let lighting_pass = LightingPass::new(
            &mut backend,
            config.width,
            config.height,
            settings.clear_color,
            dir,
        )?;
        let fxaa_pass = FxaaPass::new(&mut backend, config.width, config.height, dir)?;
        let background_shader = Shader::load(&mut backend, background_shader_descriptor(dir))?;

        let quad = Mesh::screen_quad()
            .upload(&mut backend)
            .map_err(|source| RendererError::Initialization {
                resource: "screen quad",
                source,
            })?;

        let mut rng = StdRng::seed_from_u64(config.poisson_seed);
        let blocker_disk = PoissonDisk::generate(&mut rng, POISSON_SAMPLE_COUNT, POISSON_MIN_DISTANCE);
        let pcf_disk = PoissonDisk::generate(&mut rng, POISSON_SAMPLE_COUNT, POISSON_MIN_DISTANCE);
        let blocker_texture = blocker_disk
            .upload(&mut backend, "blocker_disk")
            .map_err(|source| RendererError::Initialization {
                resource: "blocker search disk",
                source,
            })?;
        let pcf_texture = pcf_disk
            .upload(&mut backend, "pcf_disk")
            .map_err(|source| RendererError::Initialization {
                resource: "PCF disk",
                source,
            })?;

        let defaults =
            DefaultTextures::create(&mut backend).map_err(|source| RendererError::Initialization {
                resource: "default textures",
                source,
            })?;
        let fallback_material = Material::fallback(defaults.white);

        let shadow_frustum = ShadowFrustum::new(
            settings.shadow_ortho_size,
            settings.shadow_near,
            settings.shadow_far,
            Vec3::NEG_Y,
        );

        log::info!("Scene renderer ready");

        Ok(Self {
            backend,
            settings,
            shader_dir,
            viewport: (config.width, config.height),
            scene: None,
            environment: None,
            camera_buffer,
            shadow_buffer,
            lights,
            shadow_frustum,
            shadow_pass,
            gbuffer_pass,
            lighting_pass,
            fxaa_pass,
            background_shader,
            quad,
            blocker_disk,
            pcf_disk,
            blocker_texture,
            pcf_texture,
            defaults,
            fallback_material,
            phase: FramePhase::Idle,
            stats: FrameStats::default(),
        })
    }

    /// Make `scene` the active scene. The active environment's path is
    /// written back to the outgoing scene before the environment is released;
    /// the incoming scene's environment, if any, is loaded.
    pub fn set_scene(&mut self, scene: SharedScene) {
        if let (Some(environment), Some(outgoing)) = (&self.environment, &self.scene) {
            match outgoing.try_borrow_mut() {
                Ok(mut outgoing) => outgoing.set_environment_path(environment.path()),
                Err(_) => log::error!(
                    "Outgoing scene is borrowed; environment {} not persisted",
                    environment.path()
                ),
            }
        }
        if let Some(environment) = self.environment.take() {
            environment.release(&mut self.backend);
        }

        let (name, path) = match scene.try_borrow_mut() {
            Ok(mut incoming) => {
                incoming.on_viewport_resize(self.viewport.0, self.viewport.1);
                (
                    incoming.name().to_string(),
                    incoming.environment_path().to_string(),
                )
            }
            Err(_) => {
                log::error!("Incoming scene is borrowed; its environment is not loaded");
                (String::new(), String::new())
            }
        };

        if !path.is_empty() {
            self.load_environment(&path);
        }
        log::info!("Active scene: {name}");
        self.scene = Some(scene);
    }

    /// Replace the active environment with the HDR file at `path`. A failed
    /// load is logged and leaves no environment.
    pub fn load_environment(&mut self, path: &str) -> bool {
        if let Some(environment) = self.environment.take() {
            environment.release(&mut self.backend);
        }
        match Environment::load(&mut self.backend, path, &self.background_shader) {
            Ok(mut environment) => {
                environment.set_intensity(self.settings.env_intensity);
                self.environment = Some(environment);
                true
            }
            Err(e) => {
                log::warn!("Failed to load environment {path}: {e}");
                false
            }
        }
    }

    /// Drop the active environment without touching any scene
    pub fn clear_environment(&mut self) {
        if let Some(environment) = self.environment.take() {
            environment.release(&mut self.backend);
        }
    }

    /// Start a frame seen from `camera`
    pub fn begin_scene(&mut self, camera: &Camera) {
        if self.phase != FramePhase::Idle {
            log::warn!("begin_scene called in phase {:?}; ignored", self.phase);
            return;
        }

        self.backend
            .write_uniform_buffer(self.camera_buffer, bytemuck::bytes_of(&camera.uniform_data()));
        self.lights.reset();
        if let Some(environment) = &mut self.environment {
            environment.set_view_projection(camera.view_matrix(), camera.projection_matrix());
            environment.set_intensity(self.settings.env_intensity);
        }

        self.stats = FrameStats {
            frame: self.stats.frame + 1,
            ..FrameStats::default()
        };
        self.phase = FramePhase::Begun;
    }

    /// Gather lights, then run the shadow and geometry passes
    pub fn render_scene(&mut self) {
        if self.phase != FramePhase::Begun {
            log::warn!("render_scene called in phase {:?}; ignored", self.phase);
            return;
        }

        let shared = self.scene.clone();
        let mut scene = match &shared {
            Some(shared) => match shared.try_borrow_mut() {
                Ok(scene) => Some(scene),
                Err(_) => {
                    log::error!("Scene is borrowed elsewhere; rendering without entities");
                    None
                }
            },
            None => None,
        };

        if let Some(scene) = scene.as_deref_mut() {
            self.stats.lights = self.lights.aggregate(scene, &mut self.shadow_frustum);
        }
        self.lights.flush(&mut self.backend);

        self.shadow_frustum.set_bounds(
            self.settings.shadow_ortho_size,
            self.settings.shadow_near,
            self.settings.shadow_far,
        );
        self.backend.write_uniform_buffer(
            self.shadow_buffer,
            bytemuck::bytes_of(&self.shadow_frustum.uniform_data()),
        );

        self.stats.shadow_draws = self.shadow_pass.execute(&mut self.backend, scene.as_deref_mut());
        self.stats.gbuffer_draws = self.gbuffer_pass.execute(
            &mut self.backend,
            scene.as_deref_mut(),
            &self.defaults,
            &self.fallback_material,
        );

        self.phase = FramePhase::Rendered;
    }

    /// Shade, anti-alias and submit the frame
    pub fn end_scene(&mut self) {
        if self.phase != FramePhase::Rendered {
            log::warn!("end_scene called in phase {:?}; ignored", self.phase);
            return;
        }

        let shadow_map = match self.shadow_pass.depth_texture(&self.backend) {
            Some(texture) => texture,
            None => {
                log::error!("Shadow map has no depth attachment");
                self.defaults.white
            }
        };

        let params = self.lighting_params();
        let inputs = LightingInputs {
            gbuffer: self.gbuffer_pass.framebuffer(),
            shadow_map,
            blocker_disk: self.blocker_texture,
            pcf_disk: self.pcf_texture,
            environment: self.environment.as_ref(),
            defaults: &self.defaults,
            quad: self.quad,
        };
        self.lighting_pass
            .execute(&mut self.backend, &inputs, &params, self.settings.clear_color);

        if self.settings.antialiasing {
            match self
                .backend
                .color_attachment(self.lighting_pass.framebuffer(), 0)
            {
                Some(lit) => self.fxaa_pass.execute(&mut self.backend, lit, self.quad),
                None => log::error!("Lighting target has no color attachment; FXAA skipped"),
            }
        }

        self.backend.submit();

        log::debug!(
            "Frame {}: {} shadow draws, {} geometry draws, {} lights dropped",
            self.stats.frame,
            self.stats.shadow_draws,
            self.stats.gbuffer_draws,
            self.stats.lights.total_dropped()
        );
        self.phase = FramePhase::Idle;
    }

    fn lighting_params(&self) -> LightingParams {
        let s = &self.settings;
        LightingParams {
            exposure: s.exposure,
            gamma: s.gamma,
            shadow_near: self.shadow_frustum.near(),
            // world units to shadow-map UV
            light_size: s.light_size / (2.0 * self.shadow_frustum.ortho_size()).max(f32::EPSILON),
            intensity: s.intensity,
            env_intensity: s.env_intensity,
            pcf_samples: self.pcf_disk.clamp_count(s.pcf_samples),
            blocker_samples: self.blocker_disk.clamp_count(s.blocker_samples),
            soft_shadows: s.soft_shadows as i32,
            has_environment: self.environment.is_some() as i32,
            shadow_map_size: self.shadow_pass.size() as f32,
            shadow_far: self.shadow_frustum.far(),
        }
    }

    /// Resize the viewport targets together. Returns whether the new size was
    /// applied; on any failure the previous size is kept.
    pub fn on_viewport_resize(&mut self, width: u32, height: u32) -> bool {
        if self.phase != FramePhase::Idle {
            log::warn!("Viewport resize during phase {:?}; ignored", self.phase);
            return false;
        }
        let limit = self.backend.max_texture_dimension().min(MAX_FRAMEBUFFER_SIZE);
        if width == 0 || height == 0 || width > limit || height > limit {
            log::warn!("Rejected viewport resize to {width}x{height} (limit {limit})");
            return false;
        }
        if (width, height) == self.viewport {
            return true;
        }

        let targets = [
            self.gbuffer_pass.framebuffer(),
            self.lighting_pass.framebuffer(),
            self.fxaa_pass.framebuffer(),
        ];
        let (old_width, old_height) = self.viewport;
        for (resized, target) in targets.iter().enumerate() {
            if let Err(e) = self.backend.resize_framebuffer(*target, width, height) {
                log::error!("Viewport resize to {width}x{height} failed: {e}");
                for target in &targets[..resized] {
                    if let Err(e) = self.backend.resize_framebuffer(*target, old_width, old_height) {
                        log::error!("Failed to restore {old_width}x{old_height}: {e}");
                    }
                }
                return false;
            }
        }

        self.viewport = (width, height);
        if let Some(scene) = &self.scene {
            match scene.try_borrow_mut() {
                Ok(mut scene) => scene.on_viewport_resize(width, height),
                Err(_) => log::warn!("Scene is borrowed; camera aspect not updated"),
            }
        }
        log::info!("Viewport resized to {width}x{height}");
        true
    }

    /// Recompile one of the pipeline shaders in place
    pub fn reload(&mut self, which: PipelineShader) -> Result<(), ShaderError> {
        let result = match which {
            PipelineShader::Shadow => self.shadow_pass.shader().reload(&mut self.backend),
            PipelineShader::GBuffer => self.gbuffer_pass.shader().reload(&mut self.backend),
            PipelineShader::Lighting => self.lighting_pass.shader().reload(&mut self.backend),
            PipelineShader::Fxaa => self.fxaa_pass.shader().reload(&mut self.backend),
            PipelineShader::Background => self.background_shader.reload(&mut self.backend),
        };
        if let Err(e) = &result {
            log::error!("Reloading {which:?} failed, keeping the previous program: {e}");
        }
        result
    }

    /// Recompile a material shader in place
    pub fn reload_shader<P: ShaderParameters>(&mut self, shader: &Shader<P>) -> Result<(), ShaderError> {
        let result = shader.reload(&mut self.backend);
        if let Err(e) = &result {
            log::error!(
                "Reloading {} failed, keeping the previous program: {e}",
                shader.label()
            );
        }
        result
    }

    /// Final image attachment `index`: the FXAA target when anti-aliasing is
    /// on, otherwise the lighting target
    pub fn texture_id(&self, index: usize) -> Option<TextureHandle> {
        let framebuffer = if self.settings.antialiasing {
            self.fxaa_pass.framebuffer()
        } else {
            self.lighting_pass.framebuffer()
        };
        self.backend.color_attachment(framebuffer, index)
    }

    /// `R32Sint` attachment holding the entity index per pixel, -1 for none
    pub fn entity_id_texture(&self) -> Option<TextureHandle> {
        self.backend
            .color_attachment(self.gbuffer_pass.framebuffer(), ENTITY_ID_ATTACHMENT)
    }

    pub fn gbuffer(&self) -> FramebufferHandle {
        self.gbuffer_pass.framebuffer()
    }

    pub fn lighting_target(&self) -> FramebufferHandle {
        self.lighting_pass.framebuffer()
    }

    pub fn antialiasing_target(&self) -> FramebufferHandle {
        self.fxaa_pass.framebuffer()
    }

    pub fn shadow_target(&self) -> FramebufferHandle {
        self.shadow_pass.framebuffer()
    }

    /// Handle of a pipeline shader, stable across reloads
    pub fn shader_handle(&self, which: PipelineShader) -> ShaderHandle {
        match which {
            PipelineShader::Shadow => self.shadow_pass.shader().handle(),
            PipelineShader::GBuffer => self.gbuffer_pass.shader().handle(),
            PipelineShader::Lighting => self.lighting_pass.shader().handle(),
            PipelineShader::Fxaa => self.fxaa_pass.shader().handle(),
            PipelineShader::Background => self.background_shader.handle(),
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut RenderSettings {
        &mut self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn scene(&self) -> Option<&SharedScene> {
        self.scene.as_ref()
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn default_textures(&self) -> &DefaultTextures {
        &self.defaults
    }

    pub fn lights(&self) -> &LightAggregator {
        &self.lights
    }

    pub fn shadow_frustum(&self) -> &ShadowFrustum {
        &self.shadow_frustum
    }

    pub fn shader_dir(&self) -> Option<&std::path::Path> {
        self.shader_dir.as_deref()
    }

    pub fn frame_stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn viewport_size(&self) -> (u32, u32) {
        self.viewport
    }

    /// Release the render targets, textures, meshes and environment the
    /// renderer created, then hand the backend back. Shader programs and
    /// uniform buffers live until the backend itself is dropped.
    pub fn shutdown(mut self) -> B {
        if let Some(environment) = self.environment.take() {
            environment.release(&mut self.backend);
        }
        for target in [
            self.shadow_pass.framebuffer(),
            self.gbuffer_pass.framebuffer(),
            self.lighting_pass.framebuffer(),
            self.fxaa_pass.framebuffer(),
        ] {
            self.backend.destroy_framebuffer(target);
        }
        self.defaults.release(&mut self.backend);
        self.backend.destroy_texture(self.blocker_texture);
        self.backend.destroy_texture(self.pcf_texture);
        self.backend.destroy_mesh(self.quad);
        log::info!("Scene renderer shut down after {} frames", self.stats.frame);
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> SceneRenderer<HeadlessBackend> {
        let config = RendererConfig {
            width: 320,
            height: 180,
            shadow_map_size: 512,
            ..Default::default()
        };
        SceneRenderer::initialize(HeadlessBackend::new(), config).unwrap()
    }

    #[test]
    fn test_initialize_allocates_bindings() {
        let renderer = renderer();
        let backend = renderer.backend();
        assert!(backend.uniform_data_at_binding(CAMERA_BINDING).is_some());
        assert!(backend
            .uniform_data_at_binding(crate::pipeline::lights::LIGHTS_BINDING)
            .is_some());
        assert!(backend.uniform_data_at_binding(SHADOW_BINDING).is_some());
        assert_eq!(renderer.phase(), FramePhase::Idle);
        assert_eq!(renderer.settings(), &RenderSettings::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RendererConfig {
            width: 0,
            ..Default::default()
        };
        let result = SceneRenderer::initialize(HeadlessBackend::new(), config);
        assert!(matches!(result, Err(RendererError::InvalidConfig(_))));
    }

    #[test]
    fn test_shader_failure_is_an_error() {
        let mut backend = HeadlessBackend::new();
        backend.fail_shader("lighting");
        let result = SceneRenderer::initialize(backend, RendererConfig::default());
        assert!(matches!(result, Err(RendererError::Shader(_))));
    }

    #[test]
    fn test_out_of_order_calls_are_ignored() {
        let mut renderer = renderer();
        renderer.end_scene();
        renderer.render_scene();
        assert_eq!(renderer.phase(), FramePhase::Idle);
        assert_eq!(renderer.backend().submissions(), 0);

        renderer.begin_scene(&Camera::default());
        renderer.begin_scene(&Camera::default());
        assert_eq!(renderer.phase(), FramePhase::Begun);
        assert_eq!(renderer.frame_stats().frame, 1);
    }

    #[test]
    fn test_light_size_in_shadow_uv() {
        let mut renderer = renderer();
        renderer.settings_mut().light_size = 4.0;
        let params = renderer.lighting_params();
        assert_eq!(params.light_size, 4.0 / 40.0);
        assert_eq!(params.has_environment, 0);
        assert_eq!(params.shadow_map_size, 512.0);
    }
}
