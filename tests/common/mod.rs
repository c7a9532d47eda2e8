//! Shared fixtures for the renderer integration tests.

#![allow(dead_code)]

use std::path::Path;

use deferred_renderer::backend::{GraphicsBackend, HeadlessBackend, MeshHandle};
use deferred_renderer::pipeline::LightUniformBlock;
use deferred_renderer::pipeline::lights::LIGHTS_BINDING;
use deferred_renderer::resources::{Material, Mesh};
use deferred_renderer::scene::{MaterialComponent, MeshComponent, Scene, Transform};
use deferred_renderer::{RendererConfig, SceneRenderer};
use glam::Vec3;
use image::Rgb;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 180;

// ============================================================================
// Renderer
// ============================================================================

/// Small viewport and shadow map so the fixtures stay cheap
pub fn test_config() -> RendererConfig {
    RendererConfig {
        width: WIDTH,
        height: HEIGHT,
        shadow_map_size: 256,
        poisson_seed: 42,
        ..Default::default()
    }
}

pub fn headless_renderer() -> SceneRenderer<HeadlessBackend> {
    SceneRenderer::initialize(HeadlessBackend::new(), test_config())
        .expect("headless renderer should initialize")
}

/// Run `begin_scene`, `render_scene` and `end_scene` with the default camera
pub fn render_frame<B: GraphicsBackend>(renderer: &mut SceneRenderer<B>) {
    renderer.begin_scene(&Default::default());
    renderer.render_scene();
    renderer.end_scene();
}

/// Light block as last uploaded to the uniform buffer
pub fn uploaded_lights(renderer: &SceneRenderer<HeadlessBackend>) -> LightUniformBlock {
    let bytes = renderer
        .backend()
        .uniform_data_at_binding(LIGHTS_BINDING)
        .expect("light buffer exists");
    bytemuck::pod_read_unaligned(bytes)
}

// ============================================================================
// Scene
// ============================================================================

pub fn upload_cube<B: GraphicsBackend>(renderer: &mut SceneRenderer<B>) -> MeshHandle {
    Mesh::cube()
        .upload(renderer.backend_mut())
        .expect("cube uploads")
}

/// Spawn a mesh entity at `position`, with `material` when given
pub fn spawn_mesh(
    scene: &mut Scene,
    name: &str,
    path: &str,
    mesh: MeshHandle,
    position: Vec3,
    material: Option<Material>,
) -> bevy_ecs::entity::Entity {
    let entity = scene.create_entity(name);
    scene.insert(
        entity,
        MeshComponent {
            path: path.to_string(),
            mesh: Some(mesh),
        },
    );
    scene.insert(entity, Transform::from_translation(position));
    if let Some(material) = material {
        scene.insert(entity, MaterialComponent::new(material));
    }
    entity
}

// ============================================================================
// Files
// ============================================================================

/// Write a uniform-color equirectangular HDR file and return its path
pub fn write_hdr(dir: &Path, name: &str, color: [f32; 3]) -> String {
    let (width, height) = (16usize, 8usize);
    let pixels = vec![Rgb(color); width * height];
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create hdr file");
    image::codecs::hdr::HdrEncoder::new(std::io::BufWriter::new(file))
        .encode(&pixels, width, height)
        .expect("encode hdr");
    path.to_string_lossy().into_owned()
}
