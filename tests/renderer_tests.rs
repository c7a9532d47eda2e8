//! Renderer integration tests on the headless backend.
//!
//! Every test drives full frames through `SceneRenderer` and inspects what
//! the backend recorded: uniform contents, draw targets, bound textures and
//! framebuffer sizes.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{
    headless_renderer, render_frame, spawn_mesh, test_config, upload_cube, uploaded_lights,
    write_hdr, HEIGHT, WIDTH,
};
use deferred_renderer::backend::{
    ClearValue, FramebufferHandle, GraphicsBackend, HeadlessBackend, RecordedCommand, TextureFormat,
    MAX_FRAMEBUFFER_SIZE,
};
use deferred_renderer::pipeline::gbuffer_pass::{ENTITY_ID_ATTACHMENT, GBUFFER_SHADER};
use deferred_renderer::pipeline::lighting_pass::DEFERRED_LIGHTING_SHADER;
use deferred_renderer::pipeline::postprocess::FXAA_SHADER;
use deferred_renderer::pipeline::shadow_pass::SHADOW_SHADER;
use deferred_renderer::pipeline::lights::{GpuDirectionalLight, GpuPointLight, GpuSpotLight};
use deferred_renderer::pipeline::{GBufferParams, LightingParams};
use deferred_renderer::resources::{Material, BACKGROUND_SHADER};
use deferred_renderer::scene::{Camera, LightComponent, MeshComponent, Scene, Transform};
use deferred_renderer::{FramePhase, PipelineShader, RendererConfig, SceneRenderer};
use bytemuck::Zeroable;
use glam::{Vec3, Vec4};

fn gbuffer_params(renderer: &SceneRenderer<HeadlessBackend>) -> Vec<GBufferParams> {
    renderer
        .backend()
        .draws_into(renderer.gbuffer())
        .iter()
        .map(|draw| bytemuck::pod_read_unaligned(&draw.params))
        .collect()
}

fn lighting_params(renderer: &SceneRenderer<HeadlessBackend>) -> LightingParams {
    let draws = renderer.backend().draws_into(renderer.lighting_target());
    bytemuck::pod_read_unaligned(&draws[0].params)
}

fn framebuffer_size(renderer: &SceneRenderer<HeadlessBackend>, target: FramebufferHandle) -> (u32, u32) {
    let spec = renderer
        .backend()
        .framebuffer_spec(target)
        .expect("framebuffer exists");
    (spec.width, spec.height)
}

// ============================================================================
// Frame lifecycle
// ============================================================================

#[test]
fn test_frame_runs_every_pass_and_submits_once() {
    let mut renderer = headless_renderer();
    let cube = upload_cube(&mut renderer);
    let mut scene = Scene::new("lifecycle");
    spawn_mesh(&mut scene, "Cube", "cube", cube, Vec3::ZERO, None);
    renderer.set_scene(scene.into_shared());

    render_frame(&mut renderer);

    assert_eq!(renderer.phase(), FramePhase::Idle);
    assert_eq!(renderer.backend().submissions(), 1);
    assert_eq!(renderer.backend().commands().last(), Some(&RecordedCommand::Submit));

    let stats = *renderer.frame_stats();
    assert_eq!(stats.frame, 1);
    assert_eq!(stats.shadow_draws, 1);
    assert_eq!(stats.gbuffer_draws, 1);

    let backend = renderer.backend();
    assert_eq!(backend.draws_into(renderer.shadow_target()).len(), 1);
    assert_eq!(backend.draws_into(renderer.gbuffer()).len(), 1);
    // no environment: the lighting quad only
    assert_eq!(backend.draws_into(renderer.lighting_target()).len(), 1);
    assert_eq!(backend.draws_into(renderer.antialiasing_target()).len(), 1);
}

#[test]
fn test_frame_without_scene_still_submits() {
    let mut renderer = headless_renderer();
    render_frame(&mut renderer);

    assert_eq!(renderer.backend().submissions(), 1);
    assert_eq!(renderer.frame_stats().gbuffer_draws, 0);
}

#[test]
fn test_misordered_calls_are_ignored() {
    let mut renderer = headless_renderer();

    renderer.render_scene();
    renderer.end_scene();
    assert_eq!(renderer.phase(), FramePhase::Idle);
    assert_eq!(renderer.backend().submissions(), 0);

    renderer.begin_scene(&Camera::default());
    renderer.end_scene();
    assert_eq!(renderer.phase(), FramePhase::Begun);

    renderer.render_scene();
    renderer.render_scene();
    assert_eq!(renderer.phase(), FramePhase::Rendered);

    renderer.end_scene();
    assert_eq!(renderer.phase(), FramePhase::Idle);
    assert_eq!(renderer.backend().submissions(), 1);
}

#[test]
fn test_camera_uploaded_at_begin() {
    let mut renderer = headless_renderer();
    let camera = Camera::new(Vec3::new(3.0, 4.0, 5.0), Vec3::ZERO);

    renderer.begin_scene(&camera);

    let uploaded = renderer.backend().uniform_data_at_binding(0).unwrap();
    assert_eq!(uploaded, bytemuck::bytes_of(&camera.uniform_data()));
}

#[test]
fn test_busy_scene_renders_no_entities() {
    let mut renderer = headless_renderer();
    let cube = upload_cube(&mut renderer);
    let mut scene = Scene::new("busy");
    spawn_mesh(&mut scene, "Cube", "cube", cube, Vec3::ZERO, None);
    let scene = scene.into_shared();
    renderer.set_scene(scene.clone());

    renderer.begin_scene(&Camera::default());
    {
        let _editor_borrow = scene.borrow();
        renderer.render_scene();
    }
    renderer.end_scene();

    assert_eq!(renderer.frame_stats().shadow_draws, 0);
    assert_eq!(renderer.frame_stats().gbuffer_draws, 0);
    assert_eq!(renderer.backend().submissions(), 1);

    render_frame(&mut renderer);
    assert_eq!(renderer.frame_stats().gbuffer_draws, 1);
}

// ============================================================================
// Lights
// ============================================================================

#[test]
fn test_point_light_overflow_keeps_first_four() {
    let mut renderer = headless_renderer();
    let mut scene = Scene::new("lights");
    for i in 0..6 {
        let light = scene.create_entity(&format!("Point {i}"));
        scene.insert(light, LightComponent::point(Vec3::ONE, 1.0, 10.0));
        scene.insert(
            light,
            Transform::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
        );
    }
    renderer.set_scene(scene.into_shared());

    render_frame(&mut renderer);

    let stats = renderer.frame_stats().lights;
    assert_eq!(stats.point, 6);
    assert_eq!(stats.dropped_point, 2);
    assert_eq!(stats.total_dropped(), 2);

    let block = uploaded_lights(&renderer);
    for (i, record) in block.point_lights.iter().enumerate() {
        assert_eq!(record.position, Vec4::new(i as f32, 0.0, 0.0, 1.0));
    }
}

#[test]
fn test_lights_do_not_leak_between_frames() {
    let mut renderer = headless_renderer();
    let mut scene = Scene::new("reset");

    let kept = scene.create_entity("Kept");
    scene.insert(kept, LightComponent::point(Vec3::X, 2.0, 5.0));
    let mut removed = Vec::new();
    for i in 0..2 {
        let light = scene.create_entity(&format!("Removed {i}"));
        scene.insert(light, LightComponent::point(Vec3::Y, 1.0, 5.0));
        removed.push(light);
    }
    let spot = scene.create_entity("Spot");
    scene.insert(
        spot,
        LightComponent::spot(Vec3::NEG_Y, Vec3::ONE, 1.0, 10.0, 0.3, 0.5),
    );
    let sun = scene.create_entity("Sun");
    scene.insert(sun, LightComponent::directional(Vec3::NEG_Y, Vec3::ONE, 1.0));
    removed.push(spot);
    removed.push(sun);

    let scene = scene.into_shared();
    renderer.set_scene(scene.clone());
    render_frame(&mut renderer);

    let first = uploaded_lights(&renderer);
    assert_ne!(first.point_lights[2].position, Vec4::ZERO);
    assert_ne!(first.spot_lights[0].position, Vec4::ZERO);
    assert_eq!(first.directional.direction.w, 1.0);

    for entity in removed {
        assert!(scene.borrow_mut().destroy_entity(entity));
    }
    render_frame(&mut renderer);

    let second = uploaded_lights(&renderer);
    assert_eq!(second.point_lights[0].color, Vec4::new(1.0, 0.0, 0.0, 2.0));
    assert_eq!(second.point_lights[1], GpuPointLight::zeroed());
    assert_eq!(second.point_lights[2], GpuPointLight::zeroed());
    assert_eq!(second.spot_lights[0], GpuSpotLight::zeroed());
    assert_eq!(second.directional, GpuDirectionalLight::zeroed());
}

#[test]
fn test_extra_directional_lights_are_counted() {
    let mut renderer = headless_renderer();
    let mut scene = Scene::new("suns");
    let first = scene.create_entity("Sun A");
    scene.insert(first, LightComponent::directional(Vec3::NEG_Y, Vec3::ONE, 1.0));
    let second = scene.create_entity("Sun B");
    scene.insert(
        second,
        LightComponent::directional(Vec3::new(1.0, -1.0, 0.0), Vec3::ONE, 1.0),
    );
    let panel = scene.create_entity("Panel");
    scene.insert(panel, LightComponent::area(Vec3::ONE, 1.0, 2.0, 2.0));
    renderer.set_scene(scene.into_shared());

    render_frame(&mut renderer);

    let stats = renderer.frame_stats().lights;
    assert_eq!(stats.directional, 2);
    assert_eq!(stats.extra_directional, 1);
    assert_eq!(stats.unsupported_area, 1);

    // the last directional light in scan order steers the shadow frustum
    let expected = Vec3::new(1.0, -1.0, 0.0).normalize();
    assert!(renderer.shadow_frustum().direction().abs_diff_eq(expected, 1e-6));
    let block = uploaded_lights(&renderer);
    assert!(block.directional.direction.truncate().abs_diff_eq(expected, 1e-6));
}

// ============================================================================
// Viewport resize
// ============================================================================

#[test]
fn test_resize_rejects_invalid_sizes() {
    let mut renderer = headless_renderer();

    for (w, h) in [(0, HEIGHT), (WIDTH, 0), (MAX_FRAMEBUFFER_SIZE + 1, 600)] {
        assert!(!renderer.on_viewport_resize(w, h));
    }

    assert_eq!(renderer.viewport_size(), (WIDTH, HEIGHT));
    for target in [
        renderer.gbuffer(),
        renderer.lighting_target(),
        renderer.antialiasing_target(),
    ] {
        assert_eq!(framebuffer_size(&renderer, target), (WIDTH, HEIGHT));
    }
}

#[test]
fn test_resize_respects_device_limit() {
    let backend = HeadlessBackend::new().with_max_texture_dimension(1024);
    let mut renderer = SceneRenderer::initialize(backend, test_config()).unwrap();

    assert!(!renderer.on_viewport_resize(2048, 600));
    assert_eq!(renderer.viewport_size(), (WIDTH, HEIGHT));
}

#[test]
fn test_resize_applies_to_every_viewport_target() {
    let mut renderer = headless_renderer();

    assert!(renderer.on_viewport_resize(640, 360));

    assert_eq!(renderer.viewport_size(), (640, 360));
    for target in [
        renderer.gbuffer(),
        renderer.lighting_target(),
        renderer.antialiasing_target(),
    ] {
        assert_eq!(framebuffer_size(&renderer, target), (640, 360));
    }
    // the shadow map keeps its own size
    assert_eq!(framebuffer_size(&renderer, renderer.shadow_target()), (256, 256));
}

#[test]
fn test_resize_ignored_mid_frame() {
    let mut renderer = headless_renderer();
    renderer.begin_scene(&Camera::default());

    assert!(!renderer.on_viewport_resize(640, 360));
    assert_eq!(renderer.viewport_size(), (WIDTH, HEIGHT));
}

// ============================================================================
// Geometry
// ============================================================================

#[test]
fn test_empty_mesh_path_is_not_drawn() {
    let mut renderer = headless_renderer();
    let cube = upload_cube(&mut renderer);
    let mut scene = Scene::new("empty");
    spawn_mesh(&mut scene, "No path", "", cube, Vec3::ZERO, None);
    let loading = scene.create_entity("Loading");
    scene.insert(
        loading,
        MeshComponent {
            path: "model.obj".to_string(),
            mesh: None,
        },
    );
    renderer.set_scene(scene.into_shared());

    render_frame(&mut renderer);

    let backend = renderer.backend();
    assert!(backend.draws_into(renderer.shadow_target()).is_empty());
    assert!(backend.draws_into(renderer.gbuffer()).is_empty());
    assert_eq!(renderer.backend().submissions(), 1);
}

#[test]
fn test_material_and_fallback_both_write_albedo() {
    let mut renderer = headless_renderer();
    let cube = upload_cube(&mut renderer);
    let mut scene = Scene::new("materials");
    let red = Material::plastic(Vec4::new(0.8, 0.1, 0.1, 1.0));
    let with_material = spawn_mesh(&mut scene, "Red", "cube", cube, Vec3::X, Some(red));
    let without = spawn_mesh(&mut scene, "Plain", "cube", cube, Vec3::NEG_X, None);
    renderer.set_scene(scene.into_shared());

    render_frame(&mut renderer);

    let params = gbuffer_params(&renderer);
    assert_eq!(params.len(), 2);
    for p in &params {
        assert!(p.albedo.truncate().length() > 0.0);
    }

    let red_params = params
        .iter()
        .find(|p| p.entity_id == with_material.index() as i32)
        .unwrap();
    assert_eq!(red_params.albedo, Vec4::new(0.8, 0.1, 0.1, 1.0));
    assert_eq!(red_params.has_albedo_map, 0);

    let fallback = params
        .iter()
        .find(|p| p.entity_id == without.index() as i32)
        .unwrap();
    assert_eq!(fallback.albedo, Vec4::ONE);
    assert_eq!(fallback.has_albedo_map, 1);

    let white = renderer.default_textures().white;
    let draws = renderer.backend().draws_into(renderer.gbuffer());
    assert!(draws.iter().all(|d| d.texture_at(0) == Some(white)));
}

#[test]
fn test_entity_id_attachment_cleared_to_minus_one() {
    let mut renderer = headless_renderer();
    render_frame(&mut renderer);

    assert!(renderer.backend().commands().contains(&RecordedCommand::ClearAttachment {
        index: ENTITY_ID_ATTACHMENT,
        value: ClearValue::Int(-1),
    }));
    let texture = renderer.entity_id_texture().unwrap();
    let desc = renderer.backend().texture_descriptor(texture).unwrap();
    assert_eq!(desc.format, TextureFormat::R32Sint);
}

// ============================================================================
// Lighting parameters
// ============================================================================

#[test]
fn test_sample_counts_clamped_to_disk() {
    let mut renderer = headless_renderer();
    renderer.settings_mut().pcf_samples = 500;
    renderer.settings_mut().blocker_samples = -3;
    renderer.settings_mut().soft_shadows = false;

    render_frame(&mut renderer);

    let params = lighting_params(&renderer);
    assert!(params.pcf_samples <= 64 && params.pcf_samples > 0);
    assert_eq!(params.blocker_samples, 0);
    assert_eq!(params.soft_shadows, 0);
    assert_eq!(params.has_environment, 0);
    assert_eq!(params.shadow_map_size, 256.0);
}

// ============================================================================
// Environment and scene switching
// ============================================================================

#[test]
fn test_scene_switch_persists_environment_path() {
    let dir = tempfile::tempdir().unwrap();
    let sky = write_hdr(dir.path(), "sky1.hdr", [0.5, 0.6, 0.9]);

    let mut renderer = headless_renderer();
    let scene_a = Scene::new("A").into_shared();
    let scene_b = Scene::new("B").into_shared();

    renderer.set_scene(scene_a.clone());
    assert!(renderer.environment().is_none());
    assert!(renderer.load_environment(&sky));
    assert_eq!(renderer.environment().map(|e| e.path()), Some(sky.as_str()));

    renderer.set_scene(scene_b.clone());

    assert_eq!(scene_a.borrow().environment_path(), sky);
    assert!(renderer.environment().is_none());
    assert_eq!(scene_b.borrow().environment_path(), "");
}

#[test]
fn test_scene_switch_loads_incoming_environment() {
    let dir = tempfile::tempdir().unwrap();
    let sky = write_hdr(dir.path(), "sky1.hdr", [1.0, 1.0, 1.0]);

    let mut renderer = headless_renderer();
    let baseline = renderer.backend().texture_count();

    let mut a = Scene::new("A");
    a.set_environment_path(sky.clone());
    let a = a.into_shared();
    renderer.set_scene(a.clone());
    assert!(renderer.environment().is_some());
    assert!(renderer.backend().texture_count() > baseline);

    render_frame(&mut renderer);
    let params = lighting_params(&renderer);
    assert_eq!(params.has_environment, 1);
    // lighting quad plus background
    assert_eq!(renderer.backend().draws_into(renderer.lighting_target()).len(), 2);

    renderer.set_scene(Scene::new("B").into_shared());
    assert!(renderer.environment().is_none());
    assert_eq!(renderer.backend().texture_count(), baseline);

    renderer.set_scene(a);
    assert!(renderer.environment().is_some());
}

#[test]
fn test_missing_environment_still_renders() {
    let mut renderer = headless_renderer();
    let mut scene = Scene::new("missing");
    scene.set_environment_path("/definitely/not/here.hdr");
    renderer.set_scene(Rc::new(RefCell::new(scene)));

    assert!(renderer.environment().is_none());
    render_frame(&mut renderer);
    assert_eq!(lighting_params(&renderer).has_environment, 0);
    assert_eq!(renderer.backend().submissions(), 1);
}

// ============================================================================
// Output selection
// ============================================================================

#[test]
fn test_texture_id_follows_antialiasing() {
    let mut renderer = headless_renderer();

    let aa_output = renderer
        .backend()
        .color_attachment(renderer.antialiasing_target(), 0);
    let lit_output = renderer
        .backend()
        .color_attachment(renderer.lighting_target(), 0);
    assert_ne!(aa_output, lit_output);

    assert_eq!(renderer.texture_id(0), aa_output);

    renderer.settings_mut().antialiasing = false;
    assert_eq!(renderer.texture_id(0), lit_output);

    render_frame(&mut renderer);
    assert!(renderer
        .backend()
        .draws_into(renderer.antialiasing_target())
        .is_empty());
}

#[test]
fn test_fxaa_reads_lighting_output() {
    let mut renderer = headless_renderer();
    render_frame(&mut renderer);

    let lit = renderer
        .backend()
        .color_attachment(renderer.lighting_target(), 0);
    let draws = renderer.backend().draws_into(renderer.antialiasing_target());
    assert_eq!(draws[0].texture_at(0), lit);
}

// ============================================================================
// Shader reload
// ============================================================================

#[test]
fn test_reload_keeps_handle() {
    let mut renderer = headless_renderer();
    let handle = renderer.shader_handle(PipelineShader::Fxaa);

    renderer.reload(PipelineShader::Fxaa).unwrap();

    assert_eq!(renderer.shader_handle(PipelineShader::Fxaa), handle);
    assert_eq!(renderer.backend().shader_reload_count(handle), Some(1));
}

#[test]
fn test_failed_reload_keeps_previous_program() {
    let mut renderer = headless_renderer();
    let handle = renderer.shader_handle(PipelineShader::Lighting);
    let source = renderer.backend().shader_source(handle).unwrap().to_string();

    renderer.backend_mut().fail_shader("lighting");
    assert!(renderer.reload(PipelineShader::Lighting).is_err());

    assert_eq!(renderer.shader_handle(PipelineShader::Lighting), handle);
    assert_eq!(renderer.backend().shader_reload_count(handle), Some(0));
    assert_eq!(renderer.backend().shader_source(handle), Some(source.as_str()));

    // still usable for the next frame
    render_frame(&mut renderer);
    assert_eq!(renderer.backend().submissions(), 1);
}

/// Renderer loading every pipeline shader from a temporary directory
fn renderer_with_shader_dir(dir: &std::path::Path) -> SceneRenderer<HeadlessBackend> {
    for (name, source) in [
        ("shadow", SHADOW_SHADER),
        ("gbuffer", GBUFFER_SHADER),
        ("lighting", DEFERRED_LIGHTING_SHADER),
        ("fxaa", FXAA_SHADER),
        ("background", BACKGROUND_SHADER),
    ] {
        std::fs::write(dir.join(format!("{name}.wgsl")), source).unwrap();
    }
    let config = RendererConfig {
        shader_dir: Some(dir.to_path_buf()),
        ..test_config()
    };
    SceneRenderer::initialize(HeadlessBackend::new(), config).unwrap()
}

#[test]
fn test_reload_rereads_shader_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut renderer = renderer_with_shader_dir(dir.path());
    let handle = renderer.shader_handle(PipelineShader::Fxaa);

    let edited = format!("{FXAA_SHADER}\n// edited\n");
    std::fs::write(dir.path().join("fxaa.wgsl"), &edited).unwrap();
    renderer.reload(PipelineShader::Fxaa).unwrap();
    assert_eq!(renderer.backend().shader_source(handle), Some(edited.as_str()));

    std::fs::write(dir.path().join("fxaa.wgsl"), "fn broken(").unwrap();
    assert!(renderer.reload(PipelineShader::Fxaa).is_err());
    assert_eq!(renderer.backend().shader_source(handle), Some(edited.as_str()));
}

#[test]
fn test_background_reload_rereads_shader_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut renderer = renderer_with_shader_dir(dir.path());
    let handle = renderer.shader_handle(PipelineShader::Background);

    let edited = format!("{BACKGROUND_SHADER}\n// darker sky\n");
    std::fs::write(dir.path().join("background.wgsl"), &edited).unwrap();
    renderer.reload(PipelineShader::Background).unwrap();

    assert_eq!(renderer.shader_handle(PipelineShader::Background), handle);
    assert_eq!(renderer.backend().shader_source(handle), Some(edited.as_str()));
}

#[test]
fn test_missing_shader_dir_fails_initialization() {
    let config = RendererConfig {
        shader_dir: Some("/definitely/not/a/shader/dir".into()),
        ..test_config()
    };
    assert!(SceneRenderer::initialize(HeadlessBackend::new(), config).is_err());
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_releases_targets_and_textures() {
    let dir = tempfile::tempdir().unwrap();
    let sky = write_hdr(dir.path(), "sky.hdr", [0.2, 0.2, 0.2]);
    let mut renderer = headless_renderer();
    renderer.load_environment(&sky);
    render_frame(&mut renderer);
    assert_eq!(renderer.backend().framebuffer_count(), 4);

    let backend = renderer.shutdown();
    assert_eq!(backend.framebuffer_count(), 0);
    assert_eq!(backend.texture_count(), 0);
}
