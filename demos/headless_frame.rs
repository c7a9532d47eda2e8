//! Render one frame of a small scene offscreen and save it as a PNG.
//!
//! ```bash
//! cargo run --example headless_frame -- --output frame.png
//! cargo run --example headless_frame -- --environment sky.hdr --no-aa
//! RUST_LOG=debug cargo run --example headless_frame -- --settings settings.ron
//! ```

use clap::Parser;
use deferred_renderer::backend::GraphicsBackend;
use deferred_renderer::resources::{Material, Mesh};
use deferred_renderer::scene::{
    Camera, CameraComponent, LightComponent, MaterialComponent, MeshComponent, Projection, Scene,
    Transform,
};
use deferred_renderer::{RenderSettings, RendererConfig, SceneRenderer, WgpuBackend};
use glam::{Vec3, Vec4};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Render a test scene with the deferred renderer")]
struct Args {
    /// Output PNG path
    #[arg(long, default_value = "frame.png")]
    output: PathBuf,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Equirectangular HDR used for the background and ambient light
    #[arg(long)]
    environment: Option<String>,
    /// RON file with render settings
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Directory with `<name>.wgsl` shader overrides
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Disable FXAA
    #[arg(long)]
    no_aa: bool,
    /// Frames to render before reading back
    #[arg(long, default_value_t = 1)]
    frames: u32,
}

fn build_scene(renderer: &mut SceneRenderer<WgpuBackend>, environment: Option<String>) -> Scene {
    let mut scene = Scene::new("Demo");
    if let Some(path) = environment {
        scene.set_environment_path(path);
    }

    let backend = renderer.backend_mut();
    let cube = Mesh::cube().upload(backend).expect("Failed to upload cube");
    let sphere = Mesh::sphere(32, 16).upload(backend).expect("Failed to upload sphere");
    let plane = Mesh::plane(10.0, 10.0, 1).upload(backend).expect("Failed to upload plane");

    let ground = scene.create_entity("Ground");
    scene.insert(ground, MeshComponent::new("plane", plane));
    scene.insert(ground, Transform::from_translation(Vec3::new(0.0, -0.5, 0.0)));

    let crate_box = scene.create_entity("Cube");
    scene.insert(crate_box, MeshComponent::new("cube", cube));
    scene.insert(
        crate_box,
        MaterialComponent::new(Material::plastic(Vec4::new(0.8, 0.2, 0.2, 1.0))),
    );
    scene.insert(
        crate_box,
        Transform::from_translation(Vec3::new(-1.0, 0.0, 0.0)).with_rotation(Vec3::new(0.0, 0.6, 0.0)),
    );

    let ball = scene.create_entity("Sphere");
    scene.insert(ball, MeshComponent::new("sphere", sphere));
    scene.insert(ball, MaterialComponent::new(Material::gold()));
    scene.insert(ball, Transform::from_translation(Vec3::new(1.2, 0.0, 0.0)));

    let sun = scene.create_entity("Sun");
    scene.insert(
        sun,
        LightComponent::directional(Vec3::new(-0.4, -1.0, -0.3), Vec3::ONE, 2.0),
    );

    let lamp = scene.create_entity("Lamp");
    scene.insert(lamp, LightComponent::point(Vec3::new(0.2, 0.4, 1.0), 4.0, 8.0));
    scene.insert(lamp, Transform::from_translation(Vec3::new(0.0, 1.5, 2.0)));

    let camera = scene.create_entity("Camera");
    scene.insert(
        camera,
        CameraComponent::new(
            Camera::new(Vec3::new(0.0, 2.5, 6.0), Vec3::ZERO)
                .with_projection(Projection::perspective(45.0, 16.0 / 9.0, 0.1, 100.0)),
        ),
    );

    scene
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("Failed to read settings");
            RenderSettings::from_ron_str(&text).expect("Failed to parse settings")
        }
        None => RenderSettings::default(),
    };
    if args.no_aa {
        settings.antialiasing = false;
    }

    let backend = WgpuBackend::new_headless().expect("No GPU adapter available");
    log::info!("Using {}", backend.name());

    let config = RendererConfig {
        width: args.width,
        height: args.height,
        shader_dir: args.shader_dir.clone(),
        settings,
        ..Default::default()
    };
    let mut renderer = SceneRenderer::initialize(backend, config).expect("Failed to initialize renderer");

    let scene = build_scene(&mut renderer, args.environment.clone()).into_shared();
    renderer.set_scene(scene.clone());

    for _ in 0..args.frames.max(1) {
        let camera = scene.borrow_mut().primary_camera().unwrap_or_default();
        renderer.begin_scene(&camera);
        renderer.render_scene();
        renderer.end_scene();
    }
    log::info!("{:?}", renderer.frame_stats());

    let output = renderer.texture_id(0).expect("Renderer has no output texture");
    let (width, height) = renderer.viewport_size();
    let pixels = renderer
        .backend_mut()
        .read_texture_rgba8(output)
        .expect("Failed to read back the frame");

    image::save_buffer(&args.output, &pixels, width, height, image::ColorType::Rgba8)
        .expect("Failed to write PNG");
    log::info!("Wrote {}", args.output.display());
}
