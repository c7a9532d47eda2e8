//! G-Buffer generation pass for deferred rendering
//!
//! Renders geometry to multiple render targets:
//! - 0: world position (w = 1 where geometry exists)
//! - 1: world normal
//! - 2: albedo
//! - 3: roughness, metallic, AO
//! - 4: entity ID for picking (-1 where empty)
//! - depth

use super::shader_path;
use crate::backend::*;
use crate::renderer::RendererError;
use crate::resources::{DefaultTextures, Material};
use crate::scene::{CameraUniformData, Scene};
use crate::shader::{ParamField, ParamType, Shader, ShaderParameters};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::mem::offset_of;
use std::path::Path;

/// Binding point of the camera block
pub const CAMERA_BINDING: u32 = 0;

/// Attachment index of the entity ID target
pub const ENTITY_ID_ATTACHMENT: usize = 4;

pub const GBUFFER_FORMATS: [TextureFormat; 6] = [
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
    TextureFormat::Rgba8Unorm,
    TextureFormat::R32Sint,
    TextureFormat::Depth32Float,
];

/// Per-draw material and transform parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GBufferParams {
    pub model: Mat4,
    pub albedo: Vec4,
    pub roughness: f32,
    pub metallic: f32,
    pub ao: f32,
    pub entity_id: i32,
    pub has_albedo_map: i32,
    pub has_normal_map: i32,
    pub has_metallic_map: i32,
    pub has_roughness_map: i32,
    pub has_ao_map: i32,
    pub _pad0: i32,
    pub _pad1: i32,
    pub _pad2: i32,
}

impl ShaderParameters for GBufferParams {
    const FIELDS: &'static [ParamField] = &[
        ParamField::new("model", ParamType::Mat4, offset_of!(GBufferParams, model)),
        ParamField::new("albedo", ParamType::Vec4, offset_of!(GBufferParams, albedo)),
        ParamField::new("roughness", ParamType::Float, offset_of!(GBufferParams, roughness)),
        ParamField::new("metallic", ParamType::Float, offset_of!(GBufferParams, metallic)),
        ParamField::new("ao", ParamType::Float, offset_of!(GBufferParams, ao)),
        ParamField::new("entity_id", ParamType::Int, offset_of!(GBufferParams, entity_id)),
        ParamField::new("has_albedo_map", ParamType::Int, offset_of!(GBufferParams, has_albedo_map)),
        ParamField::new("has_normal_map", ParamType::Int, offset_of!(GBufferParams, has_normal_map)),
        ParamField::new(
            "has_metallic_map",
            ParamType::Int,
            offset_of!(GBufferParams, has_metallic_map),
        ),
        ParamField::new(
            "has_roughness_map",
            ParamType::Int,
            offset_of!(GBufferParams, has_roughness_map),
        ),
        ParamField::new("has_ao_map", ParamType::Int, offset_of!(GBufferParams, has_ao_map)),
        ParamField::new("_pad0", ParamType::Int, offset_of!(GBufferParams, _pad0)),
        ParamField::new("_pad1", ParamType::Int, offset_of!(GBufferParams, _pad1)),
        ParamField::new("_pad2", ParamType::Int, offset_of!(GBufferParams, _pad2)),
    ];
}

const MAP_NAMES: [&str; 5] = ["albedo_map", "normal_map", "metallic_map", "roughness_map", "ao_map"];

pub const GBUFFER_SHADER: &str = r#"
struct CameraUniforms {
    view_projection: mat4x4<f32>,
    position: vec4<f32>,
}

struct GBufferParams {
    model: mat4x4<f32>,
    albedo: vec4<f32>,
    roughness: f32,
    metallic: f32,
    ao: f32,
    entity_id: i32,
    has_albedo_map: i32,
    has_normal_map: i32,
    has_metallic_map: i32,
    has_roughness_map: i32,
    has_ao_map: i32,
    _pad0: i32,
    _pad1: i32,
    _pad2: i32,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(1) @binding(0) var<uniform> params: GBufferParams;

@group(2) @binding(0) var albedo_map: texture_2d<f32>;
@group(2) @binding(1) var normal_map: texture_2d<f32>;
@group(2) @binding(2) var metallic_map: texture_2d<f32>;
@group(2) @binding(3) var roughness_map: texture_2d<f32>;
@group(2) @binding(4) var ao_map: texture_2d<f32>;
@group(2) @binding(15) var linear_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) world_tangent: vec4<f32>,
}

struct GBufferOutput {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) albedo: vec4<f32>,
    @location(3) material: vec4<f32>,
    @location(4) entity_id: i32,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world = params.model * vec4<f32>(in.position, 1.0);
    out.clip_position = camera.view_projection * world;
    out.world_position = world.xyz;
    out.world_normal = (params.model * vec4<f32>(in.normal, 0.0)).xyz;
    out.uv = in.uv;
    out.world_tangent = vec4<f32>((params.model * vec4<f32>(in.tangent.xyz, 0.0)).xyz, in.tangent.w);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> GBufferOutput {
    // sample unconditionally to stay in uniform control flow
    let albedo_sample = textureSample(albedo_map, linear_sampler, in.uv);
    let normal_sample = textureSample(normal_map, linear_sampler, in.uv);
    let metallic_sample = textureSample(metallic_map, linear_sampler, in.uv);
    let roughness_sample = textureSample(roughness_map, linear_sampler, in.uv);
    let ao_sample = textureSample(ao_map, linear_sampler, in.uv);

    var n = normalize(in.world_normal);
    if params.has_normal_map != 0 {
        let t = normalize(in.world_tangent.xyz - n * dot(n, in.world_tangent.xyz));
        let b = cross(n, t) * in.world_tangent.w;
        let tangent_normal = normal_sample.xyz * 2.0 - 1.0;
        n = normalize(mat3x3<f32>(t, b, n) * tangent_normal);
    }

    let albedo = params.albedo * select(vec4<f32>(1.0), albedo_sample, params.has_albedo_map != 0);
    let metallic = params.metallic * select(1.0, metallic_sample.r, params.has_metallic_map != 0);
    let roughness = params.roughness * select(1.0, roughness_sample.r, params.has_roughness_map != 0);
    let ao = params.ao * select(1.0, ao_sample.r, params.has_ao_map != 0);

    var out: GBufferOutput;
    out.position = vec4<f32>(in.world_position, 1.0);
    out.normal = vec4<f32>(n, 0.0);
    out.albedo = vec4<f32>(albedo.rgb, 1.0);
    out.material = vec4<f32>(roughness, metallic, ao, 1.0);
    out.entity_id = params.entity_id;
    return out;
}
"#;

/// Descriptor for the shared G-buffer shader; material variants reuse it
/// with their own label and source
pub fn gbuffer_shader_descriptor(shader_dir: Option<&Path>) -> ShaderDescriptor {
    let mut desc = ShaderDescriptor::new("gbuffer", GBUFFER_SHADER)
        .with_path(shader_path(shader_dir, "gbuffer"))
        .with_uniform_buffer(CAMERA_BINDING, std::mem::size_of::<CameraUniformData>() as u64);
    for (unit, name) in MAP_NAMES.into_iter().enumerate() {
        desc = desc.with_texture(TextureSlot::new(unit as u32, name, TextureKind::Float));
    }
    desc
}

/// Geometry pass writing the G-buffer
pub struct GBufferPass {
    framebuffer: FramebufferHandle,
    shader: Shader<GBufferParams>,
}

impl GBufferPass {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        width: u32,
        height: u32,
        shader_dir: Option<&Path>,
    ) -> Result<Self, RendererError> {
        let spec = GBUFFER_FORMATS
            .iter()
            .fold(FramebufferSpec::new("gbuffer", width, height), |spec, format| {
                spec.with_attachment(*format)
            })
            .with_clear_color([0.0, 0.0, 0.0, 0.0]);
        let framebuffer = backend
            .create_framebuffer(&spec)
            .map_err(|source| RendererError::Initialization {
                resource: "gbuffer framebuffer",
                source,
            })?;
        let shader = Shader::load(backend, gbuffer_shader_descriptor(shader_dir))?;

        Ok(Self { framebuffer, shader })
    }

    /// Draw every renderable entity; returns the number of draws
    pub fn execute<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        scene: Option<&mut Scene>,
        defaults: &DefaultTextures,
        fallback: &Material,
    ) -> usize {
        backend.bind_framebuffer(self.framebuffer);
        backend.set_depth_test(true);
        backend.set_depth_compare(CompareFunction::Less);
        backend.clear([0.0, 0.0, 0.0, 0.0], 1.0);
        backend.clear_attachment(ENTITY_ID_ATTACHMENT, ClearValue::Int(-1));

        let map_defaults = [
            defaults.white,
            defaults.flat_normal,
            defaults.white,
            defaults.white,
            defaults.white,
        ];

        let mut draws = 0;
        if let Some(scene) = scene {
            scene.for_each_mesh(|entity, transform, mesh, material| {
                let Some(handle) = mesh.renderable() else {
                    return;
                };
                let material = material.map(|m| &m.material).unwrap_or(fallback);
                let shader = material.shader.as_ref().unwrap_or(&self.shader);

                shader.bind(backend);
                for (unit, (map, default)) in material.maps().iter().zip(map_defaults).enumerate() {
                    backend.bind_texture(unit as u32, map.unwrap_or(default));
                }
                shader.set_params(
                    backend,
                    &material.gbuffer_params(transform.transform(), entity.index() as i32),
                );
                backend.draw_mesh(handle);
                draws += 1;
            });
        }

        backend.unbind_framebuffer();
        draws
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn shader(&self) -> &Shader<GBufferParams> {
        &self.shader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MaterialComponent, MeshComponent};

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<GBufferParams>(), 128);
        assert_eq!(offset_of!(GBufferParams, entity_id), 92);
    }

    #[test]
    fn test_material_and_fallback_paths() {
        let mut backend = HeadlessBackend::new();
        let pass = GBufferPass::new(&mut backend, 64, 64, None).unwrap();
        let defaults = DefaultTextures::create(&mut backend).unwrap();
        let fallback = Material::fallback(defaults.white);
        let cube = crate::resources::Mesh::cube().upload(&mut backend).unwrap();

        let mut scene = Scene::new("gbuffer");
        let plain = scene.create_entity("plain");
        scene.insert(plain, MeshComponent::new("cube", cube));
        let red = scene.create_entity("red");
        scene.insert(red, MeshComponent::new("cube", cube));
        scene.insert(
            red,
            MaterialComponent::new(Material::plastic(Vec4::new(1.0, 0.0, 0.0, 1.0))),
        );

        let draws = pass.execute(&mut backend, Some(&mut scene), &defaults, &fallback);
        assert_eq!(draws, 2);

        let records = backend.draws_into(pass.framebuffer());
        for record in records {
            let params: GBufferParams = bytemuck::pod_read_unaligned(&record.params);
            assert_eq!(record.shader, Some(pass.shader().handle()));
            assert!(params.albedo.truncate().max_element() > 0.0);
            if params.entity_id == plain.index() as i32 {
                assert_eq!(params.has_albedo_map, 1);
                assert_eq!(record.texture_at(0), Some(defaults.white));
            } else {
                assert_eq!(params.entity_id, red.index() as i32);
                assert_eq!(params.albedo, Vec4::new(1.0, 0.0, 0.0, 1.0));
                assert_eq!(record.texture_at(1), Some(defaults.flat_normal));
            }
        }

        assert!(backend.commands().contains(&RecordedCommand::ClearAttachment {
            index: ENTITY_ID_ATTACHMENT,
            value: ClearValue::Int(-1),
        }));
    }
}
