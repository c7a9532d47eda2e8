//! Deferred lighting pass
//!
//! Shades the G-buffer with a full-screen quad: Cook-Torrance GGX for the
//! directional, point and spot lights in the light block, PCF or PCSS
//! shadows for the directional light, and image-based ambient when an
//! environment is loaded. The environment background is then composited
//! behind the lit geometry using the G-buffer depth.

use super::gbuffer_pass::CAMERA_BINDING;
use super::lights::{LightUniformBlock, LIGHTS_BINDING};
use super::shader_path;
use super::shadow_pass::{ShadowUniformData, SHADOW_BINDING};
use crate::backend::*;
use crate::renderer::RendererError;
use crate::resources::{DefaultTextures, Environment};
use crate::scene::CameraUniformData;
use crate::shader::{ParamField, ParamType, Shader, ShaderParameters};
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;
use std::path::Path;

/// Texture units read by the lighting shader
pub mod units {
    pub const POSITION: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const ALBEDO: u32 = 2;
    pub const MATERIAL: u32 = 3;
    pub const SHADOW_MAP: u32 = 4;
    pub const BLOCKER_DISK: u32 = 5;
    pub const PCF_DISK: u32 = 6;
    pub const IRRADIANCE: u32 = 7;
    pub const PREFILTER: u32 = 8;
    pub const BRDF_LUT: u32 = 9;
}

/// Per-draw lighting parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingParams {
    pub exposure: f32,
    pub gamma: f32,
    pub shadow_near: f32,
    /// Filter kernel size in shadow-map UV units
    pub light_size: f32,
    pub intensity: f32,
    pub env_intensity: f32,
    pub pcf_samples: i32,
    pub blocker_samples: i32,
    pub soft_shadows: i32,
    pub has_environment: i32,
    pub shadow_map_size: f32,
    pub shadow_far: f32,
}

impl ShaderParameters for LightingParams {
    const FIELDS: &'static [ParamField] = &[
        ParamField::new("exposure", ParamType::Float, offset_of!(LightingParams, exposure)),
        ParamField::new("gamma", ParamType::Float, offset_of!(LightingParams, gamma)),
        ParamField::new("shadow_near", ParamType::Float, offset_of!(LightingParams, shadow_near)),
        ParamField::new("light_size", ParamType::Float, offset_of!(LightingParams, light_size)),
        ParamField::new("intensity", ParamType::Float, offset_of!(LightingParams, intensity)),
        ParamField::new("env_intensity", ParamType::Float, offset_of!(LightingParams, env_intensity)),
        ParamField::new("pcf_samples", ParamType::Int, offset_of!(LightingParams, pcf_samples)),
        ParamField::new(
            "blocker_samples",
            ParamType::Int,
            offset_of!(LightingParams, blocker_samples),
        ),
        ParamField::new("soft_shadows", ParamType::Int, offset_of!(LightingParams, soft_shadows)),
        ParamField::new(
            "has_environment",
            ParamType::Int,
            offset_of!(LightingParams, has_environment),
        ),
        ParamField::new(
            "shadow_map_size",
            ParamType::Float,
            offset_of!(LightingParams, shadow_map_size),
        ),
        ParamField::new("shadow_far", ParamType::Float, offset_of!(LightingParams, shadow_far)),
    ];
}

pub const DEFERRED_LIGHTING_SHADER: &str = r#"
const PI: f32 = 3.14159265359;
const MAX_POINT_LIGHTS: u32 = 4u;
const MAX_SPOT_LIGHTS: u32 = 4u;
const PREFILTER_MAX_LOD: f32 = 0.0;

struct CameraUniforms {
    view_projection: mat4x4<f32>,
    position: vec4<f32>,
}

struct PointLight {
    position: vec4<f32>,
    color: vec4<f32>,
    params: vec4<f32>,
    _pad: vec4<f32>,
}

struct SpotLight {
    position: vec4<f32>,
    direction: vec4<f32>,
    color: vec4<f32>,
    params: vec4<f32>,
}

struct DirectionalLight {
    direction: vec4<f32>,
    color: vec4<f32>,
    position: vec4<f32>,
    _pad: vec4<f32>,
}

struct LightBlock {
    point_lights: array<PointLight, 4>,
    spot_lights: array<SpotLight, 4>,
    directional: DirectionalLight,
}

struct ShadowUniforms {
    light_space: mat4x4<f32>,
}

struct LightingParams {
    exposure: f32,
    gamma: f32,
    shadow_near: f32,
    light_size: f32,
    intensity: f32,
    env_intensity: f32,
    pcf_samples: i32,
    blocker_samples: i32,
    soft_shadows: i32,
    has_environment: i32,
    shadow_map_size: f32,
    shadow_far: f32,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(0) @binding(1) var<uniform> lights: LightBlock;
@group(0) @binding(2) var<uniform> shadow: ShadowUniforms;
@group(1) @binding(0) var<uniform> params: LightingParams;

@group(2) @binding(0) var gbuffer_position: texture_2d<f32>;
@group(2) @binding(1) var gbuffer_normal: texture_2d<f32>;
@group(2) @binding(2) var gbuffer_albedo: texture_2d<f32>;
@group(2) @binding(3) var gbuffer_material: texture_2d<f32>;
@group(2) @binding(4) var shadow_map: texture_depth_2d;
@group(2) @binding(5) var blocker_disk: texture_2d<f32>;
@group(2) @binding(6) var pcf_disk: texture_2d<f32>;
@group(2) @binding(7) var irradiance_map: texture_2d<f32>;
@group(2) @binding(8) var prefilter_map: texture_2d<f32>;
@group(2) @binding(9) var brdf_lut: texture_2d<f32>;
@group(2) @binding(15) var linear_sampler: sampler;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position.xy, 0.0, 1.0);
    out.uv = uv;
    return out;
}

fn equirect_uv(dir: vec3<f32>) -> vec2<f32> {
    let u = atan2(dir.z, dir.x) / (2.0 * PI) + 0.5;
    let v = acos(clamp(dir.y, -1.0, 1.0)) / PI;
    return vec2<f32>(u, v);
}

// ---- BRDF ----

fn distribution_ggx(n_dot_h: f32, roughness: f32) -> f32 {
    let a = roughness * roughness;
    let a2 = a * a;
    let d = n_dot_h * n_dot_h * (a2 - 1.0) + 1.0;
    return a2 / max(PI * d * d, 1e-5);
}

fn geometry_schlick_ggx(n_dot: f32, roughness: f32) -> f32 {
    let r = roughness + 1.0;
    let k = r * r / 8.0;
    return n_dot / (n_dot * (1.0 - k) + k);
}

fn fresnel_schlick(cos_theta: f32, f0: vec3<f32>) -> vec3<f32> {
    return f0 + (1.0 - f0) * pow(clamp(1.0 - cos_theta, 0.0, 1.0), 5.0);
}

fn fresnel_schlick_roughness(cos_theta: f32, f0: vec3<f32>, roughness: f32) -> vec3<f32> {
    return f0 + (max(vec3<f32>(1.0 - roughness), f0) - f0) * pow(clamp(1.0 - cos_theta, 0.0, 1.0), 5.0);
}

fn cook_torrance(
    n: vec3<f32>,
    v: vec3<f32>,
    l: vec3<f32>,
    radiance: vec3<f32>,
    albedo: vec3<f32>,
    roughness: f32,
    metallic: f32,
) -> vec3<f32> {
    let h = normalize(v + l);
    let n_dot_l = max(dot(n, l), 0.0);
    let n_dot_v = max(dot(n, v), 0.0);
    let f0 = mix(vec3<f32>(0.04), albedo, metallic);

    let d = distribution_ggx(max(dot(n, h), 0.0), roughness);
    let g = geometry_schlick_ggx(n_dot_v, roughness) * geometry_schlick_ggx(n_dot_l, roughness);
    let f = fresnel_schlick(max(dot(h, v), 0.0), f0);

    let specular = d * g * f / max(4.0 * n_dot_v * n_dot_l, 1e-4);
    let kd = (vec3<f32>(1.0) - f) * (1.0 - metallic);
    return (kd * albedo / PI + specular) * radiance * n_dot_l;
}

fn range_falloff(distance: f32, range: f32) -> f32 {
    let ratio = distance / max(range, 1e-4);
    let window = clamp(1.0 - ratio * ratio * ratio * ratio, 0.0, 1.0);
    return window * window / (distance * distance + 1.0);
}

// ---- Shadows ----

fn poisson(disk: texture_2d<f32>, index: i32) -> vec2<f32> {
    return textureLoad(disk, vec2<i32>(index, 0), 0).xy;
}

fn shadow_depth(uv: vec2<f32>) -> f32 {
    let size = i32(params.shadow_map_size);
    let texel = clamp(vec2<i32>(uv * params.shadow_map_size), vec2<i32>(0), vec2<i32>(size - 1));
    return textureLoad(shadow_map, texel, 0);
}

fn linear_depth(depth: f32) -> f32 {
    return params.shadow_near + depth * (params.shadow_far - params.shadow_near);
}

fn pcf(uv: vec2<f32>, receiver: f32, radius: f32, bias: f32) -> f32 {
    let count = max(params.pcf_samples, 1);
    var lit = 0.0;
    for (var i = 0; i < count; i = i + 1) {
        let offset = poisson(pcf_disk, i) * radius;
        if receiver - bias <= shadow_depth(uv + offset) {
            lit = lit + 1.0;
        }
    }
    return lit / f32(count);
}

fn pcss(uv: vec2<f32>, receiver: f32, bias: f32) -> f32 {
    let z_receiver = linear_depth(receiver);
    let search = params.light_size * max(z_receiver - params.shadow_near, 0.0) / z_receiver;

    let count = max(params.blocker_samples, 1);
    var blockers = 0;
    var blocker_sum = 0.0;
    for (var i = 0; i < count; i = i + 1) {
        let sample_depth = shadow_depth(uv + poisson(blocker_disk, i) * search);
        if sample_depth < receiver - bias {
            blocker_sum = blocker_sum + sample_depth;
            blockers = blockers + 1;
        }
    }
    if blockers == 0 {
        return 1.0;
    }

    let z_blocker = linear_depth(blocker_sum / f32(blockers));
    let penumbra = (z_receiver - z_blocker) / max(z_blocker, 1e-4);
    let radius = max(penumbra * params.light_size, 1.0 / params.shadow_map_size);
    return pcf(uv, receiver, radius, bias);
}

fn directional_visibility(world_position: vec3<f32>, n_dot_l: f32) -> f32 {
    let light_clip = shadow.light_space * vec4<f32>(world_position, 1.0);
    let projected = light_clip.xyz / light_clip.w;
    let uv = vec2<f32>(projected.x * 0.5 + 0.5, 1.0 - (projected.y * 0.5 + 0.5));
    if any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) || projected.z > 1.0 {
        return 1.0;
    }

    let bias = max(0.002 * (1.0 - n_dot_l), 0.0005);
    if params.soft_shadows != 0 {
        return pcss(uv, projected.z, bias);
    }
    return pcf(uv, projected.z, 1.5 / params.shadow_map_size, bias);
}

// ---- Tonemapping ----

fn tonemap(color: vec3<f32>) -> vec3<f32> {
    let mapped = vec3<f32>(1.0) - exp(-color * params.exposure);
    return pow(mapped, vec3<f32>(1.0 / params.gamma));
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(in.clip_position.xy);
    let position_sample = textureLoad(gbuffer_position, texel, 0);
    if position_sample.w == 0.0 {
        discard;
    }

    let world_position = position_sample.xyz;
    let n = normalize(textureLoad(gbuffer_normal, texel, 0).xyz);
    let albedo = textureLoad(gbuffer_albedo, texel, 0).rgb;
    let material = textureLoad(gbuffer_material, texel, 0);
    let roughness = clamp(material.r, 0.04, 1.0);
    let metallic = material.g;
    let ao = material.b;
    let v = normalize(camera.position.xyz - world_position);

    var color = vec3<f32>(0.0);

    let sun = lights.directional;
    if sun.direction.w != 0.0 {
        let l = normalize(-sun.direction.xyz);
        let visibility = directional_visibility(world_position, max(dot(n, l), 0.0));
        let radiance = sun.color.rgb * sun.color.w * params.intensity;
        color = color + cook_torrance(n, v, l, radiance, albedo, roughness, metallic) * visibility;
    }

    for (var i = 0u; i < MAX_POINT_LIGHTS; i = i + 1u) {
        let light = lights.point_lights[i];
        if light.position.w == 0.0 {
            continue;
        }
        let to_light = light.position.xyz - world_position;
        let distance = length(to_light);
        let l = to_light / max(distance, 1e-4);
        let radiance = light.color.rgb * light.color.w * params.intensity
            * range_falloff(distance, light.params.x);
        color = color + cook_torrance(n, v, l, radiance, albedo, roughness, metallic);
    }

    for (var i = 0u; i < MAX_SPOT_LIGHTS; i = i + 1u) {
        let light = lights.spot_lights[i];
        if light.position.w == 0.0 {
            continue;
        }
        let to_light = light.position.xyz - world_position;
        let distance = length(to_light);
        let l = to_light / max(distance, 1e-4);
        let cos_angle = dot(-l, normalize(light.direction.xyz));
        let cone = smoothstep(light.params.z, light.params.y, cos_angle);
        let radiance = light.color.rgb * light.color.w * params.intensity
            * range_falloff(distance, light.params.x) * cone;
        color = color + cook_torrance(n, v, l, radiance, albedo, roughness, metallic);
    }

    var ambient = vec3<f32>(0.03) * albedo * ao;
    if params.has_environment != 0 {
        let n_dot_v = max(dot(n, v), 0.0);
        let f0 = mix(vec3<f32>(0.04), albedo, metallic);
        let f = fresnel_schlick_roughness(n_dot_v, f0, roughness);
        let kd = (vec3<f32>(1.0) - f) * (1.0 - metallic);

        let irradiance = textureSampleLevel(irradiance_map, linear_sampler, equirect_uv(n), 0.0).rgb;
        let r = reflect(-v, n);
        let prefiltered = textureSampleLevel(prefilter_map, linear_sampler, equirect_uv(r), PREFILTER_MAX_LOD).rgb;
        let brdf = textureSampleLevel(brdf_lut, linear_sampler, vec2<f32>(n_dot_v, roughness), 0.0).rg;
        let specular = prefiltered * (f * brdf.x + brdf.y);
        ambient = (kd * irradiance * albedo + specular) * ao * params.env_intensity;
    }

    return vec4<f32>(tonemap(color + ambient), 1.0);
}
"#;

pub fn lighting_shader_descriptor(shader_dir: Option<&Path>) -> ShaderDescriptor {
    use units::*;
    ShaderDescriptor::new("lighting", DEFERRED_LIGHTING_SHADER)
        .with_path(shader_path(shader_dir, "lighting"))
        .with_uniform_buffer(CAMERA_BINDING, std::mem::size_of::<CameraUniformData>() as u64)
        .with_uniform_buffer(LIGHTS_BINDING, LightUniformBlock::SIZE)
        .with_uniform_buffer(SHADOW_BINDING, std::mem::size_of::<ShadowUniformData>() as u64)
        .with_texture(TextureSlot::new(POSITION, "gbuffer_position", TextureKind::Float))
        .with_texture(TextureSlot::new(NORMAL, "gbuffer_normal", TextureKind::Float))
        .with_texture(TextureSlot::new(ALBEDO, "gbuffer_albedo", TextureKind::Float))
        .with_texture(TextureSlot::new(MATERIAL, "gbuffer_material", TextureKind::Float))
        .with_texture(TextureSlot::new(SHADOW_MAP, "shadow_map", TextureKind::Depth))
        .with_texture(TextureSlot::new(
            BLOCKER_DISK,
            "blocker_disk",
            TextureKind::UnfilterableFloat,
        ))
        .with_texture(TextureSlot::new(PCF_DISK, "pcf_disk", TextureKind::UnfilterableFloat))
        .with_texture(TextureSlot::new(IRRADIANCE, "irradiance_map", TextureKind::Float))
        .with_texture(TextureSlot::new(PREFILTER, "prefilter_map", TextureKind::Float))
        .with_texture(TextureSlot::new(BRDF_LUT, "brdf_lut", TextureKind::Float))
}

/// Everything the lighting pass samples besides its own parameters
pub struct LightingInputs<'a> {
    pub gbuffer: FramebufferHandle,
    pub shadow_map: TextureHandle,
    pub blocker_disk: TextureHandle,
    pub pcf_disk: TextureHandle,
    pub environment: Option<&'a Environment>,
    pub defaults: &'a DefaultTextures,
    pub quad: MeshHandle,
}

/// Full-screen deferred shading into an LDR target
pub struct LightingPass {
    framebuffer: FramebufferHandle,
    shader: Shader<LightingParams>,
}

impl LightingPass {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        width: u32,
        height: u32,
        clear_color: [f32; 4],
        shader_dir: Option<&Path>,
    ) -> Result<Self, RendererError> {
        let spec = FramebufferSpec::new("lighting", width, height)
            .with_attachment(TextureFormat::Rgba8Unorm)
            .with_attachment(TextureFormat::Depth32Float)
            .with_clear_color(clear_color);
        let framebuffer = backend
            .create_framebuffer(&spec)
            .map_err(|source| RendererError::Initialization {
                resource: "lighting framebuffer",
                source,
            })?;
        let shader = Shader::load(backend, lighting_shader_descriptor(shader_dir))?;

        Ok(Self { framebuffer, shader })
    }

    pub fn execute<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        inputs: &LightingInputs<'_>,
        params: &LightingParams,
        clear_color: [f32; 4],
    ) {
        backend.bind_framebuffer(self.framebuffer);
        backend.clear(clear_color, 1.0);
        self.shader.bind(backend);
        backend.set_depth_test(false);

        for (unit, index) in [units::POSITION, units::NORMAL, units::ALBEDO, units::MATERIAL]
            .into_iter()
            .zip(0..)
        {
            if let Some(texture) = backend.color_attachment(inputs.gbuffer, index) {
                backend.bind_texture(unit, texture);
            }
        }
        backend.bind_texture(units::SHADOW_MAP, inputs.shadow_map);
        backend.bind_texture(units::BLOCKER_DISK, inputs.blocker_disk);
        backend.bind_texture(units::PCF_DISK, inputs.pcf_disk);

        let black = inputs.defaults.black;
        let (irradiance, prefilter, brdf) = inputs
            .environment
            .map(|env| (env.irradiance(), env.prefilter(), env.brdf_lut()))
            .unwrap_or((black, black, black));
        backend.bind_texture(units::IRRADIANCE, irradiance);
        backend.bind_texture(units::PREFILTER, prefilter);
        backend.bind_texture(units::BRDF_LUT, brdf);

        self.shader.set_params(backend, params);
        backend.draw_mesh(inputs.quad);

        // background only where the G-buffer saw no geometry
        backend.blit_depth(inputs.gbuffer, self.framebuffer);
        backend.set_depth_test(true);
        backend.set_depth_compare(CompareFunction::LessEqual);
        if let Some(env) = inputs.environment {
            env.render_background(backend, inputs.quad, params.exposure, params.gamma);
        }
        backend.set_depth_compare(CompareFunction::Less);
        backend.unbind_framebuffer();
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn shader(&self) -> &Shader<LightingParams> {
        &self.shader
    }
}
