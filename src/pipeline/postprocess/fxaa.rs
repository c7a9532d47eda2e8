//! FXAA anti-aliasing

use super::super::shader_path;
use crate::backend::*;
use crate::renderer::RendererError;
use crate::shader::{ParamField, ParamType, Shader, ShaderParameters};
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;
use std::path::Path;

/// Unit of the image being filtered
pub const FXAA_INPUT_UNIT: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FxaaParams {
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub _pad0: f32,
    pub _pad1: f32,
}

impl ShaderParameters for FxaaParams {
    const FIELDS: &'static [ParamField] = &[
        ParamField::new("viewport_width", ParamType::Float, offset_of!(FxaaParams, viewport_width)),
        ParamField::new(
            "viewport_height",
            ParamType::Float,
            offset_of!(FxaaParams, viewport_height),
        ),
        ParamField::new("_pad0", ParamType::Float, offset_of!(FxaaParams, _pad0)),
        ParamField::new("_pad1", ParamType::Float, offset_of!(FxaaParams, _pad1)),
    ];
}

pub const FXAA_SHADER: &str = r#"
struct FxaaParams {
    viewport_width: f32,
    viewport_height: f32,
    _pad0: f32,
    _pad1: f32,
}

@group(1) @binding(0) var<uniform> params: FxaaParams;
@group(2) @binding(0) var screen_texture: texture_2d<f32>;
@group(2) @binding(15) var linear_sampler: sampler;

const EDGE_THRESHOLD_MIN: f32 = 0.0312;
const EDGE_THRESHOLD_MAX: f32 = 0.125;
const SUBPIXEL_QUALITY: f32 = 0.75;
const SEARCH_STEPS: i32 = 12;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position.xy, 0.0, 1.0);
    output.uv = uv;
    return output;
}

fn luma(color: vec3<f32>) -> f32 {
    return sqrt(dot(color, vec3<f32>(0.299, 0.587, 0.114)));
}

fn sample_luma(uv: vec2<f32>) -> f32 {
    return luma(textureSampleLevel(screen_texture, linear_sampler, uv, 0.0).rgb);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let texel = vec2<f32>(1.0 / params.viewport_width, 1.0 / params.viewport_height);
    let uv = input.uv;
    let center = textureSampleLevel(screen_texture, linear_sampler, uv, 0.0);

    let luma_center = luma(center.rgb);
    let luma_down = sample_luma(uv + vec2<f32>(0.0, texel.y));
    let luma_up = sample_luma(uv - vec2<f32>(0.0, texel.y));
    let luma_left = sample_luma(uv - vec2<f32>(texel.x, 0.0));
    let luma_right = sample_luma(uv + vec2<f32>(texel.x, 0.0));

    let luma_min = min(luma_center, min(min(luma_down, luma_up), min(luma_left, luma_right)));
    let luma_max = max(luma_center, max(max(luma_down, luma_up), max(luma_left, luma_right)));
    let luma_range = luma_max - luma_min;
    if luma_range < max(EDGE_THRESHOLD_MIN, luma_max * EDGE_THRESHOLD_MAX) {
        return center;
    }

    let luma_down_left = sample_luma(uv + vec2<f32>(-texel.x, texel.y));
    let luma_up_right = sample_luma(uv + vec2<f32>(texel.x, -texel.y));
    let luma_up_left = sample_luma(uv - texel);
    let luma_down_right = sample_luma(uv + texel);

    let luma_down_up = luma_down + luma_up;
    let luma_left_right = luma_left + luma_right;
    let luma_left_corners = luma_down_left + luma_up_left;
    let luma_down_corners = luma_down_left + luma_down_right;
    let luma_right_corners = luma_down_right + luma_up_right;
    let luma_up_corners = luma_up_right + luma_up_left;

    let edge_horizontal = abs(-2.0 * luma_left + luma_left_corners)
        + abs(-2.0 * luma_center + luma_down_up) * 2.0
        + abs(-2.0 * luma_right + luma_right_corners);
    let edge_vertical = abs(-2.0 * luma_up + luma_up_corners)
        + abs(-2.0 * luma_center + luma_left_right) * 2.0
        + abs(-2.0 * luma_down + luma_down_corners);
    let is_horizontal = edge_horizontal >= edge_vertical;

    let luma_1 = select(luma_left, luma_up, is_horizontal);
    let luma_2 = select(luma_right, luma_down, is_horizontal);
    let gradient_1 = luma_1 - luma_center;
    let gradient_2 = luma_2 - luma_center;
    let steepest_is_1 = abs(gradient_1) >= abs(gradient_2);
    let gradient_scaled = 0.25 * max(abs(gradient_1), abs(gradient_2));

    var step_length = select(texel.x, texel.y, is_horizontal);
    var luma_local_average = 0.0;
    if steepest_is_1 {
        step_length = -step_length;
        luma_local_average = 0.5 * (luma_1 + luma_center);
    } else {
        luma_local_average = 0.5 * (luma_2 + luma_center);
    }

    var current_uv = uv;
    if is_horizontal {
        current_uv.y = current_uv.y + step_length * 0.5;
    } else {
        current_uv.x = current_uv.x + step_length * 0.5;
    }

    let offset = select(vec2<f32>(0.0, texel.y), vec2<f32>(texel.x, 0.0), is_horizontal);
    var uv_1 = current_uv - offset;
    var uv_2 = current_uv + offset;
    var luma_end_1 = sample_luma(uv_1) - luma_local_average;
    var luma_end_2 = sample_luma(uv_2) - luma_local_average;
    var reached_1 = abs(luma_end_1) >= gradient_scaled;
    var reached_2 = abs(luma_end_2) >= gradient_scaled;

    for (var i = 0; i < SEARCH_STEPS; i = i + 1) {
        if reached_1 && reached_2 {
            break;
        }
        if !reached_1 {
            uv_1 = uv_1 - offset;
            luma_end_1 = sample_luma(uv_1) - luma_local_average;
            reached_1 = abs(luma_end_1) >= gradient_scaled;
        }
        if !reached_2 {
            uv_2 = uv_2 + offset;
            luma_end_2 = sample_luma(uv_2) - luma_local_average;
            reached_2 = abs(luma_end_2) >= gradient_scaled;
        }
    }

    let distance_1 = select(uv.y - uv_1.y, uv.x - uv_1.x, is_horizontal);
    let distance_2 = select(uv_2.y - uv.y, uv_2.x - uv.x, is_horizontal);
    let is_direction_1 = distance_1 < distance_2;
    let distance_final = min(distance_1, distance_2);
    let edge_thickness = distance_1 + distance_2;
    let pixel_offset = -distance_final / edge_thickness + 0.5;

    let is_luma_center_smaller = luma_center < luma_local_average;
    let correct_variation = select(luma_end_2 < 0.0, luma_end_1 < 0.0, is_direction_1) != is_luma_center_smaller;
    var final_offset = select(0.0, pixel_offset, correct_variation);

    let luma_average = (1.0 / 12.0) * (2.0 * (luma_down_up + luma_left_right) + luma_left_corners + luma_right_corners);
    let sub_pixel_1 = clamp(abs(luma_average - luma_center) / luma_range, 0.0, 1.0);
    let sub_pixel_2 = (-2.0 * sub_pixel_1 + 3.0) * sub_pixel_1 * sub_pixel_1;
    final_offset = max(final_offset, sub_pixel_2 * sub_pixel_2 * SUBPIXEL_QUALITY);

    var final_uv = uv;
    if is_horizontal {
        final_uv.y = final_uv.y + final_offset * step_length;
    } else {
        final_uv.x = final_uv.x + final_offset * step_length;
    }

    return vec4<f32>(textureSampleLevel(screen_texture, linear_sampler, final_uv, 0.0).rgb, center.a);
}
"#;

pub fn fxaa_shader_descriptor(shader_dir: Option<&Path>) -> ShaderDescriptor {
    ShaderDescriptor::new("fxaa", FXAA_SHADER)
        .with_path(shader_path(shader_dir, "fxaa"))
        .with_texture(TextureSlot::new(FXAA_INPUT_UNIT, "screen_texture", TextureKind::Float))
}

/// Optional FXAA filter over the lit image
pub struct FxaaPass {
    framebuffer: FramebufferHandle,
    shader: Shader<FxaaParams>,
}

impl FxaaPass {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        width: u32,
        height: u32,
        shader_dir: Option<&Path>,
    ) -> Result<Self, RendererError> {
        let spec = FramebufferSpec::new("antialiasing", width, height)
            .with_attachment(TextureFormat::Rgba8Unorm);
        let framebuffer = backend
            .create_framebuffer(&spec)
            .map_err(|source| RendererError::Initialization {
                resource: "antialiasing framebuffer",
                source,
            })?;
        let shader = Shader::load(backend, fxaa_shader_descriptor(shader_dir))?;

        Ok(Self { framebuffer, shader })
    }

    /// Filter `input` into the AA target at the target's current size
    pub fn execute<B: GraphicsBackend>(&self, backend: &mut B, input: TextureHandle, quad: MeshHandle) {
        let (width, height) = backend
            .framebuffer_spec(self.framebuffer)
            .map(|spec| (spec.width, spec.height))
            .unwrap_or((1, 1));

        backend.bind_framebuffer(self.framebuffer);
        backend.clear([0.0, 0.0, 0.0, 1.0], 1.0);
        backend.set_depth_test(false);
        self.shader.bind(backend);
        self.shader.set_params(
            backend,
            &FxaaParams {
                viewport_width: width as f32,
                viewport_height: height as f32,
                _pad0: 0.0,
                _pad1: 0.0,
            },
        );
        backend.bind_texture(FXAA_INPUT_UNIT, input);
        backend.draw_mesh(quad);
        backend.set_depth_test(true);
        backend.unbind_framebuffer();
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn shader(&self) -> &Shader<FxaaParams> {
        &self.shader
    }
}
