//! HDR environment lighting
//!
//! An [`Environment`] is loaded from an equirectangular HDR image. The image
//! itself is drawn behind the scene, and three small maps derived from it on
//! the CPU feed the image-based term of the lighting pass:
//!
//! - irradiance: cosine-weighted convolution (diffuse)
//! - prefilter: a glossy blur of the radiance (specular)
//! - BRDF LUT: split-sum scale and bias indexed by (N·V, roughness)
//!
//! All maps share the equirect mapping `u = atan2(z, x) / 2π + 0.5`,
//! `v = acos(y) / π`.

use crate::backend::*;
use crate::pipeline::shader_path;
use crate::shader::{ParamField, ParamType, Shader, ShaderParameters};
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec2, Vec3};
use half::f16;
use image::imageops::FilterType;
use image::Rgb32FImage;
use std::f32::consts::PI;
use std::mem::offset_of;
use std::path::Path;
use thiserror::Error;

pub const IRRADIANCE_SIZE: (u32, u32) = (32, 16);
pub const PREFILTER_SIZE: (u32, u32) = (64, 32);
pub const BRDF_LUT_SIZE: u32 = 32;

const CONVOLUTION_SOURCE_SIZE: (u32, u32) = (64, 32);
const PREFILTER_EXPONENT: i32 = 32;
const BRDF_SAMPLES: u32 = 64;

/// Environment loading error
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Failed to decode environment image: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-draw parameters of the background shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BackgroundParams {
    /// Inverse of projection * rotation-only view
    pub inverse_view_projection: Mat4,
    pub intensity: f32,
    pub exposure: f32,
    pub gamma: f32,
    pub _pad0: f32,
}

impl ShaderParameters for BackgroundParams {
    const FIELDS: &'static [ParamField] = &[
        ParamField::new(
            "inverse_view_projection",
            ParamType::Mat4,
            offset_of!(BackgroundParams, inverse_view_projection),
        ),
        ParamField::new("intensity", ParamType::Float, offset_of!(BackgroundParams, intensity)),
        ParamField::new("exposure", ParamType::Float, offset_of!(BackgroundParams, exposure)),
        ParamField::new("gamma", ParamType::Float, offset_of!(BackgroundParams, gamma)),
        ParamField::new("_pad0", ParamType::Float, offset_of!(BackgroundParams, _pad0)),
    ];
}

/// Texture unit of the equirect background
pub const BACKGROUND_MAP_UNIT: u32 = 0;

/// Descriptor of the background shader, overridable by
/// `<shader_dir>/background.wgsl`
pub fn background_shader_descriptor(shader_dir: Option<&Path>) -> ShaderDescriptor {
    ShaderDescriptor::new("background", BACKGROUND_SHADER)
        .with_path(shader_path(shader_dir, "background"))
        .with_texture(TextureSlot::new(
            BACKGROUND_MAP_UNIT,
            "background_map",
            TextureKind::Float,
        ))
}

/// Full-screen background drawn on the far plane. The vertex stage writes
/// z = w, so with a `LessEqual` test it only covers pixels no geometry wrote.
pub const BACKGROUND_SHADER: &str = r#"
struct BackgroundParams {
    inverse_view_projection: mat4x4<f32>,
    intensity: f32,
    exposure: f32,
    gamma: f32,
    _pad0: f32,
}

@group(1) @binding(0) var<uniform> params: BackgroundParams;

@group(2) @binding(0) var background_map: texture_2d<f32>;
@group(2) @binding(15) var linear_sampler: sampler;

const PI: f32 = 3.14159265359;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) ndc: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position.xy, 1.0, 1.0);
    out.ndc = position.xy;
    return out;
}

fn equirect_uv(dir: vec3<f32>) -> vec2<f32> {
    let u = atan2(dir.z, dir.x) / (2.0 * PI) + 0.5;
    let v = acos(clamp(dir.y, -1.0, 1.0)) / PI;
    return vec2<f32>(u, v);
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let far = params.inverse_view_projection * vec4<f32>(in.ndc, 1.0, 1.0);
    let dir = normalize(far.xyz / far.w);
    let radiance = textureSampleLevel(background_map, linear_sampler, equirect_uv(dir), 0.0).rgb;
    let hdr = radiance * params.intensity;
    let mapped = vec3<f32>(1.0) - exp(-hdr * params.exposure);
    return vec4<f32>(pow(mapped, vec3<f32>(1.0 / params.gamma)), 1.0);
}
"#;

/// A loaded HDR environment and its derived lighting maps
pub struct Environment {
    path: String,
    shader: Shader<BackgroundParams>,
    background: TextureHandle,
    irradiance: TextureHandle,
    prefilter: TextureHandle,
    brdf_lut: TextureHandle,
    intensity: f32,
    inverse_view_projection: Mat4,
}

impl Environment {
    /// Decode the HDR file at `path` and upload every map
    pub fn load<B: GraphicsBackend>(
        backend: &mut B,
        path: &str,
        shader: &Shader<BackgroundParams>,
    ) -> Result<Self, EnvironmentError> {
        let image = image::open(Path::new(path))?.into_rgb32f();
        Self::from_image(backend, path, &image, shader)
    }

    /// Build from already decoded linear radiance
    pub fn from_image<B: GraphicsBackend>(
        backend: &mut B,
        path: &str,
        image: &Rgb32FImage,
        shader: &Shader<BackgroundParams>,
    ) -> Result<Self, EnvironmentError> {
        let max = backend.max_texture_dimension();
        let background_image = if image.width() > max || image.height() > max {
            let (w, h) = (max, (max / 2).max(1));
            log::warn!(
                "Environment {path}: {}x{} exceeds the device limit, downsampling to {w}x{h}",
                image.width(),
                image.height()
            );
            image::imageops::resize(image, w, h, FilterType::Triangle)
        } else {
            image.clone()
        };

        let (sw, sh) = CONVOLUTION_SOURCE_SIZE;
        let source = EquirectMap::from_image(&image::imageops::resize(
            image,
            sw,
            sh,
            FilterType::Triangle,
        ));

        let background_texels: Vec<Vec3> = background_image
            .pixels()
            .map(|p| Vec3::new(p.0[0], p.0[1], p.0[2]))
            .collect();
        let irradiance_texels = convolve_irradiance(&source, IRRADIANCE_SIZE);
        let prefilter_texels = convolve_prefilter(&source, PREFILTER_SIZE);
        let brdf_texels = integrate_brdf_lut(BRDF_LUT_SIZE);

        let mut uploaded = Vec::with_capacity(4);
        let result = (|| -> BackendResult<()> {
            uploaded.push(upload_rgba16f(
                backend,
                &format!("{path} background"),
                (background_image.width(), background_image.height()),
                background_texels.iter().map(|c| c.extend(1.0).to_array()),
            )?);
            uploaded.push(upload_rgba16f(
                backend,
                &format!("{path} irradiance"),
                IRRADIANCE_SIZE,
                irradiance_texels.iter().map(|c| c.extend(1.0).to_array()),
            )?);
            uploaded.push(upload_rgba16f(
                backend,
                &format!("{path} prefilter"),
                PREFILTER_SIZE,
                prefilter_texels.iter().map(|c| c.extend(1.0).to_array()),
            )?);
            uploaded.push(upload_rgba16f(
                backend,
                "brdf_lut",
                (BRDF_LUT_SIZE, BRDF_LUT_SIZE),
                brdf_texels.iter().map(|ab| [ab.x, ab.y, 0.0, 1.0]),
            )?);
            Ok(())
        })();

        if let Err(e) = result {
            for texture in uploaded {
                backend.destroy_texture(texture);
            }
            return Err(e.into());
        }

        log::info!(
            "Loaded environment {path} ({}x{})",
            image.width(),
            image.height()
        );

        Ok(Self {
            path: path.to_string(),
            shader: shader.clone(),
            background: uploaded[0],
            irradiance: uploaded[1],
            prefilter: uploaded[2],
            brdf_lut: uploaded[3],
            intensity: 1.0,
            inverse_view_projection: Mat4::IDENTITY,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn background(&self) -> TextureHandle {
        self.background
    }

    pub fn irradiance(&self) -> TextureHandle {
        self.irradiance
    }

    pub fn prefilter(&self) -> TextureHandle {
        self.prefilter
    }

    pub fn brdf_lut(&self) -> TextureHandle {
        self.brdf_lut
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        self.intensity = intensity;
    }

    /// Camera matrices for the next background draw. Translation is dropped
    /// so the background stays at infinity.
    pub fn set_view_projection(&mut self, view: Mat4, projection: Mat4) {
        let rotation = Mat4::from_mat3(Mat3::from_mat4(view));
        self.inverse_view_projection = (projection * rotation).inverse();
    }

    /// Draw the background into the bound framebuffer with `quad`
    pub fn render_background<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        quad: MeshHandle,
        exposure: f32,
        gamma: f32,
    ) {
        self.shader.bind(backend);
        self.shader.set_params(
            backend,
            &BackgroundParams {
                inverse_view_projection: self.inverse_view_projection,
                intensity: self.intensity,
                exposure,
                gamma,
                _pad0: 0.0,
            },
        );
        backend.bind_texture(BACKGROUND_MAP_UNIT, self.background);
        backend.draw_mesh(quad);
    }

    /// Free every texture
    pub fn release<B: GraphicsBackend>(self, backend: &mut B) {
        for texture in [self.background, self.irradiance, self.prefilter, self.brdf_lut] {
            backend.destroy_texture(texture);
        }
        log::info!("Released environment {}", self.path);
    }
}

fn upload_rgba16f<B, I>(
    backend: &mut B,
    label: &str,
    (width, height): (u32, u32),
    texels: I,
) -> BackendResult<TextureHandle>
where
    B: GraphicsBackend,
    I: Iterator<Item = [f32; 4]>,
{
    let halves: Vec<f16> = texels.flatten().map(f16::from_f32).collect();
    backend.create_texture(
        &TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            format: TextureFormat::Rgba16Float,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        },
        Some(bytemuck::cast_slice(&halves)),
    )
}

/// Direction through the center of texel (x, y)
fn texel_direction(x: u32, y: u32, width: u32, height: u32) -> Vec3 {
    let phi = ((x as f32 + 0.5) / width as f32 - 0.5) * 2.0 * PI;
    let theta = (y as f32 + 0.5) / height as f32 * PI;
    Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin())
}

/// Radiance samples with their directions and solid angles
struct EquirectMap {
    radiance: Vec<Vec3>,
    directions: Vec<Vec3>,
    solid_angles: Vec<f32>,
}

impl EquirectMap {
    fn from_image(image: &Rgb32FImage) -> Self {
        let (width, height) = image.dimensions();
        let texel_area = (2.0 * PI / width as f32) * (PI / height as f32);

        let mut map = Self {
            radiance: Vec::with_capacity((width * height) as usize),
            directions: Vec::with_capacity((width * height) as usize),
            solid_angles: Vec::with_capacity((width * height) as usize),
        };
        for (x, y, pixel) in image.enumerate_pixels() {
            let theta = (y as f32 + 0.5) / height as f32 * PI;
            map.radiance
                .push(Vec3::new(pixel.0[0], pixel.0[1], pixel.0[2]).max(Vec3::ZERO));
            map.directions.push(texel_direction(x, y, width, height));
            map.solid_angles.push(texel_area * theta.sin());
        }
        map
    }

    fn samples(&self) -> impl Iterator<Item = (Vec3, Vec3, f32)> + '_ {
        self.radiance
            .iter()
            .zip(&self.directions)
            .zip(&self.solid_angles)
            .map(|((l, d), a)| (*l, *d, *a))
    }
}

fn convolve_irradiance(source: &EquirectMap, (width, height): (u32, u32)) -> Vec<Vec3> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let n = texel_direction(x, y, width, height);
            let sum = source
                .samples()
                .fold(Vec3::ZERO, |acc, (l, d, a)| acc + l * n.dot(d).max(0.0) * a);
            out.push(sum / PI);
        }
    }
    out
}

fn convolve_prefilter(source: &EquirectMap, (width, height): (u32, u32)) -> Vec<Vec3> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let n = texel_direction(x, y, width, height);
            let (sum, weight) = source.samples().fold((Vec3::ZERO, 0.0), |(s, w), (l, d, a)| {
                let k = n.dot(d).max(0.0).powi(PREFILTER_EXPONENT) * a;
                (s + l * k, w + k)
            });
            out.push(if weight > 0.0 { sum / weight } else { Vec3::ZERO });
        }
    }
    out
}

fn hammersley(i: u32, count: u32) -> Vec2 {
    Vec2::new(i as f32 / count as f32, i.reverse_bits() as f32 * 2.328_306_4e-10)
}

fn importance_sample_ggx(xi: Vec2, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = 2.0 * PI * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
}

fn geometry_schlick_ggx(n_dot: f32, roughness: f32) -> f32 {
    let k = roughness * roughness / 2.0;
    n_dot / (n_dot * (1.0 - k) + k)
}

/// Split-sum (scale, bias); x indexes N·V and y indexes roughness
fn integrate_brdf_lut(size: u32) -> Vec<Vec2> {
    let mut out = Vec::with_capacity((size * size) as usize);
    for y in 0..size {
        let roughness = (y as f32 + 0.5) / size as f32;
        for x in 0..size {
            let n_dot_v = (x as f32 + 0.5) / size as f32;
            let v = Vec3::new((1.0 - n_dot_v * n_dot_v).sqrt(), 0.0, n_dot_v);

            let mut scale = 0.0;
            let mut bias = 0.0;
            for i in 0..BRDF_SAMPLES {
                let h = importance_sample_ggx(hammersley(i, BRDF_SAMPLES), roughness);
                let l = 2.0 * v.dot(h) * h - v;
                let n_dot_l = l.z.max(0.0);
                if n_dot_l <= 0.0 {
                    continue;
                }
                let n_dot_h = h.z.max(0.0);
                let v_dot_h = v.dot(h).max(0.0);
                let g = geometry_schlick_ggx(n_dot_v, roughness)
                    * geometry_schlick_ggx(n_dot_l, roughness);
                let g_vis = g * v_dot_h / (n_dot_h * n_dot_v).max(1e-4);
                let fc = (1.0 - v_dot_h).powi(5);
                scale += (1.0 - fc) * g_vis;
                bias += fc * g_vis;
            }
            out.push(Vec2::new(scale, bias) / BRDF_SAMPLES as f32);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn constant_map(value: f32) -> EquirectMap {
        let image = Rgb32FImage::from_pixel(64, 32, Rgb([value, value, value]));
        EquirectMap::from_image(&image)
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<BackgroundParams>(), 80);
    }

    #[test]
    fn test_texel_direction_matches_equirect_uv() {
        let d = texel_direction(48, 16, 64, 32);
        let u = d.z.atan2(d.x) / (2.0 * PI) + 0.5;
        let v = d.y.clamp(-1.0, 1.0).acos() / PI;
        assert!((u - 48.5 / 64.0).abs() < 1e-4);
        assert!((v - 16.5 / 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_irradiance_of_uniform_sky_is_radiance() {
        let irradiance = convolve_irradiance(&constant_map(2.0), (8, 4));
        for e in irradiance {
            assert!((e.x - 2.0).abs() < 0.1, "irradiance {e}");
        }
    }

    #[test]
    fn test_prefilter_of_uniform_sky_is_radiance() {
        let prefilter = convolve_prefilter(&constant_map(0.5), (8, 4));
        for c in prefilter {
            assert!((c.y - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_brdf_lut_smooth_head_on() {
        let lut = integrate_brdf_lut(16);
        let ab = lut[15];
        assert!((ab.x + ab.y - 1.0).abs() < 0.1, "scale + bias = {}", ab.x + ab.y);
        assert!(lut.iter().all(|v| v.is_finite() && v.x >= 0.0 && v.y >= 0.0));
    }

    #[test]
    fn test_from_image_and_release() {
        let mut backend = HeadlessBackend::new();
        let shader =
            Shader::<BackgroundParams>::load(&mut backend, background_shader_descriptor(None)).unwrap();
        let image = Rgb32FImage::from_fn(16, 8, |x, _| Rgb([x as f32, 1.0, 0.5]));

        let env = Environment::from_image(&mut backend, "sky.hdr", &image, &shader).unwrap();
        assert_eq!(env.path(), "sky.hdr");
        assert_eq!(backend.texture_count(), 4);
        let desc = backend.texture_descriptor(env.background()).unwrap();
        assert_eq!((desc.width, desc.height), (16, 8));
        assert_eq!(desc.format, TextureFormat::Rgba16Float);

        env.release(&mut backend);
        assert_eq!(backend.texture_count(), 0);
    }

    #[test]
    fn test_load_missing_file() {
        let mut backend = HeadlessBackend::new();
        let shader =
            Shader::<BackgroundParams>::load(&mut backend, background_shader_descriptor(None)).unwrap();
        assert!(matches!(
            Environment::load(&mut backend, "/nonexistent/sky.hdr", &shader),
            Err(EnvironmentError::Image(_))
        ));
    }
}
