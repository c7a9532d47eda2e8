//! Common types shared between backends

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use std::path::PathBuf;

/// Largest framebuffer edge the renderer will allocate
pub const MAX_FRAMEBUFFER_SIZE: u32 = 8192;

/// Number of texture units a shader may declare (units `0..MAX_TEXTURE_UNITS`)
pub const MAX_TEXTURE_UNITS: u32 = 15;

/// Binding of the shared linear sampler inside the texture group
pub const SAMPLER_BINDING: u32 = 15;

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Rg32Float,
    R32Sint,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, TextureFormat::R32Sint)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::R32Sint
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// How a shader samples a texture of this format
    pub fn sample_kind(&self) -> TextureKind {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Rgba16Float => TextureKind::Float,
            TextureFormat::Rgba32Float | TextureFormat::Rg32Float => TextureKind::UnfilterableFloat,
            TextureFormat::R32Sint => TextureKind::Sint,
            TextureFormat::Depth32Float => TextureKind::Depth,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

impl TextureDescriptor {
    /// Expected byte length of tightly packed texel data
    pub fn data_size(&self) -> usize {
        (self.width * self.height * self.format.bytes_per_pixel()) as usize
    }
}

/// Value used to clear a single framebuffer attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Int(i32),
    Depth(f32),
}

/// Framebuffer specification: fixed attachment list, size and clear color
#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferSpec {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Attachment formats in order; at most one depth format
    pub attachments: Vec<TextureFormat>,
    pub clear_color: [f32; 4],
}

impl FramebufferSpec {
    pub fn new(label: &str, width: u32, height: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            attachments: Vec::new(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn with_attachment(mut self, format: TextureFormat) -> Self {
        self.attachments.push(format);
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Color attachment formats, in attachment-index order
    pub fn color_formats(&self) -> Vec<TextureFormat> {
        self.attachments
            .iter()
            .copied()
            .filter(|f| !f.is_depth())
            .collect()
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.attachments.iter().copied().find(|f| f.is_depth())
    }
}

/// Sampling class a shader expects for a texture slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Float,
    UnfilterableFloat,
    Depth,
    Sint,
}

/// A texture unit declared by a shader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSlot {
    pub unit: u32,
    pub name: &'static str,
    pub kind: TextureKind,
}

impl TextureSlot {
    pub const fn new(unit: u32, name: &'static str, kind: TextureKind) -> Self {
        Self { unit, name, kind }
    }
}

/// A global uniform block a shader reads at a fixed binding point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub size: u64,
}

/// Everything a backend needs to build programs for one shader
#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    pub label: String,
    /// Embedded WGSL used when no file is configured
    pub source: &'static str,
    /// Optional file that overrides the embedded source (hot-reloadable)
    pub path: Option<PathBuf>,
    pub uniform_buffers: Vec<UniformBinding>,
    /// Size of the per-draw parameter block in bytes
    pub params_size: u64,
    pub textures: Vec<TextureSlot>,
    /// Depth-only shaders have no fragment stage
    pub has_fragment: bool,
}

impl ShaderDescriptor {
    pub fn new(label: &str, source: &'static str) -> Self {
        Self {
            label: label.to_string(),
            source,
            path: None,
            uniform_buffers: Vec::new(),
            params_size: 0,
            textures: Vec::new(),
            has_fragment: true,
        }
    }

    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    pub fn with_uniform_buffer(mut self, binding: u32, size: u64) -> Self {
        self.uniform_buffers.push(UniformBinding { binding, size });
        self
    }

    pub fn with_texture(mut self, slot: TextureSlot) -> Self {
        self.textures.push(slot);
        self
    }

    pub fn depth_only(mut self) -> Self {
        self.has_fragment = false;
        self
    }
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// (shader location, byte offset, component count) for each attribute
    pub const ATTRIBUTES: [(u32, u64, u32); 4] = [(0, 0, 3), (1, 12, 3), (2, 24, 2), (3, 32, 4)];

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
        }
    }
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Depth state applied to subsequent draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test_enabled: bool,
    pub compare: CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: true,
            compare: CompareFunction::Less,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        assert_eq!(Vertex::STRIDE, 48);
        assert_eq!(Vertex::ATTRIBUTES[3].1, 32);
    }

    #[test]
    fn test_framebuffer_spec_splits_depth() {
        let spec = FramebufferSpec::new("gbuffer", 4, 4)
            .with_attachment(TextureFormat::Rgba16Float)
            .with_attachment(TextureFormat::R32Sint)
            .with_attachment(TextureFormat::Depth32Float);

        assert_eq!(
            spec.color_formats(),
            vec![TextureFormat::Rgba16Float, TextureFormat::R32Sint]
        );
        assert_eq!(spec.depth_format(), Some(TextureFormat::Depth32Float));
    }

    #[test]
    fn test_sample_kinds() {
        assert_eq!(TextureFormat::Rgba16Float.sample_kind(), TextureKind::Float);
        assert_eq!(TextureFormat::Rg32Float.sample_kind(), TextureKind::UnfilterableFloat);
        assert_eq!(TextureFormat::R32Sint.sample_kind(), TextureKind::Sint);
        assert_eq!(TextureFormat::Depth32Float.sample_kind(), TextureKind::Depth);
    }
}
