//! Core backend abstraction traits
//!
//! The renderer talks to the GPU through immediate-style framebuffer, shader,
//! uniform-buffer, mesh and texture handles. Backends are free to buffer the
//! calls (the wgpu backend replays them as render passes) as long as the
//! observable ordering matches program order.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a framebuffer and its attachment set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a compiled shader program; stable across reloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub(crate) u64);

/// Handle to uploaded vertex and index data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub(crate) u64);

/// Handle to a uniform buffer living at a fixed binding point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformBufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

impl TextureHandle {
    /// Raw identifier, suitable for handing to a UI layer
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Main graphics backend trait
pub trait GraphicsBackend {
    /// Human readable backend name
    fn name(&self) -> &'static str;

    /// Largest texture edge the device accepts
    fn max_texture_dimension(&self) -> u32;

    // Framebuffers

    /// Create a framebuffer with every attachment in `spec`
    fn create_framebuffer(&mut self, spec: &FramebufferSpec) -> BackendResult<FramebufferHandle>;

    /// Reallocate all attachments at the new size. On error the old
    /// attachments stay in place.
    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()>;

    /// Release a framebuffer together with its attachment textures
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Current specification (size reflects the last successful resize)
    fn framebuffer_spec(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferSpec>;

    /// Texture backing color attachment `index`
    fn color_attachment(&self, framebuffer: FramebufferHandle, index: usize) -> Option<TextureHandle>;

    /// Texture backing the depth attachment
    fn depth_attachment(&self, framebuffer: FramebufferHandle) -> Option<TextureHandle>;

    /// Bind as render target; the viewport covers the whole framebuffer
    fn bind_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Finish rendering into the bound framebuffer
    fn unbind_framebuffer(&mut self);

    /// Clear every color attachment to `color` and depth to `depth`
    fn clear(&mut self, color: [f32; 4], depth: f32);

    /// Clear one color attachment of the bound framebuffer
    fn clear_attachment(&mut self, index: usize, value: ClearValue);

    /// Copy the depth attachment of `source` into `destination` (same size)
    fn blit_depth(&mut self, source: FramebufferHandle, destination: FramebufferHandle);

    /// Enable or disable depth testing for following draws
    fn set_depth_test(&mut self, enabled: bool);

    /// Depth comparison used by following draws
    fn set_depth_compare(&mut self, compare: CompareFunction);

    // Shaders

    /// Compile `source` into a program described by `desc`
    fn create_shader(&mut self, desc: &ShaderDescriptor, source: &str) -> BackendResult<ShaderHandle>;

    /// Recompile in place; the handle stays valid. On error the previous
    /// program is kept.
    fn reload_shader(&mut self, shader: ShaderHandle, source: &str) -> BackendResult<()>;

    /// Use `shader` for following draws
    fn bind_shader(&mut self, shader: ShaderHandle);

    /// Replace the per-draw parameter block of `shader`
    fn set_shader_params(&mut self, shader: ShaderHandle, data: &[u8]);

    // Buffers and geometry

    /// Allocate a uniform buffer of `size` bytes at `binding`
    fn create_uniform_buffer(
        &mut self,
        label: &str,
        size: u64,
        binding: u32,
    ) -> BackendResult<UniformBufferHandle>;

    /// Overwrite the whole block
    fn write_uniform_buffer(&mut self, buffer: UniformBufferHandle, data: &[u8]);

    /// Upload vertex and index data
    fn create_mesh(&mut self, label: &str, vertices: &[Vertex], indices: &[u32])
        -> BackendResult<MeshHandle>;

    /// Draw `mesh` with the bound shader into the bound framebuffer
    fn draw_mesh(&mut self, mesh: MeshHandle);

    /// Release mesh buffers
    fn destroy_mesh(&mut self, mesh: MeshHandle);

    // Textures

    /// Create a texture, optionally filled with tightly packed texels
    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle>;

    /// Bind `texture` to `unit` for following draws
    fn bind_texture(&mut self, unit: u32, texture: TextureHandle);

    /// Release a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    // Execution

    /// Submit everything recorded so far
    fn submit(&mut self);
}
