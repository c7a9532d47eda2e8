//! Headless recording backend
//!
//! This backend doesn't perform any GPU work. It validates every call against
//! its resource tables and records it, so the renderer can be exercised on
//! machines without an adapter and tests can inspect what was issued.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A draw call as seen by the backend, with the state it captured
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub mesh: MeshHandle,
    pub framebuffer: Option<FramebufferHandle>,
    pub shader: Option<ShaderHandle>,
    /// Parameter block of the bound shader at draw time
    pub params: Vec<u8>,
    /// Bound textures, ordered by unit
    pub textures: Vec<(u32, TextureHandle)>,
    pub depth: DepthState,
}

impl DrawRecord {
    /// Texture bound at `unit` when the draw was issued
    pub fn texture_at(&self, unit: u32) -> Option<TextureHandle> {
        self.textures
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, t)| *t)
    }
}

/// Everything the renderer asked the backend to do, in order
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindFramebuffer(FramebufferHandle),
    UnbindFramebuffer,
    Clear { color: [f32; 4], depth: f32 },
    ClearAttachment { index: usize, value: ClearValue },
    BlitDepth {
        source: FramebufferHandle,
        destination: FramebufferHandle,
    },
    SetDepthTest(bool),
    SetDepthCompare(CompareFunction),
    BindShader(ShaderHandle),
    BindTexture { unit: u32, texture: TextureHandle },
    WriteUniformBuffer { binding: u32, size: usize },
    Draw(DrawRecord),
    Submit,
}

struct HeadlessFramebuffer {
    spec: FramebufferSpec,
    colors: Vec<TextureHandle>,
    depth: Option<TextureHandle>,
}

struct HeadlessShader {
    label: String,
    source: String,
    params: Vec<u8>,
    params_size: usize,
    reloads: u32,
}

struct HeadlessUniformBuffer {
    binding: u32,
    data: Vec<u8>,
}

/// Recording backend with no GPU behind it
pub struct HeadlessBackend {
    framebuffers: HashMap<u64, HeadlessFramebuffer>,
    shaders: HashMap<u64, HeadlessShader>,
    uniform_buffers: HashMap<u64, HeadlessUniformBuffer>,
    meshes: HashMap<u64, (String, usize)>,
    textures: HashMap<u64, TextureDescriptor>,

    next_framebuffer_id: u64,
    next_shader_id: u64,
    next_buffer_id: u64,
    next_mesh_id: u64,
    next_texture_id: u64,

    bound_framebuffer: Option<FramebufferHandle>,
    bound_shader: Option<ShaderHandle>,
    bound_textures: BTreeMap<u32, TextureHandle>,
    depth: DepthState,

    commands: Vec<RecordedCommand>,
    failing_shaders: HashSet<String>,
    max_texture_dimension: u32,
    submissions: usize,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            framebuffers: HashMap::new(),
            shaders: HashMap::new(),
            uniform_buffers: HashMap::new(),
            meshes: HashMap::new(),
            textures: HashMap::new(),
            next_framebuffer_id: 1,
            next_shader_id: 1,
            next_buffer_id: 1,
            next_mesh_id: 1,
            next_texture_id: 1,
            bound_framebuffer: None,
            bound_shader: None,
            bound_textures: BTreeMap::new(),
            depth: DepthState::default(),
            commands: Vec::new(),
            failing_shaders: HashSet::new(),
            max_texture_dimension: MAX_FRAMEBUFFER_SIZE,
            submissions: 0,
        }
    }

    /// Limit the texture size the fake device accepts
    pub fn with_max_texture_dimension(mut self, max: u32) -> Self {
        self.max_texture_dimension = max;
        self
    }

    /// Make creation and reload of the shader labelled `label` fail
    pub fn fail_shader(&mut self, label: &str) {
        self.failing_shaders.insert(label.to_string());
    }

    /// Let a shader previously passed to [`Self::fail_shader`] compile again
    pub fn allow_shader(&mut self, label: &str) {
        self.failing_shaders.remove(label);
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Drain the command log
    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.commands.iter().filter_map(|c| match c {
            RecordedCommand::Draw(d) => Some(d),
            _ => None,
        })
    }

    /// Draws that targeted `framebuffer`
    pub fn draws_into(&self, framebuffer: FramebufferHandle) -> Vec<&DrawRecord> {
        self.draws()
            .filter(|d| d.framebuffer == Some(framebuffer))
            .collect()
    }

    /// Last contents written to the uniform buffer at `binding`
    pub fn uniform_data_at_binding(&self, binding: u32) -> Option<&[u8]> {
        self.uniform_buffers
            .values()
            .find(|b| b.binding == binding)
            .map(|b| b.data.as_slice())
    }

    pub fn shader_reload_count(&self, shader: ShaderHandle) -> Option<u32> {
        self.shaders.get(&shader.0).map(|s| s.reloads)
    }

    pub fn shader_source(&self, shader: ShaderHandle) -> Option<&str> {
        self.shaders.get(&shader.0).map(|s| s.source.as_str())
    }

    pub fn shader_label(&self, shader: ShaderHandle) -> Option<&str> {
        self.shaders.get(&shader.0).map(|s| s.label.as_str())
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Number of live textures, attachments included
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    fn check_size(&self, what: &str, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{what}: zero-sized {width}x{height}"
            )));
        }
        if width > self.max_texture_dimension || height > self.max_texture_dimension {
            return Err(BackendError::TextureCreationFailed(format!(
                "{what}: {width}x{height} exceeds device limit {}",
                self.max_texture_dimension
            )));
        }
        Ok(())
    }

    fn attachment_descriptor(spec: &FramebufferSpec, format: TextureFormat, index: usize) -> TextureDescriptor {
        TextureDescriptor {
            label: Some(format!("{} attachment {}", spec.label, index)),
            width: spec.width,
            height: spec.height,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_SRC
                | TextureUsage::COPY_DST,
        }
    }

    fn insert_texture(&mut self, desc: TextureDescriptor) -> TextureHandle {
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(id, desc);
        TextureHandle(id)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless Backend"
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_texture_dimension
    }

    fn create_framebuffer(&mut self, spec: &FramebufferSpec) -> BackendResult<FramebufferHandle> {
        log::trace!(
            "HeadlessBackend: creating framebuffer {} ({}x{}, {} attachments)",
            spec.label,
            spec.width,
            spec.height,
            spec.attachments.len()
        );
        self.check_size(&spec.label, spec.width, spec.height)
            .map_err(|e| BackendError::FramebufferCreationFailed(e.to_string()))?;
        if spec.attachments.iter().filter(|f| f.is_depth()).count() > 1 {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "{}: more than one depth attachment",
                spec.label
            )));
        }

        let mut colors = Vec::new();
        let mut depth = None;
        for (index, format) in spec.attachments.iter().copied().enumerate() {
            let handle = self.insert_texture(Self::attachment_descriptor(spec, format, index));
            if format.is_depth() {
                depth = Some(handle);
            } else {
                colors.push(handle);
            }
        }

        let id = self.next_framebuffer_id;
        self.next_framebuffer_id += 1;
        self.framebuffers.insert(
            id,
            HeadlessFramebuffer {
                spec: spec.clone(),
                colors,
                depth,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        self.check_size("resize", width, height)
            .map_err(|e| BackendError::FramebufferCreationFailed(e.to_string()))?;
        let fb = self
            .framebuffers
            .get_mut(&framebuffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{framebuffer:?}")))?;

        fb.spec.width = width;
        fb.spec.height = height;
        for handle in fb.colors.iter().chain(fb.depth.iter()) {
            if let Some(desc) = self.textures.get_mut(&handle.0) {
                desc.width = width;
                desc.height = height;
            }
        }
        log::trace!("HeadlessBackend: resized {} to {}x{}", fb.spec.label, width, height);
        Ok(())
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        let Some(fb) = self.framebuffers.remove(&framebuffer.0) else {
            log::warn!("HeadlessBackend: destroying unknown framebuffer {framebuffer:?}");
            return;
        };
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
        for handle in fb.colors.into_iter().chain(fb.depth) {
            self.destroy_texture(handle);
        }
    }

    fn framebuffer_spec(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferSpec> {
        self.framebuffers.get(&framebuffer.0).map(|fb| &fb.spec)
    }

    fn color_attachment(&self, framebuffer: FramebufferHandle, index: usize) -> Option<TextureHandle> {
        self.framebuffers
            .get(&framebuffer.0)
            .and_then(|fb| fb.colors.get(index).copied())
    }

    fn depth_attachment(&self, framebuffer: FramebufferHandle) -> Option<TextureHandle> {
        self.framebuffers.get(&framebuffer.0).and_then(|fb| fb.depth)
    }

    fn bind_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if !self.framebuffers.contains_key(&framebuffer.0) {
            log::warn!("HeadlessBackend: binding unknown framebuffer {framebuffer:?}");
            return;
        }
        self.bound_framebuffer = Some(framebuffer);
        self.commands.push(RecordedCommand::BindFramebuffer(framebuffer));
    }

    fn unbind_framebuffer(&mut self) {
        self.bound_framebuffer = None;
        self.commands.push(RecordedCommand::UnbindFramebuffer);
    }

    fn clear(&mut self, color: [f32; 4], depth: f32) {
        self.commands.push(RecordedCommand::Clear { color, depth });
    }

    fn clear_attachment(&mut self, index: usize, value: ClearValue) {
        let valid = self
            .bound_framebuffer
            .and_then(|fb| self.framebuffers.get(&fb.0))
            .is_some_and(|fb| index < fb.colors.len());
        if !valid {
            log::warn!("HeadlessBackend: clear of missing attachment {index}");
            return;
        }
        self.commands.push(RecordedCommand::ClearAttachment { index, value });
    }

    fn blit_depth(&mut self, source: FramebufferHandle, destination: FramebufferHandle) {
        let sizes = (
            self.framebuffer_spec(source).map(|s| (s.width, s.height)),
            self.framebuffer_spec(destination).map(|s| (s.width, s.height)),
        );
        match sizes {
            (Some(a), Some(b)) if a == b => {
                self.commands.push(RecordedCommand::BlitDepth { source, destination });
            }
            _ => log::warn!("HeadlessBackend: depth blit between mismatched framebuffers"),
        }
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.depth.test_enabled = enabled;
        self.commands.push(RecordedCommand::SetDepthTest(enabled));
    }

    fn set_depth_compare(&mut self, compare: CompareFunction) {
        self.depth.compare = compare;
        self.commands.push(RecordedCommand::SetDepthCompare(compare));
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor, source: &str) -> BackendResult<ShaderHandle> {
        log::trace!("HeadlessBackend: creating shader {}", desc.label);
        if self.failing_shaders.contains(&desc.label) {
            return Err(BackendError::ShaderCreationFailed(format!(
                "{}: compilation rejected",
                desc.label
            )));
        }

        let id = self.next_shader_id;
        self.next_shader_id += 1;
        self.shaders.insert(
            id,
            HeadlessShader {
                label: desc.label.clone(),
                source: source.to_string(),
                params: vec![0; desc.params_size as usize],
                params_size: desc.params_size as usize,
                reloads: 0,
            },
        );
        Ok(ShaderHandle(id))
    }

    fn reload_shader(&mut self, shader: ShaderHandle, source: &str) -> BackendResult<()> {
        let shader = self
            .shaders
            .get_mut(&shader.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{shader:?}")))?;
        if self.failing_shaders.contains(&shader.label) {
            return Err(BackendError::ShaderCreationFailed(format!(
                "{}: compilation rejected",
                shader.label
            )));
        }
        shader.source = source.to_string();
        shader.reloads += 1;
        log::trace!("HeadlessBackend: reloaded shader {}", shader.label);
        Ok(())
    }

    fn bind_shader(&mut self, shader: ShaderHandle) {
        self.bound_shader = Some(shader);
        self.commands.push(RecordedCommand::BindShader(shader));
    }

    fn set_shader_params(&mut self, shader: ShaderHandle, data: &[u8]) {
        let Some(entry) = self.shaders.get_mut(&shader.0) else {
            log::warn!("HeadlessBackend: params for unknown shader {shader:?}");
            return;
        };
        if data.len() != entry.params_size {
            log::warn!(
                "HeadlessBackend: {} expects {} parameter bytes, got {}",
                entry.label,
                entry.params_size,
                data.len()
            );
            return;
        }
        entry.params.copy_from_slice(data);
    }

    fn create_uniform_buffer(
        &mut self,
        label: &str,
        size: u64,
        binding: u32,
    ) -> BackendResult<UniformBufferHandle> {
        log::trace!("HeadlessBackend: creating uniform buffer {label} ({size} bytes @ {binding})");
        if size == 0 || size % 16 != 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{label}: size {size} is not a non-zero multiple of 16"
            )));
        }
        if self.uniform_buffers.values().any(|b| b.binding == binding) {
            return Err(BackendError::BufferCreationFailed(format!(
                "{label}: binding {binding} already in use"
            )));
        }

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.uniform_buffers.insert(
            id,
            HeadlessUniformBuffer {
                binding,
                data: vec![0; size as usize],
            },
        );
        Ok(UniformBufferHandle(id))
    }

    fn write_uniform_buffer(&mut self, buffer: UniformBufferHandle, data: &[u8]) {
        let Some(entry) = self.uniform_buffers.get_mut(&buffer.0) else {
            return;
        };
        if data.len() != entry.data.len() {
            log::warn!(
                "HeadlessBackend: uniform write of {} bytes into {}-byte block",
                data.len(),
                entry.data.len()
            );
            return;
        }
        entry.data.copy_from_slice(data);
        self.commands.push(RecordedCommand::WriteUniformBuffer {
            binding: entry.binding,
            size: data.len(),
        });
    }

    fn create_mesh(
        &mut self,
        label: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> BackendResult<MeshHandle> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!("{label}: empty mesh")));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(BackendError::BufferCreationFailed(format!(
                "{label}: index {bad} out of range"
            )));
        }

        let id = self.next_mesh_id;
        self.next_mesh_id += 1;
        self.meshes.insert(id, (label.to_string(), indices.len()));
        Ok(MeshHandle(id))
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        if !self.meshes.contains_key(&mesh.0) {
            log::warn!("HeadlessBackend: draw of unknown mesh {mesh:?}");
            return;
        }
        let params = self
            .bound_shader
            .and_then(|s| self.shaders.get(&s.0))
            .map(|s| s.params.clone())
            .unwrap_or_default();

        self.commands.push(RecordedCommand::Draw(DrawRecord {
            mesh,
            framebuffer: self.bound_framebuffer,
            shader: self.bound_shader,
            params,
            textures: self.bound_textures.iter().map(|(u, t)| (*u, *t)).collect(),
            depth: self.depth,
        }));
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        self.meshes.remove(&mesh.0);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle> {
        self.check_size(desc.label.as_deref().unwrap_or("texture"), desc.width, desc.height)?;
        if let Some(data) = data {
            if data.len() != desc.data_size() {
                return Err(BackendError::TextureCreationFailed(format!(
                    "{:?}: expected {} bytes, got {}",
                    desc.label,
                    desc.data_size(),
                    data.len()
                )));
            }
        }
        Ok(self.insert_texture(desc.clone()))
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) {
        if unit >= MAX_TEXTURE_UNITS {
            log::warn!("HeadlessBackend: texture unit {unit} out of range");
            return;
        }
        self.bound_textures.insert(unit, texture);
        self.commands.push(RecordedCommand::BindTexture { unit, texture });
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.bound_textures.retain(|_, t| *t != texture);
    }

    fn submit(&mut self) {
        self.submissions += 1;
        self.commands.push(RecordedCommand::Submit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(width: u32, height: u32) -> FramebufferSpec {
        FramebufferSpec::new("test", width, height)
            .with_attachment(TextureFormat::Rgba8Unorm)
            .with_attachment(TextureFormat::Depth32Float)
    }

    #[test]
    fn test_framebuffer_attachments() {
        let mut backend = HeadlessBackend::new();
        let fb = backend.create_framebuffer(&spec(64, 32)).unwrap();

        assert!(backend.color_attachment(fb, 0).is_some());
        assert!(backend.color_attachment(fb, 1).is_none());
        assert!(backend.depth_attachment(fb).is_some());
        assert_eq!(backend.texture_count(), 2);
    }

    #[test]
    fn test_destroy_framebuffer_releases_attachments() {
        let mut backend = HeadlessBackend::new();
        let keep = backend.create_framebuffer(&spec(16, 16)).unwrap();
        let fb = backend.create_framebuffer(&spec(64, 32)).unwrap();
        let color = backend.color_attachment(fb, 0).unwrap();
        backend.bind_framebuffer(fb);

        backend.destroy_framebuffer(fb);

        assert_eq!(backend.framebuffer_count(), 1);
        assert_eq!(backend.texture_count(), 2);
        assert!(backend.texture_descriptor(color).is_none());
        assert!(backend.framebuffer_spec(fb).is_none());
        assert!(backend.framebuffer_spec(keep).is_some());
    }

    #[test]
    fn test_resize_keeps_attachment_handles() {
        let mut backend = HeadlessBackend::new();
        let fb = backend.create_framebuffer(&spec(64, 32)).unwrap();
        let color = backend.color_attachment(fb, 0).unwrap();

        backend.resize_framebuffer(fb, 128, 96).unwrap();

        assert_eq!(backend.color_attachment(fb, 0), Some(color));
        let desc = backend.texture_descriptor(color).unwrap();
        assert_eq!((desc.width, desc.height), (128, 96));
        assert_eq!(backend.texture_count(), 2);
    }

    #[test]
    fn test_failed_resize_leaves_spec() {
        let mut backend = HeadlessBackend::new().with_max_texture_dimension(256);
        let fb = backend.create_framebuffer(&spec(64, 32)).unwrap();

        assert!(backend.resize_framebuffer(fb, 512, 32).is_err());
        let spec = backend.framebuffer_spec(fb).unwrap();
        assert_eq!((spec.width, spec.height), (64, 32));
    }

    #[test]
    fn test_draw_captures_state() {
        let mut backend = HeadlessBackend::new();
        let fb = backend.create_framebuffer(&spec(8, 8)).unwrap();
        let mut desc = ShaderDescriptor::new("test", "");
        desc.params_size = 16;
        let shader = backend.create_shader(&desc, "").unwrap();
        let tex = backend
            .create_texture(&TextureDescriptor::default(), Some(&[255, 255, 255, 255]))
            .unwrap();
        let quad = backend
            .create_mesh("tri", &[Vertex::new(glam::Vec3::ZERO, glam::Vec3::Z, glam::Vec2::ZERO); 3], &[0, 1, 2])
            .unwrap();

        backend.bind_framebuffer(fb);
        backend.bind_shader(shader);
        backend.set_shader_params(shader, &[7u8; 16]);
        backend.bind_texture(2, tex);
        backend.draw_mesh(quad);
        backend.unbind_framebuffer();

        let draws = backend.draws_into(fb);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].params, vec![7u8; 16]);
        assert_eq!(draws[0].texture_at(2), Some(tex));
        assert_eq!(draws[0].shader, Some(shader));
    }

    #[test]
    fn test_failing_shader() {
        let mut backend = HeadlessBackend::new();
        backend.fail_shader("broken");
        let desc = ShaderDescriptor::new("broken", "");
        assert!(matches!(
            backend.create_shader(&desc, ""),
            Err(BackendError::ShaderCreationFailed(_))
        ));
    }

    #[test]
    fn test_uniform_binding_conflict() {
        let mut backend = HeadlessBackend::new();
        backend.create_uniform_buffer("a", 64, 0).unwrap();
        assert!(backend.create_uniform_buffer("b", 64, 0).is_err());
        assert!(backend.create_uniform_buffer("c", 20, 1).is_err());
    }
}
