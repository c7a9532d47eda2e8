//! wgpu backend implementation
//!
//! Renders offscreen. Every framebuffer bind opens a pending render pass whose
//! draws are buffered and replayed as one `wgpu::RenderPass` when the
//! framebuffer is unbound, re-bound, cleared after drawing, or submitted.
//!
//! Bind group conventions shared with the WGSL sources:
//! - group 0: global uniform buffers, `@binding(N)` for binding point N
//! - group 1: per-draw parameter block at binding 0 (dynamic offset)
//! - group 2: textures at `@binding(unit)` plus a linear sampler at binding 15

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU64;
use wgpu::util::DeviceExt;

const INITIAL_PARAMS_CAPACITY: u64 = 64 * 1024;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDescriptor,
}

struct GpuFramebuffer {
    spec: FramebufferSpec,
    colors: Vec<TextureHandle>,
    depth: Option<TextureHandle>,
}

struct GpuShader {
    desc: ShaderDescriptor,
    module: wgpu::ShaderModule,
    globals_layout: wgpu::BindGroupLayout,
    params_layout: wgpu::BindGroupLayout,
    textures_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    params: Vec<u8>,
    generation: u64,
}

struct GpuUniformBuffer {
    buffer: wgpu::Buffer,
    binding: u32,
    size: u64,
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

/// Everything that selects a distinct render pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: u64,
    generation: u64,
    colors: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    depth: DepthState,
}

/// Draw buffered until its pass is replayed
struct PendingDraw {
    shader: ShaderHandle,
    mesh: MeshHandle,
    params: Vec<u8>,
    textures: BTreeMap<u32, TextureHandle>,
    depth: DepthState,
}

/// Render pass opened by a framebuffer bind
struct PendingPass {
    framebuffer: FramebufferHandle,
    color_clears: Vec<Option<wgpu::Color>>,
    depth_clear: Option<f32>,
    draws: Vec<PendingDraw>,
}

impl PendingPass {
    fn new(framebuffer: FramebufferHandle, color_count: usize) -> Self {
        Self {
            framebuffer,
            color_clears: vec![None; color_count],
            depth_clear: None,
            draws: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.draws.is_empty()
            && self.depth_clear.is_none()
            && self.color_clears.iter().all(Option::is_none)
    }
}

/// Draw with its bind groups resolved, ready to encode
struct PreparedDraw {
    key: PipelineKey,
    mesh: MeshHandle,
    globals: wgpu::BindGroup,
    params: wgpu::BindGroup,
    params_offset: Option<u32>,
    textures: wgpu::BindGroup,
}

/// Default textures bound when a slot is empty or holds the wrong kind
struct FallbackTextures {
    float: TextureHandle,
    unfilterable: TextureHandle,
    depth: TextureHandle,
    sint: TextureHandle,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    // Resource storage
    framebuffers: HashMap<u64, GpuFramebuffer>,
    textures: HashMap<u64, GpuTexture>,
    shaders: HashMap<u64, GpuShader>,
    uniform_buffers: HashMap<u64, GpuUniformBuffer>,
    meshes: HashMap<u64, GpuMesh>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    sampler: wgpu::Sampler,
    fallback: FallbackTextures,

    // Handle counters
    next_framebuffer_id: u64,
    next_texture_id: u64,
    next_shader_id: u64,
    next_buffer_id: u64,
    next_mesh_id: u64,

    // Per-draw parameter ring, rewound on submit
    params_buffer: wgpu::Buffer,
    params_capacity: u64,
    params_cursor: u64,
    params_alignment: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    pending_pass: Option<PendingPass>,
    bound_shader: Option<ShaderHandle>,
    bound_textures: BTreeMap<u32, TextureHandle>,
    depth: DepthState,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            TextureFormat::R32Sint => wgpu::TextureFormat::R32Sint,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_sample_type(kind: TextureKind) -> wgpu::TextureSampleType {
        match kind {
            TextureKind::Float => wgpu::TextureSampleType::Float { filterable: true },
            TextureKind::UnfilterableFloat => wgpu::TextureSampleType::Float { filterable: false },
            TextureKind::Depth => wgpu::TextureSampleType::Depth,
            TextureKind::Sint => wgpu::TextureSampleType::Sint,
        }
    }

    /// Whether a texture of `format` may be bound to a slot expecting `kind`
    fn slot_accepts(kind: TextureKind, format: TextureFormat) -> bool {
        match (kind, format.sample_kind()) {
            (TextureKind::UnfilterableFloat, TextureKind::Float) => true,
            (expected, actual) => expected == actual,
        }
    }

    fn vertex_format(components: u32) -> wgpu::VertexFormat {
        match components {
            2 => wgpu::VertexFormat::Float32x2,
            3 => wgpu::VertexFormat::Float32x3,
            _ => wgpu::VertexFormat::Float32x4,
        }
    }

    /// Create an offscreen device on the best available adapter
    pub fn new_headless() -> BackendResult<Self> {
        pollster::block_on(Self::new_headless_async())
    }

    pub async fn new_headless_async() -> BackendResult<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all());

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Renderer Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("wgpu error: {error}");
        }));

        Ok(Self::from_device(instance, adapter, device, queue))
    }

    fn from_device(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let params_buffer = Self::create_params_buffer(&device, INITIAL_PARAMS_CAPACITY);
        let params_alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });

        let mut backend = Self {
            instance,
            adapter,
            device,
            queue,
            framebuffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            uniform_buffers: HashMap::new(),
            meshes: HashMap::new(),
            pipelines: HashMap::new(),
            sampler,
            fallback: FallbackTextures {
                float: TextureHandle(0),
                unfilterable: TextureHandle(0),
                depth: TextureHandle(0),
                sint: TextureHandle(0),
            },
            next_framebuffer_id: 1,
            next_texture_id: 1,
            next_shader_id: 1,
            next_buffer_id: 1,
            next_mesh_id: 1,
            params_buffer,
            params_capacity: INITIAL_PARAMS_CAPACITY,
            params_cursor: 0,
            params_alignment,
            encoder: Some(encoder),
            pending_pass: None,
            bound_shader: None,
            bound_textures: BTreeMap::new(),
            depth: DepthState::default(),
        };
        backend.create_fallback_textures();
        backend
    }

    fn create_params_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shader Params Ring"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn create_fallback_textures(&mut self) {
        let make = |backend: &mut Self, label: &str, format: TextureFormat, usage: TextureUsage, data: Option<Vec<u8>>| {
            let desc = TextureDescriptor {
                label: Some(label.to_string()),
                width: 1,
                height: 1,
                format,
                usage,
            };
            backend.insert_texture(&desc, data.as_deref())
        };

        let sampled = TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST;
        let float = make(self, "Fallback Float", TextureFormat::Rgba8Unorm, sampled, Some(vec![255; 4]));
        let unfilterable = make(self, "Fallback Unfilterable", TextureFormat::Rgba32Float, sampled, None);
        let sint = make(self, "Fallback Sint", TextureFormat::R32Sint, sampled, None);
        let depth = make(
            self,
            "Fallback Depth",
            TextureFormat::Depth32Float,
            TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
            None,
        );

        // Depth textures can't be written by the queue; clear to the far plane
        if let (Some(encoder), Some(tex)) = (self.encoder.as_mut(), self.textures.get(&depth.0)) {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Fallback Depth Clear"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &tex.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }

        self.fallback = FallbackTextures {
            float,
            unfilterable,
            depth,
            sint,
        };
    }

    fn fallback_for(&self, kind: TextureKind) -> TextureHandle {
        match kind {
            TextureKind::Float => self.fallback.float,
            TextureKind::UnfilterableFloat => self.fallback.unfilterable,
            TextureKind::Depth => self.fallback.depth,
            TextureKind::Sint => self.fallback.sint,
        }
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), String> {
        let max = self.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(format!("invalid size {width}x{height} (max {max})"));
        }
        Ok(())
    }

    fn allocate_texture(&self, desc: &TextureDescriptor, data: Option<&[u8]>) -> GpuTexture {
        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });

        if let Some(data) = data {
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(desc.width * desc.format.bytes_per_pixel()),
                    rows_per_image: Some(desc.height),
                },
                size,
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            texture,
            view,
            desc: desc.clone(),
        }
    }

    fn insert_texture(&mut self, desc: &TextureDescriptor, data: Option<&[u8]>) -> TextureHandle {
        let gpu = self.allocate_texture(desc, data);
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(id, gpu);
        TextureHandle(id)
    }

    fn attachment_descriptor(spec: &FramebufferSpec, index: usize, format: TextureFormat) -> TextureDescriptor {
        TextureDescriptor {
            label: Some(format!("{} Attachment {index}", spec.label)),
            width: spec.width,
            height: spec.height,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_SRC
                | TextureUsage::COPY_DST,
        }
    }

    fn create_shader_layouts(
        &self,
        desc: &ShaderDescriptor,
    ) -> (wgpu::BindGroupLayout, wgpu::BindGroupLayout, wgpu::BindGroupLayout, wgpu::PipelineLayout) {
        let visibility = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;

        let globals_entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .uniform_buffers
            .iter()
            .map(|u| wgpu::BindGroupLayoutEntry {
                binding: u.binding,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(u.size),
                },
                count: None,
            })
            .collect();

        let params_entries: Vec<wgpu::BindGroupLayoutEntry> = NonZeroU64::new(desc.params_size)
            .map(|size| wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: Some(size),
                },
                count: None,
            })
            .into_iter()
            .collect();

        let mut texture_entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .textures
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.unit,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: Self::convert_sample_type(slot.kind),
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        texture_entries.push(wgpu::BindGroupLayoutEntry {
            binding: SAMPLER_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });

        let globals = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Globals Layout"),
                entries: &globals_entries,
            });
        let params = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Params Layout"),
                entries: &params_entries,
            });
        let textures = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Textures Layout"),
                entries: &texture_entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&desc.label),
                bind_group_layouts: &[&globals, &params, &textures],
                push_constant_ranges: &[],
            });

        (globals, params, textures, pipeline_layout)
    }

    fn compile_module(&self, label: &str, source: &str) -> BackendResult<wgpu::ShaderModule> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(BackendError::ShaderCreationFailed(format!("{label}: {error}"))),
            None => Ok(module),
        }
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) {
        if self.pipelines.contains_key(key) {
            return;
        }
        let Some(shader) = self.shaders.get(&key.shader) else {
            return;
        };

        let attributes: Vec<wgpu::VertexAttribute> = Vertex::ATTRIBUTES
            .iter()
            .map(|&(location, offset, components)| wgpu::VertexAttribute {
                format: Self::vertex_format(components),
                offset,
                shader_location: location,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(*format),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format: Self::convert_texture_format(format),
            depth_write_enabled: key.depth.test_enabled,
            depth_compare: if key.depth.test_enabled {
                Self::convert_compare_function(key.depth.compare)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&shader.desc.label),
                layout: Some(&shader.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader.module,
                    entry_point: "vs_main",
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: Vertex::STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: shader.desc.has_fragment.then(|| wgpu::FragmentState {
                    module: &shader.module,
                    entry_point: "fs_main",
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        log::debug!(
            "Created pipeline for {} ({} color targets)",
            shader.desc.label,
            key.colors.len()
        );
        self.pipelines.insert(key.clone(), pipeline);
    }

    /// Make room for `total` bytes of parameters in the current ring buffer
    fn reserve_params(&mut self, total: u64) {
        if self.params_cursor + total <= self.params_capacity {
            return;
        }
        // Earlier passes keep the old buffer alive through their bind groups
        let capacity = (self.params_capacity * 2).max(total.next_power_of_two());
        self.params_buffer = Self::create_params_buffer(&self.device, capacity);
        self.params_capacity = capacity;
        self.params_cursor = 0;
        log::debug!("Grew shader params ring to {capacity} bytes");
    }

    fn align_params(&self, size: u64) -> u64 {
        size.div_ceil(self.params_alignment) * self.params_alignment
    }

    fn prepare_draw(&self, draw: &PendingDraw, key: PipelineKey, params_offset: Option<u32>) -> Option<PreparedDraw> {
        let shader = self.shaders.get(&draw.shader.0)?;

        let mut globals_entries = Vec::with_capacity(shader.desc.uniform_buffers.len());
        for declared in &shader.desc.uniform_buffers {
            let Some(buffer) = self
                .uniform_buffers
                .values()
                .find(|b| b.binding == declared.binding)
            else {
                log::warn!(
                    "Shader {} needs a uniform buffer at binding {}; skipping draw",
                    shader.desc.label,
                    declared.binding
                );
                return None;
            };
            globals_entries.push(wgpu::BindGroupEntry {
                binding: declared.binding,
                resource: buffer.buffer.as_entire_binding(),
            });
        }
        let globals = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Globals"),
            layout: &shader.globals_layout,
            entries: &globals_entries,
        });

        let params_entries: Vec<wgpu::BindGroupEntry> = NonZeroU64::new(shader.desc.params_size)
            .map(|size| wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.params_buffer,
                    offset: 0,
                    size: Some(size),
                }),
            })
            .into_iter()
            .collect();
        let params = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Params"),
            layout: &shader.params_layout,
            entries: &params_entries,
        });

        let mut texture_entries = Vec::with_capacity(shader.desc.textures.len() + 1);
        for slot in &shader.desc.textures {
            let bound = draw
                .textures
                .get(&slot.unit)
                .and_then(|h| self.textures.get(&h.0))
                .filter(|t| Self::slot_accepts(slot.kind, t.desc.format));
            let view = match bound {
                Some(texture) => &texture.view,
                None => &self.textures.get(&self.fallback_for(slot.kind).0)?.view,
            };
            texture_entries.push(wgpu::BindGroupEntry {
                binding: slot.unit,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        texture_entries.push(wgpu::BindGroupEntry {
            binding: SAMPLER_BINDING,
            resource: wgpu::BindingResource::Sampler(&self.sampler),
        });
        let textures = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Textures"),
            layout: &shader.textures_layout,
            entries: &texture_entries,
        });

        Some(PreparedDraw {
            key,
            mesh: draw.mesh,
            globals,
            params,
            params_offset,
            textures,
        })
    }

    /// Replay the pending pass into the frame encoder
    fn flush_pass(&mut self) {
        let Some(pass) = self.pending_pass.take() else {
            return;
        };
        if pass.is_empty() {
            return;
        }
        let Some(framebuffer) = self.framebuffers.get(&pass.framebuffer.0) else {
            return;
        };
        let colors = framebuffer.spec.color_formats();
        let depth_format = framebuffer.spec.depth_format();
        let color_handles = framebuffer.colors.clone();
        let depth_handle = framebuffer.depth;
        let label = framebuffer.spec.label.clone();

        let keys: Vec<PipelineKey> = pass
            .draws
            .iter()
            .map(|draw| PipelineKey {
                shader: draw.shader.0,
                generation: self.shaders.get(&draw.shader.0).map_or(0, |s| s.generation),
                colors: colors.clone(),
                depth_format,
                depth: draw.depth,
            })
            .collect();
        for key in &keys {
            self.ensure_pipeline(key);
        }

        // Upload every parameter block of this pass into one ring region
        let total: u64 = pass
            .draws
            .iter()
            .map(|d| self.align_params(d.params.len() as u64))
            .sum();
        self.reserve_params(total);
        let mut offsets = Vec::with_capacity(pass.draws.len());
        for draw in &pass.draws {
            if draw.params.is_empty() {
                offsets.push(None);
                continue;
            }
            let offset = self.params_cursor;
            self.queue.write_buffer(&self.params_buffer, offset, &draw.params);
            self.params_cursor += self.align_params(draw.params.len() as u64);
            offsets.push(Some(offset as u32));
        }

        let prepared: Vec<PreparedDraw> = pass
            .draws
            .iter()
            .zip(keys)
            .zip(offsets)
            .filter_map(|((draw, key), offset)| self.prepare_draw(draw, key, offset))
            .collect();

        let Some(mut encoder) = self.encoder.take() else {
            return;
        };

        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_handles
                .iter()
                .zip(&pass.color_clears)
                .map(|(handle, clear)| {
                    let texture = self.textures.get(&handle.0)?;
                    Some(wgpu::RenderPassColorAttachment {
                        view: &texture.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: match clear {
                                Some(color) => wgpu::LoadOp::Clear(*color),
                                None => wgpu::LoadOp::Load,
                            },
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();

            let depth_attachment = depth_handle
                .and_then(|h| self.textures.get(&h.0))
                .map(|texture| wgpu::RenderPassDepthStencilAttachment {
                    view: &texture.view,
                    depth_ops: Some(wgpu::Operations {
                        load: match pass.depth_clear {
                            Some(depth) => wgpu::LoadOp::Clear(depth),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                });

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&label),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &prepared {
                let (Some(pipeline), Some(mesh)) =
                    (self.pipelines.get(&draw.key), self.meshes.get(&draw.mesh.0))
                else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &draw.globals, &[]);
                match draw.params_offset {
                    Some(offset) => render_pass.set_bind_group(1, &draw.params, &[offset]),
                    None => render_pass.set_bind_group(1, &draw.params, &[]),
                }
                render_pass.set_bind_group(2, &draw.textures, &[]);
                render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                render_pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                render_pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
        }

        self.encoder = Some(encoder);
    }

    /// Pending pass that a clear may still fold into its load operations
    fn pass_for_clear(&mut self) -> Option<&mut PendingPass> {
        let reopen = self
            .pending_pass
            .as_ref()
            .filter(|p| !p.draws.is_empty())
            .map(|p| (p.framebuffer, p.color_clears.len()));
        if let Some((framebuffer, color_count)) = reopen {
            self.flush_pass();
            self.pending_pass = Some(PendingPass::new(framebuffer, color_count));
        }
        self.pending_pass.as_mut()
    }

    /// Copy an RGBA8 texture back to the CPU, tightly packed
    pub fn read_texture_rgba8(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>> {
        self.submit();

        let gpu = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{texture:?}")))?;
        if !matches!(
            gpu.desc.format,
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb
        ) {
            return Err(BackendError::InvalidHandle(format!(
                "{texture:?} is {:?}, not RGBA8",
                gpu.desc.format
            )));
        }

        let (width, height) = (gpu.desc.width, gpu.desc.height);
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &gpu.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::DeviceLost)?
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in 0..height as usize {
                let start = row * padded as usize;
                pixels.extend_from_slice(&data[start..start + unpadded as usize]);
            }
        }
        buffer.unmap();
        Ok(pixels)
    }

    /// Get the wgpu device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get the wgpu queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn max_texture_dimension(&self) -> u32 {
        self.device
            .limits()
            .max_texture_dimension_2d
            .min(MAX_FRAMEBUFFER_SIZE)
    }

    fn create_framebuffer(&mut self, spec: &FramebufferSpec) -> BackendResult<FramebufferHandle> {
        self.check_size(spec.width, spec.height)
            .map_err(|e| BackendError::FramebufferCreationFailed(format!("{}: {e}", spec.label)))?;
        if spec.attachments.iter().filter(|f| f.is_depth()).count() > 1 {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "{}: more than one depth attachment",
                spec.label
            )));
        }

        let mut colors = Vec::new();
        let mut depth = None;
        for (index, format) in spec.attachments.iter().enumerate() {
            let desc = Self::attachment_descriptor(spec, index, *format);
            let handle = self.insert_texture(&desc, None);
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
            GpuFramebuffer {
                spec: spec.clone(),
                colors,
                depth,
            },
        );

        log::debug!("Created framebuffer {} {}x{}", spec.label, spec.width, spec.height);
        Ok(FramebufferHandle(id))
    }

    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        self.check_size(width, height)
            .map_err(BackendError::FramebufferCreationFailed)?;
        if self
            .pending_pass
            .as_ref()
            .is_some_and(|p| p.framebuffer == framebuffer)
        {
            self.flush_pass();
        }

        let fb = self
            .framebuffers
            .get(&framebuffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{framebuffer:?}")))?;
        let mut spec = fb.spec.clone();
        spec.width = width;
        spec.height = height;
        let mut colors = fb.colors.clone().into_iter();
        let handles: Vec<(usize, TextureFormat, Option<TextureHandle>)> = spec
            .attachments
            .iter()
            .enumerate()
            .map(|(index, format)| {
                let handle = if format.is_depth() { fb.depth } else { colors.next() };
                (index, *format, handle)
            })
            .collect();

        // Build the complete new set before touching the old one
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let mut replacements = Vec::with_capacity(handles.len());
        for (index, format, handle) in handles {
            let Some(handle) = handle else { continue };
            let desc = Self::attachment_descriptor(&spec, index, format);
            replacements.push((handle, self.allocate_texture(&desc, None)));
        }
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            log::error!("Out of memory resizing {} to {width}x{height}", spec.label);
            return Err(BackendError::OutOfMemory);
        }

        for (handle, texture) in replacements {
            if let Some(old) = self.textures.insert(handle.0, texture) {
                old.texture.destroy();
            }
        }
        if let Some(fb) = self.framebuffers.get_mut(&framebuffer.0) {
            fb.spec = spec;
        }

        log::debug!("Resized framebuffer {framebuffer:?} to {width}x{height}");
        Ok(())
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self
            .pending_pass
            .as_ref()
            .is_some_and(|p| p.framebuffer == framebuffer)
        {
            self.flush_pass();
        }
        let Some(fb) = self.framebuffers.remove(&framebuffer.0) else {
            log::warn!("destroy_framebuffer: unknown {framebuffer:?}");
            return;
        };
        for handle in fb.colors.into_iter().chain(fb.depth) {
            self.destroy_texture(handle);
        }
        log::debug!("Destroyed framebuffer {}", fb.spec.label);
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
        self.flush_pass();
        let Some(fb) = self.framebuffers.get(&framebuffer.0) else {
            log::warn!("bind_framebuffer: unknown {framebuffer:?}");
            return;
        };
        self.pending_pass = Some(PendingPass::new(framebuffer, fb.colors.len()));
    }

    fn unbind_framebuffer(&mut self) {
        self.flush_pass();
    }

    fn clear(&mut self, color: [f32; 4], depth: f32) {
        let Some(pass) = self.pass_for_clear() else {
            log::warn!("clear called with no framebuffer bound");
            return;
        };
        let clear = wgpu::Color {
            r: color[0] as f64,
            g: color[1] as f64,
            b: color[2] as f64,
            a: color[3] as f64,
        };
        pass.color_clears.iter_mut().for_each(|c| *c = Some(clear));
        pass.depth_clear = Some(depth);
    }

    fn clear_attachment(&mut self, index: usize, value: ClearValue) {
        let Some(pass) = self.pass_for_clear() else {
            log::warn!("clear_attachment called with no framebuffer bound");
            return;
        };
        match value {
            ClearValue::Depth(depth) => pass.depth_clear = Some(depth),
            ClearValue::Color(color) => {
                if let Some(slot) = pass.color_clears.get_mut(index) {
                    *slot = Some(wgpu::Color {
                        r: color[0] as f64,
                        g: color[1] as f64,
                        b: color[2] as f64,
                        a: color[3] as f64,
                    });
                }
            }
            ClearValue::Int(value) => {
                if let Some(slot) = pass.color_clears.get_mut(index) {
                    *slot = Some(wgpu::Color {
                        r: value as f64,
                        g: 0.0,
                        b: 0.0,
                        a: 0.0,
                    });
                }
            }
        }
    }

    fn blit_depth(&mut self, source: FramebufferHandle, destination: FramebufferHandle) {
        let reopen = self
            .pending_pass
            .as_ref()
            .map(|p| (p.framebuffer, p.color_clears.len()));
        self.flush_pass();

        let (Some(src), Some(dst)) = (
            self.depth_attachment(source).and_then(|h| self.textures.get(&h.0)),
            self.depth_attachment(destination).and_then(|h| self.textures.get(&h.0)),
        ) else {
            log::warn!("blit_depth: {source:?} or {destination:?} has no depth attachment");
            return;
        };
        if (src.desc.width, src.desc.height) != (dst.desc.width, dst.desc.height) {
            log::warn!("blit_depth: size mismatch between {source:?} and {destination:?}");
            return;
        }

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.copy_texture_to_texture(
                wgpu::ImageCopyTexture {
                    texture: &src.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyTexture {
                    texture: &dst.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: src.desc.width,
                    height: src.desc.height,
                    depth_or_array_layers: 1,
                },
            );
        }

        if let Some((framebuffer, color_count)) = reopen {
            self.pending_pass = Some(PendingPass::new(framebuffer, color_count));
        }
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.depth.test_enabled = enabled;
    }

    fn set_depth_compare(&mut self, compare: CompareFunction) {
        self.depth.compare = compare;
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor, source: &str) -> BackendResult<ShaderHandle> {
        let module = self.compile_module(&desc.label, source)?;
        let (globals_layout, params_layout, textures_layout, pipeline_layout) =
            self.create_shader_layouts(desc);

        let id = self.next_shader_id;
        self.next_shader_id += 1;
        self.shaders.insert(
            id,
            GpuShader {
                desc: desc.clone(),
                module,
                globals_layout,
                params_layout,
                textures_layout,
                pipeline_layout,
                params: vec![0; desc.params_size as usize],
                generation: 0,
            },
        );

        Ok(ShaderHandle(id))
    }

    fn reload_shader(&mut self, shader: ShaderHandle, source: &str) -> BackendResult<()> {
        let label = self
            .shaders
            .get(&shader.0)
            .map(|s| s.desc.label.clone())
            .ok_or_else(|| BackendError::InvalidHandle(format!("{shader:?}")))?;
        let module = self.compile_module(&label, source)?;

        if let Some(gpu) = self.shaders.get_mut(&shader.0) {
            gpu.module = module;
            gpu.generation += 1;
        }
        self.pipelines.retain(|key, _| key.shader != shader.0);
        Ok(())
    }

    fn bind_shader(&mut self, shader: ShaderHandle) {
        self.bound_shader = Some(shader);
    }

    fn set_shader_params(&mut self, shader: ShaderHandle, data: &[u8]) {
        let Some(gpu) = self.shaders.get_mut(&shader.0) else {
            log::warn!("set_shader_params: unknown {shader:?}");
            return;
        };
        if data.len() as u64 != gpu.desc.params_size {
            log::warn!(
                "Shader {} expects {} parameter bytes, got {}",
                gpu.desc.label,
                gpu.desc.params_size,
                data.len()
            );
            return;
        }
        gpu.params.clear();
        gpu.params.extend_from_slice(data);
    }

    fn create_uniform_buffer(
        &mut self,
        label: &str,
        size: u64,
        binding: u32,
    ) -> BackendResult<UniformBufferHandle> {
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

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.uniform_buffers.insert(
            id,
            GpuUniformBuffer {
                buffer,
                binding,
                size,
            },
        );

        Ok(UniformBufferHandle(id))
    }

    fn write_uniform_buffer(&mut self, buffer: UniformBufferHandle, data: &[u8]) {
        let Some(gpu) = self.uniform_buffers.get(&buffer.0) else {
            log::warn!("write_uniform_buffer: unknown {buffer:?}");
            return;
        };
        if data.len() as u64 != gpu.size {
            log::warn!(
                "Uniform buffer at binding {} is {} bytes, got {}",
                gpu.binding,
                gpu.size,
                data.len()
            );
            return;
        }
        self.queue.write_buffer(&gpu.buffer, 0, data);
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
        if indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Err(BackendError::BufferCreationFailed(format!(
                "{label}: index out of range"
            )));
        }

        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::INDEX,
            });

        let id = self.next_mesh_id;
        self.next_mesh_id += 1;
        self.meshes.insert(
            id,
            GpuMesh {
                vertex_buffer,
                index_buffer,
                index_count: indices.len() as u32,
            },
        );

        Ok(MeshHandle(id))
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        let Some(shader) = self.bound_shader else {
            log::warn!("draw_mesh called with no shader bound");
            return;
        };
        let Some(params) = self.shaders.get(&shader.0).map(|s| s.params.clone()) else {
            return;
        };
        let textures = self.bound_textures.clone();
        let depth = self.depth;

        let Some(pass) = self.pending_pass.as_mut() else {
            log::warn!("draw_mesh called with no framebuffer bound");
            return;
        };
        pass.draws.push(PendingDraw {
            shader,
            mesh,
            params,
            textures,
            depth,
        });
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        if let Some(gpu) = self.meshes.remove(&mesh.0) {
            gpu.vertex_buffer.destroy();
            gpu.index_buffer.destroy();
        }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle> {
        self.check_size(desc.width, desc.height)
            .map_err(BackendError::TextureCreationFailed)?;
        if let Some(data) = data {
            if data.len() != desc.data_size() {
                return Err(BackendError::TextureCreationFailed(format!(
                    "expected {} bytes of texel data, got {}",
                    desc.data_size(),
                    data.len()
                )));
            }
        }
        Ok(self.insert_texture(desc, data))
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) {
        self.bound_textures.insert(unit, texture);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.bound_textures.retain(|_, t| *t != texture);
        if let Some(gpu) = self.textures.remove(&texture.0) {
            gpu.texture.destroy();
        }
    }

    fn submit(&mut self) {
        self.flush_pass();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
        self.params_cursor = 0;
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Frame Encoder"),
                }),
        );
    }
}
