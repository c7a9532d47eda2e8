//! Typed shader programs
//!
//! Every shader declares its per-draw parameter block as a `#[repr(C)]` Rust
//! struct implementing [`ShaderParameters`]. The field list is checked against
//! the WGSL uniform struct at `@group(1) @binding(0)` when the shader is loaded
//! or reloaded, so a renamed or retyped field fails loudly instead of being
//! silently ignored. Setting parameters is then type-checked by the compiler.

pub mod reflect;

use crate::backend::{BackendError, GraphicsBackend, ShaderDescriptor, ShaderHandle};
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use thiserror::Error;

/// Shader loading error
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("Failed to read shader source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse shader {label}:\n{message}")]
    Parse { label: String, message: String },
    #[error("Shader {label} failed validation:\n{message}")]
    Validation { label: String, message: String },
    #[error("Shader {label} does not match its declared interface: {message}")]
    Interface { label: String, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Types a parameter block may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Float,
    Int,
    Vec4,
    Mat4,
}

impl ParamType {
    pub fn size(&self) -> u32 {
        match self {
            ParamType::Float | ParamType::Int => 4,
            ParamType::Vec4 => 16,
            ParamType::Mat4 => 64,
        }
    }
}

/// One named member of a parameter block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamField {
    pub name: &'static str,
    pub ty: ParamType,
    pub offset: u32,
}

impl ParamField {
    pub const fn new(name: &'static str, ty: ParamType, offset: usize) -> Self {
        Self {
            name,
            ty,
            offset: offset as u32,
        }
    }
}

/// A per-draw parameter block with a declared layout
pub trait ShaderParameters: Pod {
    /// Members in declaration order, including padding members
    const FIELDS: &'static [ParamField];
}

/// A compiled shader whose parameter block is `P`
pub struct Shader<P: ShaderParameters> {
    handle: ShaderHandle,
    descriptor: ShaderDescriptor,
    _params: PhantomData<P>,
}

impl<P: ShaderParameters> Clone for Shader<P> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            descriptor: self.descriptor.clone(),
            _params: PhantomData,
        }
    }
}

impl<P: ShaderParameters> fmt::Debug for Shader<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("label", &self.descriptor.label)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<P: ShaderParameters> Shader<P> {
    /// Read, validate and compile the shader
    pub fn load<B: GraphicsBackend>(
        backend: &mut B,
        mut descriptor: ShaderDescriptor,
    ) -> Result<Self, ShaderError> {
        descriptor.params_size = std::mem::size_of::<P>() as u64;
        let source = read_source(&descriptor)?;
        reflect::validate::<P>(&descriptor, &source)?;
        let handle = backend.create_shader(&descriptor, &source)?;

        log::info!(
            "Loaded shader {} ({})",
            descriptor.label,
            descriptor
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "embedded".to_string())
        );

        Ok(Self {
            handle,
            descriptor,
            _params: PhantomData,
        })
    }

    /// Re-read and recompile in place. The handle is unchanged; on error the
    /// previously compiled program stays active.
    pub fn reload<B: GraphicsBackend>(&self, backend: &mut B) -> Result<(), ShaderError> {
        let source = read_source(&self.descriptor)?;
        reflect::validate::<P>(&self.descriptor, &source)?;
        backend.reload_shader(self.handle, &source)?;
        log::info!("Reloaded shader {}", self.descriptor.label);
        Ok(())
    }

    pub fn bind<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.bind_shader(self.handle);
    }

    pub fn set_params<B: GraphicsBackend>(&self, backend: &mut B, params: &P) {
        backend.set_shader_params(self.handle, bytemuck::bytes_of(params));
    }

    pub fn handle(&self) -> ShaderHandle {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.descriptor.label
    }

    pub fn descriptor(&self) -> &ShaderDescriptor {
        &self.descriptor
    }
}

fn read_source(descriptor: &ShaderDescriptor) -> Result<String, ShaderError> {
    match &descriptor.path {
        Some(path) => std::fs::read_to_string(path).map_err(|source| ShaderError::Io {
            path: path.clone(),
            source,
        }),
        None => Ok(descriptor.source.to_string()),
    }
}
