//! WGSL interface checks
//!
//! Parses a shader with naga and compares the resources it declares with the
//! [`ShaderDescriptor`] and parameter block the Rust side will bind.

use super::{ParamType, ShaderError, ShaderParameters};
use crate::backend::{ShaderDescriptor, TextureKind, SAMPLER_BINDING};
use naga::{AddressSpace, GlobalVariable, ImageClass, ScalarKind, ShaderStage, TypeInner, VectorSize};

const GLOBALS_GROUP: u32 = 0;
const PARAMS_GROUP: u32 = 1;
const TEXTURE_GROUP: u32 = 2;

/// Parse and validate `source`, then check it against `descriptor` and `P`
pub fn validate<P: ShaderParameters>(
    descriptor: &ShaderDescriptor,
    source: &str,
) -> Result<(), ShaderError> {
    let label = descriptor.label.as_str();
    let module = parse(label, source)?;

    check_entry_points(label, &module, descriptor.has_fragment)?;
    check_params::<P>(label, &module)?;
    check_uniform_buffers(label, &module, descriptor)?;
    check_textures(label, &module, descriptor)?;
    Ok(())
}

/// Parse and run naga's validator
pub fn parse(label: &str, source: &str) -> Result<naga::Module, ShaderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| ShaderError::Parse {
        label: label.to_string(),
        message: e.emit_to_string(source),
    })?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| ShaderError::Validation {
        label: label.to_string(),
        message: e.emit_to_string(source),
    })?;

    Ok(module)
}

fn interface_error(label: &str, message: String) -> ShaderError {
    ShaderError::Interface {
        label: label.to_string(),
        message,
    }
}

fn find_global(module: &naga::Module, group: u32, binding: u32) -> Option<&GlobalVariable> {
    module
        .global_variables
        .iter()
        .map(|(_, var)| var)
        .find(|var| {
            var.binding
                .as_ref()
                .is_some_and(|b| b.group == group && b.binding == binding)
        })
}

fn check_entry_points(
    label: &str,
    module: &naga::Module,
    has_fragment: bool,
) -> Result<(), ShaderError> {
    let has = |name: &str, stage: ShaderStage| {
        module
            .entry_points
            .iter()
            .any(|ep| ep.name == name && ep.stage == stage)
    };

    if !has("vs_main", ShaderStage::Vertex) {
        return Err(interface_error(label, "missing vertex entry point vs_main".into()));
    }
    if has_fragment && !has("fs_main", ShaderStage::Fragment) {
        return Err(interface_error(label, "missing fragment entry point fs_main".into()));
    }
    Ok(())
}

fn member_matches(inner: &TypeInner, ty: ParamType) -> bool {
    match (ty, inner) {
        (ParamType::Float, TypeInner::Scalar(s)) => s.kind == ScalarKind::Float && s.width == 4,
        (ParamType::Int, TypeInner::Scalar(s)) => s.kind == ScalarKind::Sint && s.width == 4,
        (
            ParamType::Vec4,
            TypeInner::Vector {
                size: VectorSize::Quad,
                scalar,
            },
        ) => scalar.kind == ScalarKind::Float && scalar.width == 4,
        (
            ParamType::Mat4,
            TypeInner::Matrix {
                columns: VectorSize::Quad,
                rows: VectorSize::Quad,
                scalar,
            },
        ) => scalar.width == 4,
        _ => false,
    }
}

fn check_params<P: ShaderParameters>(label: &str, module: &naga::Module) -> Result<(), ShaderError> {
    let Some(var) = find_global(module, PARAMS_GROUP, 0) else {
        if P::FIELDS.is_empty() {
            return Ok(());
        }
        return Err(interface_error(
            label,
            "no parameter block at @group(1) @binding(0)".into(),
        ));
    };

    if var.space != AddressSpace::Uniform {
        return Err(interface_error(label, "parameter block is not a uniform".into()));
    }

    let TypeInner::Struct { members, span } = &module.types[var.ty].inner else {
        return Err(interface_error(label, "parameter block is not a struct".into()));
    };

    let rust_size = std::mem::size_of::<P>() as u32;
    if *span != rust_size {
        return Err(interface_error(
            label,
            format!("parameter block is {span} bytes in WGSL but {rust_size} in Rust"),
        ));
    }

    if members.len() != P::FIELDS.len() {
        return Err(interface_error(
            label,
            format!(
                "parameter block has {} members in WGSL but {} in Rust",
                members.len(),
                P::FIELDS.len()
            ),
        ));
    }

    for (member, field) in members.iter().zip(P::FIELDS) {
        let name = member.name.as_deref().unwrap_or("");
        if name != field.name {
            return Err(interface_error(
                label,
                format!("expected member {} but found {name}", field.name),
            ));
        }
        if member.offset != field.offset {
            return Err(interface_error(
                label,
                format!(
                    "member {name} is at offset {} in WGSL but {} in Rust",
                    member.offset, field.offset
                ),
            ));
        }
        if !member_matches(&module.types[member.ty].inner, field.ty) {
            return Err(interface_error(
                label,
                format!("member {name} is not a {:?}", field.ty),
            ));
        }
    }

    Ok(())
}

fn check_uniform_buffers(
    label: &str,
    module: &naga::Module,
    descriptor: &ShaderDescriptor,
) -> Result<(), ShaderError> {
    let gctx = module.to_ctx();

    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else { continue };
        if binding.group != GLOBALS_GROUP {
            continue;
        }

        let Some(declared) = descriptor
            .uniform_buffers
            .iter()
            .find(|u| u.binding == binding.binding)
        else {
            return Err(interface_error(
                label,
                format!("uniform binding {} is not provided", binding.binding),
            ));
        };

        if var.space != AddressSpace::Uniform {
            return Err(interface_error(
                label,
                format!("binding {} in group 0 is not a uniform", binding.binding),
            ));
        }

        let size = module.types[var.ty].inner.size(gctx) as u64;
        if size != declared.size {
            return Err(interface_error(
                label,
                format!(
                    "uniform binding {} is {size} bytes in WGSL but {} in Rust",
                    binding.binding, declared.size
                ),
            ));
        }
    }

    Ok(())
}

fn check_textures(
    label: &str,
    module: &naga::Module,
    descriptor: &ShaderDescriptor,
) -> Result<(), ShaderError> {
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else { continue };
        if binding.group != TEXTURE_GROUP {
            continue;
        }

        let inner = &module.types[var.ty].inner;

        if binding.binding == SAMPLER_BINDING {
            if !matches!(inner, TypeInner::Sampler { comparison: false }) {
                return Err(interface_error(
                    label,
                    format!("binding {SAMPLER_BINDING} in group 2 must be a sampler"),
                ));
            }
            continue;
        }

        let Some(slot) = descriptor.textures.iter().find(|t| t.unit == binding.binding) else {
            return Err(interface_error(
                label,
                format!("texture unit {} is not declared", binding.binding),
            ));
        };

        let TypeInner::Image { class, .. } = inner else {
            return Err(interface_error(
                label,
                format!("texture unit {} ({}) is not a texture", slot.unit, slot.name),
            ));
        };

        let compatible = match (class, slot.kind) {
            (ImageClass::Sampled { kind: ScalarKind::Float, .. }, TextureKind::Float)
            | (ImageClass::Sampled { kind: ScalarKind::Float, .. }, TextureKind::UnfilterableFloat)
            | (ImageClass::Sampled { kind: ScalarKind::Sint, .. }, TextureKind::Sint)
            | (ImageClass::Depth { .. }, TextureKind::Depth) => true,
            _ => false,
        };

        if !compatible {
            return Err(interface_error(
                label,
                format!(
                    "texture unit {} ({}) does not match declared kind {:?}",
                    slot.unit, slot.name, slot.kind
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureSlot;
    use crate::shader::ParamField;
    use bytemuck::{Pod, Zeroable};
    use std::mem::offset_of;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct ScaleParams {
        scale: f32,
        mode: i32,
        _pad0: f32,
        _pad1: f32,
    }

    impl ShaderParameters for ScaleParams {
        const FIELDS: &'static [ParamField] = &[
            ParamField::new("scale", ParamType::Float, offset_of!(ScaleParams, scale)),
            ParamField::new("mode", ParamType::Int, offset_of!(ScaleParams, mode)),
            ParamField::new("_pad0", ParamType::Float, offset_of!(ScaleParams, _pad0)),
            ParamField::new("_pad1", ParamType::Float, offset_of!(ScaleParams, _pad1)),
        ];
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct NoParams {
        _unused: [f32; 4],
    }

    impl ShaderParameters for NoParams {
        const FIELDS: &'static [ParamField] = &[];
    }

    fn shader(params: &str, extra: &str, body: &str) -> String {
        format!(
            r#"
struct Params {{
{params}
}}

@group(1) @binding(0) var<uniform> params: Params;
{extra}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {{
    return vec4<f32>(position * params.scale, 1.0);
}}

@fragment
fn fs_main() -> @location(0) vec4<f32> {{
    {body}
}}
"#
        )
    }

    const MATCHING_PARAMS: &str = "    scale: f32,\n    mode: i32,\n    _pad0: f32,\n    _pad1: f32,";

    #[test]
    fn test_matching_params() {
        let src = shader(MATCHING_PARAMS, "", "return vec4<f32>(1.0);");
        validate::<ScaleParams>(&ShaderDescriptor::new("scale", ""), &src).unwrap();
    }

    #[test]
    fn test_renamed_member_rejected() {
        let src = shader(
            "    scale: f32,\n    kind: i32,\n    _pad0: f32,\n    _pad1: f32,",
            "",
            "return vec4<f32>(1.0);",
        );
        let err = validate::<ScaleParams>(&ShaderDescriptor::new("scale", ""), &src).unwrap_err();
        assert!(matches!(err, ShaderError::Interface { .. }));
    }

    #[test]
    fn test_retyped_member_rejected() {
        let src = shader(
            "    scale: f32,\n    mode: f32,\n    _pad0: f32,\n    _pad1: f32,",
            "",
            "return vec4<f32>(1.0);",
        );
        let err = validate::<ScaleParams>(&ShaderDescriptor::new("scale", ""), &src).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let src = shader("    scale: f32,\n    mode: i32,", "", "return vec4<f32>(1.0);");
        let err = validate::<ScaleParams>(&ShaderDescriptor::new("scale", ""), &src).unwrap_err();
        assert!(err.to_string().contains("bytes"));
    }

    #[test]
    fn test_missing_params_block() {
        let src = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 1.0);
}
"#;
        let desc = ShaderDescriptor::new("bare", "").depth_only();
        validate::<NoParams>(&desc, src).unwrap();
        assert!(validate::<ScaleParams>(&desc, src).is_err());
    }

    #[test]
    fn test_missing_fragment_entry() {
        let src = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 1.0);
}
"#;
        let err = validate::<NoParams>(&ShaderDescriptor::new("bare", ""), src).unwrap_err();
        assert!(err.to_string().contains("fs_main"));
    }

    #[test]
    fn test_texture_kind_checked() {
        let extra = "@group(2) @binding(0) var albedo_map: texture_2d<f32>;\n\
                     @group(2) @binding(15) var linear_sampler: sampler;";
        let body = "return textureSample(albedo_map, linear_sampler, vec2<f32>(0.5));";
        let src = shader(MATCHING_PARAMS, extra, body);

        let float_desc = ShaderDescriptor::new("textured", "")
            .with_texture(TextureSlot::new(0, "albedo_map", TextureKind::Float));
        validate::<ScaleParams>(&float_desc, &src).unwrap();

        let int_desc = ShaderDescriptor::new("textured", "")
            .with_texture(TextureSlot::new(0, "albedo_map", TextureKind::Sint));
        assert!(validate::<ScaleParams>(&int_desc, &src).is_err());

        let undeclared = ShaderDescriptor::new("textured", "");
        assert!(validate::<ScaleParams>(&undeclared, &src).is_err());
    }

    #[test]
    fn test_uniform_block_size_checked() {
        let extra = "struct Camera {\n    view_projection: mat4x4<f32>,\n    position: vec4<f32>,\n}\n\
                     @group(0) @binding(0) var<uniform> camera: Camera;";
        let body = "return camera.position;";
        let src = shader(MATCHING_PARAMS, extra, body);

        let ok = ShaderDescriptor::new("camera", "").with_uniform_buffer(0, 80);
        validate::<ScaleParams>(&ok, &src).unwrap();

        let wrong = ShaderDescriptor::new("camera", "").with_uniform_buffer(0, 64);
        assert!(validate::<ScaleParams>(&wrong, &src).is_err());

        let missing = ShaderDescriptor::new("camera", "");
        assert!(validate::<ScaleParams>(&missing, &src).is_err());
    }

    #[test]
    fn test_parse_error_reported() {
        let err = parse("broken", "fn broken( {").unwrap_err();
        assert!(matches!(err, ShaderError::Parse { .. }));
    }
}
