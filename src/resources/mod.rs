//! Resource management
//!
//! Handles loading of meshes, textures, materials and HDR environments.

mod environment;
mod material;
mod mesh;
mod texture;

pub use environment::*;
pub use material::*;
pub use mesh::*;
pub use texture::*;
