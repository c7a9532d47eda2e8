//! Post-processing effects

mod fxaa;

pub use fxaa::*;
