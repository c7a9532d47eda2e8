//! Deferred rendering pipeline
//!
//! This module implements the fixed pass sequence:
//! 1. Shadow pass - depth from the directional light
//! 2. G-Buffer pass - renders geometry to multiple render targets
//! 3. Lighting pass - fullscreen shading from the G-buffer, then the
//!    environment background
//! 4. Post-processing - optional FXAA

pub mod gbuffer_pass;
pub mod lighting_pass;
pub mod lights;
pub mod poisson;
pub mod postprocess;
pub mod shadow_pass;

pub use gbuffer_pass::{GBufferParams, GBufferPass};
pub use lighting_pass::{LightingParams, LightingPass};
pub use lights::{LightAggregator, LightStats, LightUniformBlock};
pub use poisson::PoissonDisk;
pub use postprocess::{FxaaParams, FxaaPass};
pub use shadow_pass::{ShadowFrustum, ShadowParams, ShadowPass};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Shader file override: `<dir>/<name>.wgsl`
pub(crate) fn shader_path(dir: Option<&Path>, name: &str) -> Option<PathBuf> {
    dir.map(|d| d.join(format!("{name}.wgsl")))
}

/// Tunables that may change between frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub exposure: f32,
    pub gamma: f32,
    /// PCSS when on, fixed-radius PCF when off
    pub soft_shadows: bool,
    pub pcf_samples: i32,
    pub blocker_samples: i32,
    /// Light size in world units
    pub light_size: f32,
    /// Half extent of the shadow frustum
    pub shadow_ortho_size: f32,
    pub shadow_near: f32,
    pub shadow_far: f32,
    /// Multiplier applied to every analytic light
    pub intensity: f32,
    pub env_intensity: f32,
    pub antialiasing: bool,
    pub clear_color: [f32; 4],
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            exposure: 0.5,
            gamma: 1.9,
            soft_shadows: true,
            pcf_samples: 16,
            blocker_samples: 16,
            light_size: 0.25,
            shadow_ortho_size: 20.0,
            shadow_near: 1.0,
            shadow_far: 200.0,
            intensity: 1.0,
            env_intensity: 1.0,
            antialiasing: true,
            clear_color: [0.196, 0.196, 0.196, 1.0],
        }
    }
}

impl RenderSettings {
    pub fn from_ron_str(source: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(source)
    }

    pub fn to_ron_string(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_ron_round_trip() {
        let mut settings = RenderSettings::default();
        settings.soft_shadows = false;
        settings.exposure = 1.25;

        let text = settings.to_ron_string().unwrap();
        assert_eq!(RenderSettings::from_ron_str(&text).unwrap(), settings);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let settings = RenderSettings::from_ron_str("(gamma: 2.2, antialiasing: false)").unwrap();
        assert_eq!(settings.gamma, 2.2);
        assert!(!settings.antialiasing);
        assert_eq!(settings.exposure, 0.5);
        assert_eq!(settings.pcf_samples, 16);
    }

    #[test]
    fn test_shader_path() {
        assert_eq!(shader_path(None, "fxaa"), None);
        assert_eq!(
            shader_path(Some(Path::new("/shaders")), "fxaa"),
            Some(PathBuf::from("/shaders/fxaa.wgsl"))
        );
    }
}
