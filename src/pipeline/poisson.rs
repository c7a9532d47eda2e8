//! Poisson-disk sample sets for shadow filtering

use crate::backend::*;
use glam::Vec2;
use rand::Rng;

/// Samples per disk, and the width of the texture they are stored in
pub const POISSON_SAMPLE_COUNT: usize = 64;

/// Minimum distance between two samples of the unit disk
pub const POISSON_MIN_DISTANCE: f32 = 0.15;

/// Candidates tried per requested sample before giving up
const ATTEMPTS_PER_SAMPLE: usize = 100;

/// Points in the unit disk no closer than a minimum distance
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonDisk {
    samples: Vec<Vec2>,
    target: usize,
}

impl PoissonDisk {
    /// Rejection-sample up to `target` points. Generation stops when the
    /// attempt budget runs out; the accepted samples are kept.
    pub fn generate<R: Rng>(rng: &mut R, target: usize, min_distance: f32) -> Self {
        let min_distance_sq = min_distance * min_distance;
        let mut samples: Vec<Vec2> = Vec::with_capacity(target);
        let mut attempts = 0;

        while samples.len() < target && attempts < target * ATTEMPTS_PER_SAMPLE {
            attempts += 1;
            let candidate = Vec2::new(rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0));
            if candidate.length_squared() > 1.0 {
                continue;
            }
            if samples
                .iter()
                .all(|s| s.distance_squared(candidate) >= min_distance_sq)
            {
                samples.push(candidate);
            }
        }

        if samples.len() < target {
            log::warn!(
                "Poisson disk: only {} of {} samples after {} attempts",
                samples.len(),
                target,
                attempts
            );
        }

        Self { samples, target }
    }

    pub fn samples(&self) -> &[Vec2] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    /// Limit a requested sample count to what was generated
    pub fn clamp_count(&self, requested: i32) -> i32 {
        requested.clamp(0, self.samples.len() as i32)
    }

    /// `Rg32Float` texels, zero-padded to the texture width
    pub fn texel_data(&self) -> Vec<f32> {
        let mut data = vec![0.0; POISSON_SAMPLE_COUNT * 2];
        for (texel, sample) in data.chunks_exact_mut(2).zip(&self.samples) {
            texel.copy_from_slice(&sample.to_array());
        }
        data
    }

    /// Upload as a `POISSON_SAMPLE_COUNT`x1 texture
    pub fn upload<B: GraphicsBackend>(&self, backend: &mut B, label: &str) -> BackendResult<TextureHandle> {
        backend.create_texture(
            &TextureDescriptor {
                label: Some(label.to_string()),
                width: POISSON_SAMPLE_COUNT as u32,
                height: 1,
                format: TextureFormat::Rg32Float,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            },
            Some(bytemuck::cast_slice(&self.texel_data())),
        )
    }
}
