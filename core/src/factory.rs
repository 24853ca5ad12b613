//! Construction of the first generation of a track.
use rand::Rng;

use crate::MotionIncrement;
use crate::floor_map::FloorMap;
use crate::particle::{Particle, ParticleCollection};
use crate::wrap_to_pi;

/// Seeds a swarm uniformly over the walkable area of a floor.
///
/// Used when a track has no persisted generation yet, and by the engine to recover from a
/// degenerate update in which every particle was filtered out.
#[derive(Clone, Copy, Debug)]
pub struct ParticleCollectionFactory {
    pub num_particles: usize,
    /// Half-width of the uniform heading jitter (radians).
    pub heading_jitter: f64,
}

impl ParticleCollectionFactory {
    pub fn new(num_particles: usize, heading_jitter: f64) -> Self {
        assert!(num_particles > 0, "Number of particles must be positive");
        assert!(
            heading_jitter >= 0.0,
            "Heading jitter must be non-negative"
        );
        ParticleCollectionFactory {
            num_particles,
            heading_jitter,
        }
    }

    /// Build `num_particles` particles with weight `1/N`.
    ///
    /// Positions are rejection-sampled against [`FloorMap::is_walkable`]; headings start at the
    /// heading change of the initial step plus a uniform jitter in `[-heading_jitter,
    /// heading_jitter]`.
    pub fn create<R: Rng + ?Sized>(
        &self,
        floor_map: &FloorMap,
        initial_motion: &MotionIncrement,
        rng: &mut R,
    ) -> ParticleCollection {
        let weight = 1.0 / self.num_particles as f64;
        (0..self.num_particles)
            .map(|_| {
                let position = floor_map.random_walkable_point(rng);
                let jitter = if self.heading_jitter > 0.0 {
                    rng.random_range(-self.heading_jitter..=self.heading_jitter)
                } else {
                    0.0
                };
                Particle::new(
                    position,
                    wrap_to_pi(initial_motion.heading_delta + jitter),
                    weight,
                )
            })
            .collect()
    }
}
