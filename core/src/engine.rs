//! The per-step particle filter pipeline.
//!
//! One call to [`LocalizationEngine::update`] turns the latest generation of a track (or nothing,
//! for a new track) into the next generation. The stages run in a fixed order and each returns a
//! fresh [`ParticleCollection`], leaving its input untouched:
//!
//! 1. [`predict`](LocalizationEngine::predict): dead-reckon every particle by the step, with
//!    heading and position noise.
//! 2. [`filter_by_floor_map`](LocalizationEngine::filter_by_floor_map): drop particles that left
//!    the walkable area or crossed a wall on the way.
//! 3. [`filter_by_direction`](LocalizationEngine::filter_by_direction): drop particles whose
//!    travel direction contradicts their heading.
//! 4. [`resample`](LocalizationEngine::resample): weight survivors by wall clearance and draw a
//!    full swarm of N particles back, with replacement.
//! 5. [`estimate_position`](LocalizationEngine::estimate_position) and
//!    [`is_converged`](LocalizationEngine::is_converged).
//!
//! There is no external likelihood sensor in this model, so the resampling weight is a liveness
//! heuristic: particles with more room around them are more likely to survive the next steps.
//!
//! When the geometric filters remove every particle the update is not aborted. The swarm is
//! reseeded uniformly over the walkable area and the outcome is flagged as degenerate.
use log::{debug, warn};
use nalgebra::{Point2, Vector2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::LocalizationConfig;
use crate::error::{LocalizationError, Result};
use crate::factory::ParticleCollectionFactory;
use crate::floor_map::FloorMap;
use crate::particle::{Particle, ParticleCollection};
use crate::{MotionIncrement, wrap_to_pi};

/// Smallest resampling weight, so particles hugging a wall keep a non-zero chance.
const MIN_WEIGHT: f64 = 1e-9;
/// Displacements shorter than this carry no usable direction.
const MIN_DISPLACEMENT: f64 = 1e-12;

/// Point estimate of a swarm with its dispersion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatedPosition {
    pub point: Point2<f64>,
    /// Weighted RMS distance of the particles from `point`
    pub spread: f64,
}

/// One completed filter update of a track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Sample index within the track: 0 for the first generation, `parent + 1` afterwards.
    pub index: u64,
    pub parent: Option<u64>,
    pub particles: ParticleCollection,
    pub motion: MotionIncrement,
    pub estimate: EstimatedPosition,
    pub converged: bool,
}

/// Everything produced by one update, including the intermediate swarms for diagnostics.
#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    /// Swarm the update started from (the prior generation's particles or a fresh seed).
    pub seed: ParticleCollection,
    /// Swarm right after prediction, index-aligned with `seed`.
    pub predicted: ParticleCollection,
    pub generation: Generation,
    /// True when every particle was filtered out and the swarm had to be reseeded.
    pub degenerate: bool,
}

fn noise(std_dev: f64) -> Option<Normal<f64>> {
    if std_dev > 0.0 {
        Normal::new(0.0, std_dev).ok()
    } else {
        None
    }
}

fn sample<R: Rng + ?Sized>(distribution: &Option<Normal<f64>>, rng: &mut R) -> f64 {
    match distribution {
        Some(normal) => normal.sample(rng),
        None => 0.0,
    }
}

/// Stateless particle filter for step-based pedestrian dead reckoning.
#[derive(Clone, Debug)]
pub struct LocalizationEngine {
    config: LocalizationConfig,
    factory: ParticleCollectionFactory,
}

impl LocalizationEngine {
    pub fn new(config: LocalizationConfig) -> Result<Self> {
        config.validate()?;
        let factory =
            ParticleCollectionFactory::new(config.num_particles, config.initial_heading_jitter);
        Ok(LocalizationEngine { config, factory })
    }

    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }

    pub fn factory(&self) -> &ParticleCollectionFactory {
        &self.factory
    }

    /// Number of particles N of every completed generation.
    pub fn num_particles(&self) -> usize {
        self.config.num_particles
    }

    /// Advance every particle by one step.
    ///
    /// The new heading is the particle heading plus the step's heading change plus
    /// `N(0, heading_noise_std)`; the particle then moves `step_length` along the new heading plus
    /// `N(0, position_noise_std)` on each axis. The applied delta is recorded in
    /// [`Particle::displacement`].
    pub fn predict<R: Rng + ?Sized>(
        &self,
        collection: &ParticleCollection,
        motion: &MotionIncrement,
        rng: &mut R,
    ) -> ParticleCollection {
        let heading_noise = noise(self.config.heading_noise_std);
        let position_noise = noise(self.config.position_noise_std);
        collection
            .iter()
            .map(|particle| {
                let heading =
                    wrap_to_pi(particle.heading + motion.heading_delta + sample(&heading_noise, rng));
                let step = Vector2::new(heading.cos(), heading.sin()) * motion.step_length;
                let jitter = Vector2::new(sample(&position_noise, rng), sample(&position_noise, rng));
                let displacement = step + jitter;
                Particle {
                    position: particle.position + displacement,
                    heading,
                    weight: particle.weight,
                    displacement,
                }
            })
            .collect()
    }

    /// Keep the predicted particles that landed on walkable floor without crossing an obstacle.
    ///
    /// `prior` and `predicted` must be index-aligned, as returned by [`Self::predict`].
    pub fn filter_by_floor_map(
        &self,
        prior: &ParticleCollection,
        predicted: &ParticleCollection,
        floor_map: &FloorMap,
    ) -> ParticleCollection {
        assert_eq!(
            prior.len(),
            predicted.len(),
            "prior and predicted collections must be index-aligned"
        );
        prior
            .iter()
            .zip(predicted.iter())
            .filter(|(before, after)| {
                floor_map.is_walkable(&after.position)
                    && !floor_map.segment_blocked(&before.position, &after.position)
            })
            .map(|(_, after)| *after)
            .collect()
    }

    /// Keep the particles whose travel direction agrees with their heading.
    ///
    /// A non-zero step means the pedestrian walked forward, so a particle whose last displacement
    /// points more than `direction_tolerance` away from its own heading is inconsistent. A
    /// zero-length step filters nothing.
    pub fn filter_by_direction(
        &self,
        collection: &ParticleCollection,
        motion: &MotionIncrement,
    ) -> ParticleCollection {
        if !motion.is_moving() {
            return collection.clone();
        }
        let tolerance = self.config.direction_tolerance;
        collection.filtered(|particle| {
            let d = particle.displacement;
            if d.norm() <= MIN_DISPLACEMENT {
                return true;
            }
            wrap_to_pi(d.y.atan2(d.x) - particle.heading).abs() <= tolerance
        })
    }

    /// Weight the survivors by wall clearance and draw exactly N particles with replacement.
    ///
    /// Every copy of a particle after the first is jittered in position and heading, scaled by
    /// the step length, to keep the swarm diverse. A jittered copy that would land off the floor
    /// or behind a wall keeps its source position instead. Returned particles all weigh `1/N`.
    ///
    /// Fails with [`LocalizationError::DegenerateFilterState`] when `collection` is empty.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        collection: &ParticleCollection,
        motion: &MotionIncrement,
        floor_map: &FloorMap,
        rng: &mut R,
    ) -> Result<ParticleCollection> {
        if collection.is_empty() {
            return Err(LocalizationError::DegenerateFilterState(
                "no particle survived the floor map and direction filters".to_string(),
            ));
        }
        let n = self.config.num_particles;
        let cap = self.config.clearance_cap;
        let mut weighted: ParticleCollection = collection
            .iter()
            .map(|p| Particle {
                weight: floor_map.clearance(&p.position).min(cap).max(MIN_WEIGHT),
                ..*p
            })
            .collect();
        weighted.normalize_weights();
        let weights: Vec<f64> = weighted.iter().map(|p| p.weight).collect();
        debug!(
            "resampling {} survivors, effective size {:.1}",
            weighted.len(),
            weighted.effective_sample_size()
        );
        let indices = self.config.resampling_strategy.resample(&weights, n, rng);

        let position_jitter =
            noise(self.config.resample_position_jitter * motion.step_length);
        let heading_jitter = noise(self.config.resample_heading_jitter * motion.step_length);
        let weight = 1.0 / n as f64;
        let mut drawn = vec![false; collection.len()];
        let particles = indices
            .into_iter()
            .map(|idx| {
                let source = collection.particles()[idx];
                let mut particle = Particle { weight, ..source };
                if !drawn[idx] {
                    drawn[idx] = true;
                    return particle;
                }
                let offset = Vector2::new(
                    sample(&position_jitter, rng),
                    sample(&position_jitter, rng),
                );
                let candidate = source.position + offset;
                if floor_map.is_walkable(&candidate)
                    && !floor_map.segment_blocked(&source.position, &candidate)
                {
                    particle.position = candidate;
                    particle.displacement = source.displacement + offset;
                }
                particle.heading = wrap_to_pi(source.heading + sample(&heading_jitter, rng));
                particle
            })
            .collect();
        Ok(particles)
    }

    /// Centroid of the swarm (per the configured averaging strategy) and its RMS spread.
    pub fn estimate_position(&self, collection: &ParticleCollection) -> Result<EstimatedPosition> {
        let (point, weights) = self
            .config
            .averaging_strategy
            .centroid(collection)
            .ok_or_else(|| {
                LocalizationError::DegenerateFilterState(
                    "cannot estimate the position of an empty collection".to_string(),
                )
            })?;
        let variance: f64 = collection
            .iter()
            .zip(weights.iter())
            .map(|(p, w)| w * (p.position - point).norm_squared())
            .sum();
        Ok(EstimatedPosition {
            point,
            spread: variance.max(0.0).sqrt(),
        })
    }

    /// True when the spread of the swarm is at most `threshold`. An empty swarm never converges.
    pub fn is_converged(&self, collection: &ParticleCollection, threshold: f64) -> bool {
        self.estimate_position(collection)
            .map(|estimate| estimate.spread <= threshold)
            .unwrap_or(false)
    }

    /// Derive the next generation of a track from its latest generation.
    ///
    /// The prior generation's particles are always the seed when a prior exists; a fresh swarm is
    /// only built for the first generation of a track or to recover from a degenerate update.
    pub fn update<R: Rng + ?Sized>(
        &self,
        prior: Option<&Generation>,
        motion: &MotionIncrement,
        floor_map: &FloorMap,
        rng: &mut R,
    ) -> Result<UpdateOutcome> {
        let seed = match prior {
            Some(generation) => generation.particles.clone(),
            None => self.factory.create(floor_map, motion, rng),
        };
        let predicted = self.predict(&seed, motion, rng);
        let on_floor = self.filter_by_floor_map(&seed, &predicted, floor_map);
        let consistent = self.filter_by_direction(&on_floor, motion);
        debug!(
            "{} particles seeded, {} on the floor, {} direction-consistent",
            seed.len(),
            on_floor.len(),
            consistent.len()
        );

        let (particles, degenerate) = match self.resample(&consistent, motion, floor_map, rng) {
            Ok(particles) => (particles, false),
            Err(err @ LocalizationError::DegenerateFilterState(_)) => {
                warn!(
                    "{err}; reseeding {} particles over the walkable area",
                    self.config.num_particles
                );
                (self.factory.create(floor_map, motion, rng), true)
            }
            Err(err) => return Err(err),
        };

        let estimate = self.estimate_position(&particles)?;
        let converged = estimate.spread <= self.config.convergence_threshold;
        debug!(
            "estimate ({:.3}, {:.3}) spread {:.3} converged {}",
            estimate.point.x, estimate.point.y, estimate.spread, converged
        );
        let generation = Generation {
            index: prior.map(|g| g.index + 1).unwrap_or(0),
            parent: prior.map(|g| g.index),
            particles,
            motion: *motion,
            estimate,
            converged,
        };
        Ok(UpdateOutcome {
            seed,
            predicted,
            generation,
            degenerate,
        })
    }
}
