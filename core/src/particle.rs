//! Particle state, particle collections and resampling schemes.
use nalgebra::{Point2, Vector2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// One hypothesis of the pedestrian's pose.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub position: Point2<f64>,
    /// Heading in radians, wrapped to (-pi, pi]
    pub heading: f64,
    pub weight: f64,
    /// Position delta applied by the most recent prediction (zero for freshly seeded particles).
    #[serde(default = "zero_displacement")]
    pub displacement: Vector2<f64>,
}
fn zero_displacement() -> Vector2<f64> {
    Vector2::zeros()
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.position.x)
            .field("y", &self.position.y)
            .field("heading", &self.heading)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(position: Point2<f64>, heading: f64, weight: f64) -> Particle {
        Particle {
            position,
            heading,
            weight,
            displacement: Vector2::zeros(),
        }
    }
    /// Position before the most recent prediction.
    pub fn previous_position(&self) -> Point2<f64> {
        self.position - self.displacement
    }
}

/// Ordered set of particles making up one generation.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticleCollection {
    particles: Vec<Particle>,
}
impl Debug for ParticleCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleCollection")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .finish()
    }
}
impl From<Vec<Particle>> for ParticleCollection {
    fn from(particles: Vec<Particle>) -> Self {
        ParticleCollection { particles }
    }
}
impl FromIterator<Particle> for ParticleCollection {
    fn from_iter<I: IntoIterator<Item = Particle>>(iter: I) -> Self {
        ParticleCollection {
            particles: iter.into_iter().collect(),
        }
    }
}
impl<'a> IntoIterator for &'a ParticleCollection {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;
    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}
impl ParticleCollection {
    pub fn new(particles: Vec<Particle>) -> Self {
        ParticleCollection { particles }
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// A new collection holding only the particles accepted by `keep`, in their original order.
    pub fn filtered<F: FnMut(&Particle) -> bool>(&self, mut keep: F) -> ParticleCollection {
        self.particles.iter().copied().filter(|p| keep(p)).collect()
    }
    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }
    /// Scale weights to sum to one. A zero or non-finite total falls back to uniform weights.
    pub fn normalize_weights(&mut self) {
        let sum = self.total_weight();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else {
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
        }
    }
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
}

/// How a collection is reduced to a single position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
}

impl ParticleAveragingStrategy {
    /// Centroid of the collection and the weights used to compute it (summing to one).
    ///
    /// Weighted averaging falls back to uniform weights when the weights do not sum to a usable
    /// positive value. Returns `None` for an empty collection.
    pub fn centroid(&self, collection: &ParticleCollection) -> Option<(Point2<f64>, Vec<f64>)> {
        if collection.is_empty() {
            return None;
        }
        let n = collection.len() as f64;
        let total = collection.total_weight();
        let weights: Vec<f64> = match self {
            ParticleAveragingStrategy::WeightedAverage if total > 1e-12 && total.is_finite() => {
                collection.iter().map(|p| p.weight / total).collect()
            }
            _ => vec![1.0 / n; collection.len()],
        };
        let mut mean = Vector2::<f64>::zeros();
        for (particle, w) in collection.iter().zip(weights.iter()) {
            mean += particle.position.coords * *w;
        }
        Some((Point2::from(mean), weights))
    }
}

/// Scheme used to draw the indices of a resampled generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingStrategy {
    #[default]
    Systematic,
    Multinomial,
    Stratified,
    Residual,
}

impl ResamplingStrategy {
    /// Draw `n` indices into `weights` with replacement, proportional to weight.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match self {
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

/// Normalized running sum of the weights; uniform when the weights carry no usable mass.
fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    let len = weights.len() as f64;
    if total > 0.0 && total.is_finite() {
        let mut sum = 0.0;
        weights
            .iter()
            .map(|w| {
                sum += w / total;
                sum
            })
            .collect()
    } else {
        (1..=weights.len()).map(|i| i as f64 / len).collect()
    }
}

/// Index of the first cumulative weight at or above `u`.
fn search(cumulative: &[f64], u: f64) -> usize {
    cumulative
        .partition_point(|&c| c < u)
        .min(cumulative.len() - 1)
}

/// Draw sorted positions with `position(i)` and map each onto the cumulative weights.
fn ordered_draw<F: FnMut(usize) -> f64>(weights: &[f64], n: usize, mut position: F) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cumulative = cumulative_weights(weights);
    let mut indices = Vec::with_capacity(n);
    let mut idx = 0;
    for i in 0..n {
        let u = position(i);
        while idx < cumulative.len() - 1 && cumulative[idx] < u {
            idx += 1;
        }
        indices.push(idx);
    }
    indices
}

/// Low-variance resampling: one uniform offset, `n` evenly spaced pointers.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    ordered_draw(weights, n, |i| offset + i as f64 * step)
}

/// One independent uniform pointer inside each of `n` equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let step = 1.0 / n as f64;
    ordered_draw(weights, n, |i| (i as f64 + rng.random::<f64>()) * step)
}

/// `n` independent draws from the categorical distribution given by the weights.
pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cumulative = cumulative_weights(weights);
    (0..n)
        .map(|_| search(&cumulative, rng.random::<f64>()))
        .collect()
}

/// Deterministic `floor(n * w)` copies, remainder drawn systematically from the residual weights.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let normalized: Vec<f64> = if total > 0.0 && total.is_finite() {
        weights.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / weights.len() as f64; weights.len()]
    };
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; normalized.len()];
    for (i, &w) in normalized.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = w * n as f64 - copies as f64;
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}
