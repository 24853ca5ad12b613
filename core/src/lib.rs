//! Floor-map constrained particle filter for pedestrian dead reckoning
//!
//! This crate estimates where a pedestrian is on a building floor by fusing a step count with the
//! heading change measured by a gyroscope. Each detected step produces one [`MotionIncrement`]
//! (a stride length plus a signed heading change) and one filter update. The belief over the
//! pedestrian's position and heading is carried by a fixed-size swarm of particles that is
//! propagated by the motion increment, pruned by the walkable geometry of the floor, resampled,
//! and finally reduced to a single [`engine::EstimatedPosition`].
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): points and vectors for the planar state.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seedable random number
//!   generation for process noise, uniform seeding and resampling.
//! - [`image`](https://crates.io/crates/image): decoding of floor-plan images into an occupancy model.
//! - [`csv`](https://crates.io/crates/csv) and [`serde`](https://crates.io/crates/serde): raw gyroscope payloads, estimate
//!   records and configuration files.
//!
//! ## Crate overview
//!
//! - [heading]: parses raw gyroscope payloads and integrates angular rate into a heading change.
//! - [floor_map]: decodes a floor-plan image into walkable/blocked cells and answers collision queries.
//! - [particle]: particle and particle collection types, resampling index schemes and averaging strategies.
//! - [factory]: builds the first generation of particles uniformly over the walkable area.
//! - [engine]: the predict, filter, resample and estimate pipeline for a single update.
//! - [service]: one tracked-pedestrian update wired to the persistence collaborators.
//! - [memory]: an in-memory implementation of every collaborator interface.
//! - [replay]: offline replay of a recorded walk and CSV export of the estimates.
//! - [config]: the filter configuration and its file formats.
//! - [error]: the error taxonomy shared by every module.
//!
//! ## Coordinates
//!
//! Positions are planar world coordinates derived from the floor-plan image: `x` grows with the
//! pixel column and `y` grows with the pixel row, both scaled by the map resolution (world units
//! per pixel). A heading of zero points along `+x` and positive headings rotate from `+x` towards
//! `+y`. Headings are kept wrapped to `(-pi, pi]`.
//!
//! ## Statelessness
//!
//! The filter keeps nothing between updates. Every update reloads the latest persisted
//! [`engine::Generation`] of the track, derives exactly one child generation from it, and hands
//! the child back to the persistence collaborator. When a track has no generation yet, the
//! [`factory::ParticleCollectionFactory`] seeds one.
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod floor_map;
pub mod heading;
pub mod memory;
pub mod particle;
pub mod replay;
pub mod service;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub use error::{LocalizationError, Result};

/// The motion of one detected step.
///
/// `step_length` is the stride in world units and `heading_delta` the signed heading change
/// (radians) accumulated over the step window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionIncrement {
    pub step_length: f64,
    pub heading_delta: f64,
}
impl Display for MotionIncrement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MotionIncrement {{ step_length: {:.3}, heading_delta: {:.4} rad }}",
            self.step_length, self.heading_delta
        )
    }
}
impl MotionIncrement {
    pub fn new(step_length: f64, heading_delta: f64) -> Self {
        MotionIncrement {
            step_length,
            heading_delta,
        }
    }
    /// True when the increment implies forward travel.
    pub fn is_moving(&self) -> bool {
        self.step_length > 0.0
    }
}

/// Wrap an angle in radians to the range (-pi, pi]
///
/// # Example
/// ```rust
/// use stepfilter::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut wrapped = angle % two_pi;
    if wrapped > std::f64::consts::PI {
        wrapped -= two_pi;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += two_pi;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn wrap_to_pi_keeps_range() {
        assert_approx_eq!(wrap_to_pi(0.0), 0.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-5.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(7.0 * PI), PI, 1e-9);
    }

    #[test]
    fn motion_increment_moving() {
        assert!(MotionIncrement::new(0.7, 0.0).is_moving());
        assert!(!MotionIncrement::new(0.0, 0.3).is_moving());
    }
}
