//! One filter update of a tracked pedestrian, wired to its persistence collaborators.
//!
//! The service owns no state of its own. Every call to [`LocalizationService::update_track`]
//! opens one collaborator session, loads what the update needs, runs the
//! [`LocalizationEngine`] once and writes the new generation back. The session is dropped on
//! every exit path, so a failed update never leaks it.
//!
//! Collaborators are split by capability ([`TrackDirectory`], [`FloorMapStore`],
//! [`GenerationStore`], [`MotionPayloadStore`]); a [`Backend`] hands out sessions that implement
//! all four.
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::MotionIncrement;
use crate::config::{FloorMapConfig, LocalizationConfig};
use crate::engine::{EstimatedPosition, Generation, LocalizationEngine};
use crate::error::{LocalizationError, Result};
use crate::floor_map::FloorMap;
use crate::heading::HeadingIntegrator;

/// Lifecycle of a tracked walk. Only walking tracks accept updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackStatus {
    #[default]
    NotStarted,
    Walking,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub status: TrackStatus,
    /// Floor the walk takes place on, set when the walk starts.
    pub floor_information_id: Option<String>,
}

impl TrackInfo {
    pub fn walking(floor_information_id: &str) -> Self {
        TrackInfo {
            status: TrackStatus::Walking,
            floor_information_id: Some(floor_information_id.to_string()),
        }
    }
}

/// Storage keys of the floor-plan image behind a floor-information record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FloorMapLocation {
    pub floor_id: String,
    pub floor_map_id: String,
}

pub trait TrackDirectory {
    fn lookup_track(&self, track_id: &str) -> Result<Option<TrackInfo>>;
}

pub trait FloorMapStore {
    fn resolve_floor_map(&self, floor_information_id: &str) -> Result<Option<FloorMapLocation>>;

    /// Raw image bytes of a floor plan, or `None` when nothing is stored under the keys.
    fn load_floor_map_bytes(
        &self,
        floor_id: &str,
        floor_information_id: &str,
        floor_map_id: &str,
    ) -> Result<Option<Vec<u8>>>;
}

pub trait GenerationStore {
    /// Latest persisted generation of the track, if any.
    fn load_prior_generation(&self, track_id: &str) -> Result<Option<Generation>>;

    /// Stage a generation for appending to the track's chain and return its id.
    ///
    /// Fails with [`LocalizationError::StaleGenerationConflict`] when `generation.parent` is not
    /// the latest stored generation. Nothing is visible until the session commits.
    fn persist_generation(&mut self, track_id: &str, generation: &Generation) -> Result<u64>;
}

pub trait MotionPayloadStore {
    /// Stage the raw payload of a step under the id of its generation.
    fn persist_raw_motion_payload(
        &mut self,
        track_id: &str,
        generation_id: u64,
        bytes: &[u8],
    ) -> Result<()>;
}

/// Unit of work over the staged writes of a session.
pub trait Transaction {
    /// Apply every staged write at once, or none of them.
    ///
    /// Must re-check the parent of every staged generation against the store, so two sessions
    /// racing on one track cannot both commit. A session dropped without committing discards its
    /// staged writes.
    fn commit(&mut self) -> Result<()>;
}

/// Source of scoped collaborator sessions. A session lives for one update and is released when
/// dropped.
pub trait Backend {
    type Session: TrackDirectory
        + FloorMapStore
        + GenerationStore
        + MotionPayloadStore
        + Transaction;

    fn open_session(&self) -> Result<Self::Session>;
}

/// Which prior generation the caller expects the update to build on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentCheck {
    /// Build on whatever generation is latest.
    #[default]
    Unchecked,
    /// The track must have no generation yet.
    Root,
    /// The latest generation must have this index.
    Generation(u64),
}

impl ParentCheck {
    /// Compare the expectation with the latest persisted generation index.
    pub fn verify(&self, track_id: &str, latest: Option<u64>) -> Result<()> {
        let expected = match *self {
            ParentCheck::Unchecked => return Ok(()),
            ParentCheck::Root => None,
            ParentCheck::Generation(index) => Some(index),
        };
        if expected == latest {
            Ok(())
        } else {
            Err(LocalizationError::StaleGenerationConflict {
                track_id: track_id.to_string(),
                expected,
                latest,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRequest {
    pub track_id: String,
    /// Raw gyroscope payload of the step window, as recorded.
    pub raw_motion: Vec<u8>,
    pub parent_check: ParentCheck,
    /// Seed of the random number generator driving this update.
    pub seed: u64,
}

impl UpdateRequest {
    pub fn new(track_id: &str, raw_motion: Vec<u8>, seed: u64) -> Self {
        UpdateRequest {
            track_id: track_id.to_string(),
            raw_motion,
            parent_check: ParentCheck::Unchecked,
            seed,
        }
    }

    pub fn with_parent_check(mut self, parent_check: ParentCheck) -> Self {
        self.parent_check = parent_check;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub estimated_position: EstimatedPosition,
    pub motion: MotionIncrement,
    pub generation_index: u64,
    pub converged: bool,
    pub degenerate: bool,
}

/// Runs one filter update per request against a [`Backend`].
pub struct LocalizationService<B: Backend> {
    backend: B,
    engine: LocalizationEngine,
    integrator: HeadingIntegrator,
    floor_map_config: FloorMapConfig,
}

impl<B: Backend> LocalizationService<B> {
    pub fn new(backend: B, config: LocalizationConfig) -> Result<Self> {
        let integrator = HeadingIntegrator::new(config.integration_method, config.gyro_axis);
        let floor_map_config = config.floor_map.clone();
        let engine = LocalizationEngine::new(config)?;
        Ok(LocalizationService {
            backend,
            engine,
            integrator,
            floor_map_config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn engine(&self) -> &LocalizationEngine {
        &self.engine
    }

    /// Derive and persist the next generation of a walking track.
    ///
    /// Nothing is written unless every lookup, the sensor integration, the floor map decode, the
    /// parent check and the filter update succeed. The new generation and its raw payload are
    /// staged on the session and committed together.
    pub fn update_track(&self, request: &UpdateRequest) -> Result<UpdateResponse> {
        let mut session = self.backend.open_session()?;
        let track_id = request.track_id.as_str();

        let track = session
            .lookup_track(track_id)?
            .filter(|track| track.status == TrackStatus::Walking)
            .ok_or_else(|| LocalizationError::TrackNotStarted(track_id.to_string()))?;
        let floor_information_id = track
            .floor_information_id
            .ok_or_else(|| LocalizationError::FloorInformationNotFound(track_id.to_string()))?;

        let motion = self
            .integrator
            .motion_increment(&request.raw_motion, self.engine.config().step_length)?;

        let location = session
            .resolve_floor_map(&floor_information_id)?
            .ok_or_else(|| LocalizationError::FloorMapNotFound(floor_information_id.clone()))?;
        let image_bytes = session
            .load_floor_map_bytes(
                &location.floor_id,
                &floor_information_id,
                &location.floor_map_id,
            )?
            .ok_or_else(|| {
                LocalizationError::FloorMapNotFound(format!(
                    "{floor_information_id} (image {} of floor {} is missing)",
                    location.floor_map_id, location.floor_id
                ))
            })?;
        let floor_map = FloorMap::decode(&image_bytes, &self.floor_map_config)?;

        let prior = session.load_prior_generation(track_id)?;
        request
            .parent_check
            .verify(track_id, prior.as_ref().map(|g| g.index))?;

        let mut rng = StdRng::seed_from_u64(request.seed);
        let outcome = self
            .engine
            .update(prior.as_ref(), &motion, &floor_map, &mut rng)?;
        let generation = outcome.generation;

        let generation_id = session.persist_generation(track_id, &generation)?;
        session.persist_raw_motion_payload(track_id, generation_id, &request.raw_motion)?;
        session.commit()?;
        info!(
            "track {track_id}: generation {} at ({:.2}, {:.2}), spread {:.2}{}",
            generation.index,
            generation.estimate.point.x,
            generation.estimate.point.y,
            generation.estimate.spread,
            if generation.converged { ", converged" } else { "" }
        );

        Ok(UpdateResponse {
            estimated_position: generation.estimate,
            motion,
            generation_index: generation.index,
            converged: generation.converged,
            degenerate: outcome.degenerate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchecked_accepts_anything() {
        assert!(ParentCheck::Unchecked.verify("t", None).is_ok());
        assert!(ParentCheck::Unchecked.verify("t", Some(9)).is_ok());
    }

    #[test]
    fn test_root_requires_empty_chain() {
        assert!(ParentCheck::Root.verify("t", None).is_ok());
        assert_eq!(
            ParentCheck::Root.verify("t", Some(0)),
            Err(LocalizationError::StaleGenerationConflict {
                track_id: "t".to_string(),
                expected: None,
                latest: Some(0),
            })
        );
    }

    #[test]
    fn test_generation_must_be_latest() {
        assert!(ParentCheck::Generation(3).verify("t", Some(3)).is_ok());
        assert!(ParentCheck::Generation(2).verify("t", Some(3)).is_err());
        assert!(ParentCheck::Generation(0).verify("t", None).is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = UpdateRequest::new("walk-1", b"seconds_elapsed,z\n".to_vec(), 9)
            .with_parent_check(ParentCheck::Generation(4));
        assert_eq!(request.track_id, "walk-1");
        assert_eq!(request.parent_check, ParentCheck::Generation(4));
        assert_eq!(request.seed, 9);
    }

    #[test]
    fn test_track_info_walking() {
        let info = TrackInfo::walking("floor-2");
        assert_eq!(info.status, TrackStatus::Walking);
        assert_eq!(info.floor_information_id.as_deref(), Some("floor-2"));
        assert_eq!(TrackInfo::default().status, TrackStatus::NotStarted);
    }
}
