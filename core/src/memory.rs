//! In-memory implementation of every collaborator interface.
//!
//! Backs the offline replay and the tests. All sessions of one [`InMemoryBackend`] share the same
//! state behind a mutex, so clones of the backend can be handed to several threads. The backend
//! also counts open sessions and committed writes, which makes leaked sessions and unexpected
//! writes observable.
//!
//! Writes made through a session are staged on the session and only reach the shared state when
//! the session commits. Dropping a session without committing discards them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::Generation;
use crate::error::{LocalizationError, Result};
use crate::service::{
    Backend, FloorMapLocation, FloorMapStore, GenerationStore, MotionPayloadStore, TrackDirectory,
    TrackInfo, Transaction,
};

#[derive(Debug, Default)]
struct MemoryState {
    tracks: HashMap<String, TrackInfo>,
    floor_informations: HashMap<String, FloorMapLocation>,
    /// Keyed by (floor_id, floor_information_id, floor_map_id)
    floor_maps: HashMap<(String, String, String), Vec<u8>>,
    generations: HashMap<String, Vec<Generation>>,
    payloads: HashMap<(String, u64), Vec<u8>>,
    writes: usize,
    fail_persistence: bool,
    fail_payloads: bool,
}

impl MemoryState {
    fn latest_index(&self, track_id: &str) -> Option<u64> {
        self.generations
            .get(track_id)
            .and_then(|chain| chain.last())
            .map(|g| g.index)
    }
}

/// A generation may only follow the latest one of its track.
fn check_parent(track_id: &str, generation: &Generation, latest: Option<u64>) -> Result<()> {
    if generation.parent != latest {
        return Err(LocalizationError::StaleGenerationConflict {
            track_id: track_id.to_string(),
            expected: generation.parent,
            latest,
        });
    }
    let expected_index = latest.map(|i| i + 1).unwrap_or(0);
    if generation.index != expected_index {
        return Err(LocalizationError::PersistenceFailure(format!(
            "generation {} cannot follow {:?} on track {track_id}",
            generation.index, latest
        )));
    }
    Ok(())
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    open_sessions: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_track(&self, track_id: &str, info: TrackInfo) {
        lock(&self.state)
            .tracks
            .insert(track_id.to_string(), info);
    }

    /// Register a floor plan image and the floor-information record that points at it.
    pub fn register_floor_map(
        &self,
        floor_information_id: &str,
        floor_id: &str,
        floor_map_id: &str,
        image_bytes: Vec<u8>,
    ) {
        let mut state = lock(&self.state);
        state.floor_informations.insert(
            floor_information_id.to_string(),
            FloorMapLocation {
                floor_id: floor_id.to_string(),
                floor_map_id: floor_map_id.to_string(),
            },
        );
        state.floor_maps.insert(
            (
                floor_id.to_string(),
                floor_information_id.to_string(),
                floor_map_id.to_string(),
            ),
            image_bytes,
        );
    }

    /// Point a floor-information record at a location without storing an image.
    pub fn register_floor_location(&self, floor_information_id: &str, location: FloorMapLocation) {
        lock(&self.state)
            .floor_informations
            .insert(floor_information_id.to_string(), location);
    }

    /// Full generation chain of a track, oldest first.
    pub fn generations(&self, track_id: &str) -> Vec<Generation> {
        lock(&self.state)
            .generations
            .get(track_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn raw_motion_payload(&self, track_id: &str, generation_id: u64) -> Option<Vec<u8>> {
        lock(&self.state)
            .payloads
            .get(&(track_id.to_string(), generation_id))
            .cloned()
    }

    /// Number of committed writes (generations plus payloads) so far.
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Make every subsequent persist and commit call fail with a persistence error.
    pub fn set_fail_persistence(&self, fail: bool) {
        lock(&self.state).fail_persistence = fail;
    }

    /// Make only raw payload writes fail, leaving generation writes working.
    pub fn set_fail_payloads(&self, fail: bool) {
        lock(&self.state).fail_payloads = fail;
    }
}

impl Backend for InMemoryBackend {
    type Session = InMemorySession;

    fn open_session(&self) -> Result<InMemorySession> {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            state: Arc::clone(&self.state),
            open_sessions: Arc::clone(&self.open_sessions),
            staged_generations: Vec::new(),
            staged_payloads: Vec::new(),
        })
    }
}

/// A session on an [`InMemoryBackend`]; released when dropped.
#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<Mutex<MemoryState>>,
    open_sessions: Arc<AtomicUsize>,
    staged_generations: Vec<(String, Generation)>,
    staged_payloads: Vec<((String, u64), Vec<u8>)>,
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TrackDirectory for InMemorySession {
    fn lookup_track(&self, track_id: &str) -> Result<Option<TrackInfo>> {
        Ok(lock(&self.state).tracks.get(track_id).cloned())
    }
}

impl FloorMapStore for InMemorySession {
    fn resolve_floor_map(&self, floor_information_id: &str) -> Result<Option<FloorMapLocation>> {
        Ok(lock(&self.state)
            .floor_informations
            .get(floor_information_id)
            .cloned())
    }

    fn load_floor_map_bytes(
        &self,
        floor_id: &str,
        floor_information_id: &str,
        floor_map_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        let key = (
            floor_id.to_string(),
            floor_information_id.to_string(),
            floor_map_id.to_string(),
        );
        Ok(lock(&self.state).floor_maps.get(&key).cloned())
    }
}

impl GenerationStore for InMemorySession {
    fn load_prior_generation(&self, track_id: &str) -> Result<Option<Generation>> {
        Ok(lock(&self.state)
            .generations
            .get(track_id)
            .and_then(|chain| chain.last())
            .cloned())
    }

    fn persist_generation(&mut self, track_id: &str, generation: &Generation) -> Result<u64> {
        let state = lock(&self.state);
        if state.fail_persistence {
            return Err(LocalizationError::PersistenceFailure(format!(
                "generation store unavailable for track {track_id}"
            )));
        }
        let latest = self
            .staged_generations
            .iter()
            .rev()
            .find(|(staged_track, _)| staged_track == track_id)
            .map(|(_, g)| Some(g.index))
            .unwrap_or_else(|| state.latest_index(track_id));
        check_parent(track_id, generation, latest)?;
        drop(state);
        self.staged_generations
            .push((track_id.to_string(), generation.clone()));
        Ok(generation.index)
    }
}

impl MotionPayloadStore for InMemorySession {
    fn persist_raw_motion_payload(
        &mut self,
        track_id: &str,
        generation_id: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let state = lock(&self.state);
        if state.fail_persistence || state.fail_payloads {
            return Err(LocalizationError::PersistenceFailure(format!(
                "payload store unavailable for track {track_id}"
            )));
        }
        drop(state);
        self.staged_payloads
            .push(((track_id.to_string(), generation_id), bytes.to_vec()));
        Ok(())
    }
}

impl Transaction for InMemorySession {
    fn commit(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_persistence {
            return Err(LocalizationError::PersistenceFailure(
                "commit rejected by the store".to_string(),
            ));
        }
        // validate everything before touching the shared state
        let mut heads: HashMap<&str, Option<u64>> = HashMap::new();
        for (track_id, generation) in &self.staged_generations {
            let latest = *heads
                .entry(track_id.as_str())
                .or_insert_with(|| state.latest_index(track_id));
            check_parent(track_id, generation, latest)?;
            heads.insert(track_id.as_str(), Some(generation.index));
        }

        for (track_id, generation) in self.staged_generations.drain(..) {
            state.generations.entry(track_id).or_default().push(generation);
            state.writes += 1;
        }
        for (key, bytes) in self.staged_payloads.drain(..) {
            state.payloads.insert(key, bytes);
            state.writes += 1;
        }
        Ok(())
    }
}
