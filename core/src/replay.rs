//! Offline replay of a recorded walk.
//!
//! A walk is a floor-plan image plus one raw gyroscope payload per detected step. The replay
//! registers a single walking track in an [`InMemoryBackend`], pushes every step through the
//! [`LocalizationService`] in order and collects one [`EstimateRecord`] per step, which can be
//! written to and read back from CSV.
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::LocalizationConfig;
use crate::error::{LocalizationError, Result};
use crate::memory::InMemoryBackend;
use crate::service::{LocalizationService, ParentCheck, TrackInfo, UpdateRequest};

const TRACK_ID: &str = "replay";
const FLOOR_INFORMATION_ID: &str = "replay-floor-information";
const FLOOR_ID: &str = "replay-floor";
const FLOOR_MAP_ID: &str = "replay-floor-map";
/// Column of a full recording that assigns each gyroscope row to a step.
pub const STEP_COLUMN: &str = "step";

/// The estimate after one replayed step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub generation: u64,
    pub x: f64,
    pub y: f64,
    pub spread: f64,
    pub converged: bool,
    pub step_length: f64,
    pub heading_delta: f64,
    pub degenerate: bool,
}

impl EstimateRecord {
    /// Reads a CSV file written by [`EstimateRecord::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Split a full gyroscope recording into one payload per step.
///
/// The recording must carry a [`STEP_COLUMN`]; consecutive rows with the same step value form one
/// window. Every window keeps the recording's header so it parses like a single-step payload.
pub fn split_recording(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let invalid = |e: csv::Error| {
        LocalizationError::InvalidSensorData(format!("malformed gyroscope recording: {e}"))
    };
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = rdr.headers().map_err(invalid)?.clone();
    let step_index = headers
        .iter()
        .position(|h| h == STEP_COLUMN)
        .ok_or_else(|| {
            LocalizationError::InvalidSensorData(format!(
                "recording has no '{STEP_COLUMN}' column"
            ))
        })?;

    let mut groups: Vec<(String, Vec<csv::StringRecord>)> = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(invalid)?;
        let step = record.get(step_index).unwrap_or_default().to_string();
        match groups.last_mut() {
            Some((current, rows)) if *current == step => rows.push(record),
            _ => groups.push((step, vec![record])),
        }
    }

    groups
        .into_iter()
        .map(|(_, rows)| {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(&headers).map_err(invalid)?;
            for row in &rows {
                writer.write_record(row).map_err(invalid)?;
            }
            writer.into_inner().map_err(|e| {
                LocalizationError::InvalidSensorData(format!("cannot buffer step window: {e}"))
            })
        })
        .collect()
}

/// Load the step windows of a walk from disk.
///
/// A directory holds one payload file per step, replayed in file-name order. A single file is a
/// full recording split with [`split_recording`].
pub fn load_motion_windows<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u8>>> {
    let path = path.as_ref();
    let unreadable = |e: io::Error| {
        LocalizationError::InvalidSensorData(format!("cannot read {}: {e}", path.display()))
    };
    if path.is_dir() {
        let mut files = fs::read_dir(path)
            .map_err(unreadable)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(unreadable)?;
        files.retain(|p| p.is_file());
        files.sort();
        files
            .iter()
            .map(|file| fs::read(file).map_err(unreadable))
            .collect()
    } else {
        split_recording(&fs::read(path).map_err(unreadable)?)
    }
}

/// Replay a walk step by step and return the estimate after every step.
///
/// Step `i` runs with the seed `seed + i`, so a replay is reproducible end to end.
pub fn replay_walk(
    floor_map_bytes: &[u8],
    windows: &[Vec<u8>],
    config: &LocalizationConfig,
    seed: u64,
) -> Result<Vec<EstimateRecord>> {
    let backend = InMemoryBackend::new();
    backend.register_track(TRACK_ID, TrackInfo::walking(FLOOR_INFORMATION_ID));
    backend.register_floor_map(
        FLOOR_INFORMATION_ID,
        FLOOR_ID,
        FLOOR_MAP_ID,
        floor_map_bytes.to_vec(),
    );
    let service = LocalizationService::new(backend, config.clone())?;

    let mut records = Vec::with_capacity(windows.len());
    let mut parent_check = ParentCheck::Root;
    for (i, window) in windows.iter().enumerate() {
        let request = UpdateRequest::new(TRACK_ID, window.clone(), seed.wrapping_add(i as u64))
            .with_parent_check(parent_check);
        let response = service.update_track(&request)?;
        parent_check = ParentCheck::Generation(response.generation_index);
        records.push(EstimateRecord {
            generation: response.generation_index,
            x: response.estimated_position.point.x,
            y: response.estimated_position.point.y,
            spread: response.estimated_position.spread,
            converged: response.converged,
            step_length: response.motion.step_length,
            heading_delta: response.motion.heading_delta,
            degenerate: response.degenerate,
        });
    }
    Ok(records)
}
