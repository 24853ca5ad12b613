//! Error taxonomy for localization updates.
//!
//! Every variant except [`LocalizationError::DegenerateFilterState`] is fail-fast: it is returned
//! to the caller untouched and nothing is written. A degenerate filter state (every particle
//! removed by the geometric filters) is recovered inside the engine by reseeding and only surfaces
//! as a warning and a flag on the update outcome.
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocalizationError {
    #[error("track {0} has not started walking")]
    TrackNotStarted(String),

    #[error("no floor information is attached to track {0}")]
    FloorInformationNotFound(String),

    #[error("no floor map found for floor information {0}")]
    FloorMapNotFound(String),

    #[error("invalid sensor data: {0}")]
    InvalidSensorData(String),

    #[error("invalid floor map image: {0}")]
    InvalidFloorMapImage(String),

    #[error("degenerate filter state: {0}")]
    DegenerateFilterState(String),

    #[error(
        "stale generation for track {track_id}: expected parent {expected:?}, latest is {latest:?}"
    )]
    StaleGenerationConflict {
        track_id: String,
        expected: Option<u64>,
        latest: Option<u64>,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, LocalizationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_conflict_message_names_both_generations() {
        let err = LocalizationError::StaleGenerationConflict {
            track_id: "track-1".to_string(),
            expected: Some(3),
            latest: Some(4),
        };
        let message = err.to_string();
        assert!(message.contains("track-1"));
        assert!(message.contains("Some(3)"));
        assert!(message.contains("Some(4)"));
    }
}
