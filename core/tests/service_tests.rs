//! Integration tests for [`LocalizationService::update_track`] against the in-memory backend.
//!
//! Covers the failure paths (which must leave the store untouched and release the session), the
//! reuse of the persisted prior generation, optimistic concurrency on the generation chain, and
//! parallel updates of independent tracks.
use std::io::Cursor;
use std::thread;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use rand::SeedableRng;
use rand::rngs::StdRng;

use stepfilter::LocalizationError;
use stepfilter::config::{FloorMapConfig, LocalizationConfig};
use stepfilter::floor_map::FloorMap;
use stepfilter::memory::InMemoryBackend;
use stepfilter::service::{
    FloorMapLocation, LocalizationService, ParentCheck, TrackInfo, TrackStatus, UpdateRequest,
};

const WINDOW: &[u8] = b"seconds_elapsed,z,y,x\n0.00,0.10,0.0,0.0\n0.25,0.10,0.0,0.0\n0.50,0.10,0.0,0.0\n";

fn office_png() -> Vec<u8> {
    let image = RgbaImage::from_fn(80, 40, |x, y| {
        if x == 0 || y == 0 || x == 79 || y == 39 || (x == 40 && y < 30) {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn config() -> LocalizationConfig {
    LocalizationConfig {
        num_particles: 120,
        ..LocalizationConfig::default()
    }
}

fn backend_with_walk(track_id: &str) -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    backend.register_track(track_id, TrackInfo::walking("office-info"));
    backend.register_floor_map("office-info", "office-floor", "office-map", office_png());
    backend
}

fn service(backend: InMemoryBackend) -> LocalizationService<InMemoryBackend> {
    LocalizationService::new(backend, config()).unwrap()
}

fn assert_untouched(service: &LocalizationService<InMemoryBackend>) {
    assert_eq!(service.backend().write_count(), 0);
    assert_eq!(service.backend().open_sessions(), 0);
}

#[test]
fn unknown_track_is_not_started() {
    let service = service(backend_with_walk("walk"));
    let result = service.update_track(&UpdateRequest::new("other", WINDOW.to_vec(), 1));
    assert_eq!(
        result,
        Err(LocalizationError::TrackNotStarted("other".to_string()))
    );
    assert_untouched(&service);
}

#[test]
fn not_started_track_writes_nothing() {
    let backend = backend_with_walk("walk");
    backend.register_track(
        "idle",
        TrackInfo {
            status: TrackStatus::NotStarted,
            floor_information_id: Some("office-info".to_string()),
        },
    );
    let service = service(backend);
    let result = service.update_track(&UpdateRequest::new("idle", WINDOW.to_vec(), 1));
    assert!(matches!(result, Err(LocalizationError::TrackNotStarted(_))));
    assert_untouched(&service);
}

#[test]
fn walking_track_without_floor_information() {
    let backend = backend_with_walk("walk");
    backend.register_track(
        "lost",
        TrackInfo {
            status: TrackStatus::Walking,
            floor_information_id: None,
        },
    );
    let service = service(backend);
    let result = service.update_track(&UpdateRequest::new("lost", WINDOW.to_vec(), 1));
    assert!(matches!(
        result,
        Err(LocalizationError::FloorInformationNotFound(_))
    ));
    assert_untouched(&service);
}

#[test]
fn missing_floor_map_is_reported() {
    let backend = InMemoryBackend::new();
    backend.register_track("unmapped", TrackInfo::walking("nowhere"));
    backend.register_track("imageless", TrackInfo::walking("blank-info"));
    backend.register_floor_location(
        "blank-info",
        FloorMapLocation {
            floor_id: "f".to_string(),
            floor_map_id: "m".to_string(),
        },
    );
    let service = service(backend);
    for track_id in ["unmapped", "imageless"] {
        let result = service.update_track(&UpdateRequest::new(track_id, WINDOW.to_vec(), 1));
        assert!(matches!(result, Err(LocalizationError::FloorMapNotFound(_))));
    }
    assert_untouched(&service);
}

#[test]
fn undecodable_floor_map_is_reported() {
    let backend = InMemoryBackend::new();
    backend.register_track("walk", TrackInfo::walking("info"));
    backend.register_floor_map("info", "floor", "map", b"GIF89a garbage".to_vec());
    let service = service(backend);
    let result = service.update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), 1));
    assert!(matches!(
        result,
        Err(LocalizationError::InvalidFloorMapImage(_))
    ));
    assert_untouched(&service);
}

#[test]
fn malformed_sensor_payload_writes_nothing() {
    let service = service(backend_with_walk("walk"));
    let payloads: [&[u8]; 3] = [
        b"",
        b"seconds_elapsed,z\n",
        b"seconds_elapsed,z\n0.5,1\n0.1,1\n",
    ];
    for payload in payloads {
        let result = service.update_track(&UpdateRequest::new("walk", payload.to_vec(), 1));
        assert!(matches!(result, Err(LocalizationError::InvalidSensorData(_))));
    }
    assert_untouched(&service);
}

#[test]
fn first_update_starts_the_chain() {
    let service = service(backend_with_walk("walk"));
    let response = service
        .update_track(
            &UpdateRequest::new("walk", WINDOW.to_vec(), 7).with_parent_check(ParentCheck::Root),
        )
        .unwrap();

    assert_eq!(response.generation_index, 0);
    assert!((response.motion.step_length - 0.7).abs() < 1e-12);
    assert!((response.motion.heading_delta - 0.05).abs() < 1e-12);
    let backend = service.backend();
    let chain = backend.generations("walk");
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].parent, None);
    assert_eq!(chain[0].particles.len(), 120);
    assert_eq!(chain[0].estimate, response.estimated_position);
    assert_eq!(backend.raw_motion_payload("walk", 0), Some(WINDOW.to_vec()));
    assert_eq!(backend.write_count(), 2);
    assert_eq!(backend.open_sessions(), 0);
}

#[test]
fn later_updates_build_on_the_persisted_generation() {
    let service = service(backend_with_walk("walk"));
    service
        .update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), 1))
        .unwrap();
    let response = service
        .update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), 2))
        .unwrap();
    assert_eq!(response.generation_index, 1);

    let chain = service.backend().generations("walk");
    assert_eq!(chain[1].parent, Some(0));

    // replaying the second update offline from the first generation must give the same result
    let map = FloorMap::decode(&office_png(), &FloorMapConfig::default()).unwrap();
    let expected = service
        .engine()
        .update(
            Some(&chain[0]),
            &chain[1].motion,
            &map,
            &mut StdRng::seed_from_u64(2),
        )
        .unwrap();
    assert_eq!(expected.seed, chain[0].particles);
    assert_eq!(expected.generation, chain[1]);
}

#[test]
fn stale_parent_is_rejected_before_any_write() {
    let service = service(backend_with_walk("walk"));
    for seed in 0..2 {
        service
            .update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), seed))
            .unwrap();
    }
    let writes = service.backend().write_count();

    let stale = service.update_track(
        &UpdateRequest::new("walk", WINDOW.to_vec(), 3).with_parent_check(ParentCheck::Generation(0)),
    );
    assert_eq!(
        stale,
        Err(LocalizationError::StaleGenerationConflict {
            track_id: "walk".to_string(),
            expected: Some(0),
            latest: Some(1),
        })
    );
    let root = service.update_track(
        &UpdateRequest::new("walk", WINDOW.to_vec(), 3).with_parent_check(ParentCheck::Root),
    );
    assert!(matches!(
        root,
        Err(LocalizationError::StaleGenerationConflict { .. })
    ));
    assert_eq!(service.backend().write_count(), writes);
    assert_eq!(service.backend().generations("walk").len(), 2);
    assert_eq!(service.backend().open_sessions(), 0);

    let fresh = service
        .update_track(
            &UpdateRequest::new("walk", WINDOW.to_vec(), 3)
                .with_parent_check(ParentCheck::Generation(1)),
        )
        .unwrap();
    assert_eq!(fresh.generation_index, 2);
}

#[test]
fn persistence_failure_releases_the_session() {
    let backend = backend_with_walk("walk");
    backend.set_fail_persistence(true);
    let service = service(backend);
    let result = service.update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), 1));
    assert!(matches!(result, Err(LocalizationError::PersistenceFailure(_))));
    assert_untouched(&service);
    assert!(service.backend().generations("walk").is_empty());
}

#[test]
fn failed_payload_write_leaves_no_generation_behind() {
    let backend = backend_with_walk("walk");
    backend.set_fail_payloads(true);
    let service = service(backend);
    let request =
        UpdateRequest::new("walk", WINDOW.to_vec(), 1).with_parent_check(ParentCheck::Root);

    let result = service.update_track(&request);
    assert!(matches!(result, Err(LocalizationError::PersistenceFailure(_))));
    assert!(service.backend().generations("walk").is_empty());
    assert!(service.backend().raw_motion_payload("walk", 0).is_none());
    assert_untouched(&service);

    // the same request succeeds once the payload store is back
    service.backend().set_fail_payloads(false);
    let response = service.update_track(&request).unwrap();
    assert_eq!(response.generation_index, 0);
    assert_eq!(service.backend().generations("walk").len(), 1);
    assert_eq!(
        service.backend().raw_motion_payload("walk", 0),
        Some(WINDOW.to_vec())
    );
}

#[test]
fn same_inputs_give_the_same_chain() {
    let run = || {
        let service = service(backend_with_walk("walk"));
        for seed in [11, 12, 13] {
            service
                .update_track(&UpdateRequest::new("walk", WINDOW.to_vec(), seed))
                .unwrap();
        }
        service.backend().generations("walk")
    };
    assert_eq!(run(), run());
}

#[test]
fn independent_tracks_update_in_parallel() {
    let backend = InMemoryBackend::new();
    backend.register_floor_map("office-info", "office-floor", "office-map", office_png());
    let tracks: Vec<String> = (0..4).map(|i| format!("walk-{i}")).collect();
    for track_id in &tracks {
        backend.register_track(track_id, TrackInfo::walking("office-info"));
    }
    let service = service(backend);

    thread::scope(|scope| {
        for track_id in &tracks {
            let service = &service;
            scope.spawn(move || {
                let mut parent_check = ParentCheck::Root;
                for seed in 0..5 {
                    let request = UpdateRequest::new(track_id, WINDOW.to_vec(), seed)
                        .with_parent_check(parent_check);
                    let response = service.update_track(&request).unwrap();
                    parent_check = ParentCheck::Generation(response.generation_index);
                }
            });
        }
    });

    for track_id in &tracks {
        let chain = service.backend().generations(track_id);
        assert_eq!(chain.len(), 5);
        for (i, generation) in chain.iter().enumerate() {
            assert_eq!(generation.index, i as u64);
        }
    }
    assert_eq!(service.backend().write_count(), 40);
    assert_eq!(service.backend().open_sessions(), 0);
}

#[test]
fn racing_updates_on_one_track_keep_the_chain_linear() {
    let service = service(backend_with_walk("walk"));

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let service = &service;
            scope.spawn(move || {
                for step in 0..5u64 {
                    let request = UpdateRequest::new("walk", WINDOW.to_vec(), worker * 10 + step);
                    match service.update_track(&request) {
                        Ok(_) | Err(LocalizationError::StaleGenerationConflict { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            });
        }
    });

    let chain = service.backend().generations("walk");
    assert!(!chain.is_empty());
    for (i, generation) in chain.iter().enumerate() {
        assert_eq!(generation.index, i as u64);
        assert_eq!(generation.parent, i.checked_sub(1).map(|p| p as u64));
    }
    assert_eq!(service.backend().write_count(), 2 * chain.len());
    assert_eq!(service.backend().open_sessions(), 0);
}
