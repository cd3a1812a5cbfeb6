//! End-to-end: config → registry → frame loop → broadcast, plus scene analysis
//! of the tracked position.

use std::io::Write;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use multicam_director::camera::{CameraRegistry, CaptureSet, Frame, Vec3};
use multicam_director::config::Config;
use multicam_director::detection::{Detections, Detector, Observation};
use multicam_director::protocol::{Command, ServerMessage};
use multicam_director::scene::{Scene, StructuralLine, Structure};
use multicam_director::service::FrameLoop;
use multicam_director::tracker::{Activity, TrackState};
use multicam_director::visibility::VisibilityEngine;

const CONFIG: &str = r#"
[[cameras]]
id = "front"
name = "Front"
position = [0.0, 0.0, 5.0]
direction = [0.0, 0.0, -1.0]

[[cameras]]
id = "side"
position = [5.0, 0.0, 0.0]
direction = [-1.0, 0.0, 0.0]

[tracker]
track_buffer = 5

[service]
frame_interval_ms = 10
"#;

fn load_config() -> Config {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    Config::load(file.path()).unwrap()
}

/// 決められた軌跡を歩く1人を、2台のカメラへ投影して返す
struct PathDetector {
    registry: CameraRegistry,
    path: Vec<Vec3>,
    done: CancellationToken,
}

impl Detector for PathDetector {
    fn detect(&mut self, frame_index: u64, _frames: &[Frame]) -> Result<Detections> {
        let Some(position) = self.path.get(frame_index as usize - 1) else {
            self.done.cancel();
            return Ok(Detections::new());
        };
        let observations = self
            .registry
            .iter()
            .map(|camera| {
                let p = camera.project(position).unwrap();
                Observation::new(camera.id(), [p.image.x, p.image.y], [90.0, 210.0], 0.95)
            })
            .collect();
        let mut detections = Detections::new();
        detections.insert("person_7".to_string(), observations);
        Ok(detections)
    }
}

#[tokio::test]
async fn test_replayed_walk_is_tracked_and_broadcast() {
    let config = load_config();
    let registry = CameraRegistry::from_configs(&config.cameras).unwrap();
    assert_eq!(registry.active(), Some("front"));

    let path = vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(0.4, 0.0, 0.0),
        Vec3::new(0.5, 0.0, 0.0),
        Vec3::new(0.5, 0.0, 0.0),
    ];
    let cancel = CancellationToken::new();
    let detector = PathDetector {
        registry: registry.clone(),
        path,
        done: cancel.clone(),
    };

    let (tx, mut rx) = mpsc::channel(64);
    let frame_loop = FrameLoop::new(
        registry,
        CaptureSet::new(),
        Box::new(detector),
        TrackState::new(&config.tracker),
        &config.service,
        tx,
    );
    frame_loop.commands().send(Command::StartTracking).await.unwrap();
    frame_loop.run(cancel).await.unwrap();

    let mut messages = Vec::new();
    while let Some(m) = rx.recv().await {
        messages.push(m);
    }

    assert!(matches!(messages[0], ServerMessage::CamerasInfo { ref cameras } if cameras.len() == 2));
    assert_eq!(messages[1], ServerMessage::CommandAck { ok: true, error: None });

    let frames: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Persons { persons, .. } => Some(persons[0].clone()),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 4);

    let activities: Vec<Activity> = frames.iter().map(|p| p.activity).collect();
    assert_eq!(
        activities,
        vec![Activity::Standing, Activity::Running, Activity::Walking, Activity::Standing]
    );
    assert!((Vec3::from(frames[1].direction) - Vec3::x()).norm() < 1e-6);
    assert!((Vec3::from(frames[3].position) - Vec3::new(0.5, 0.0, 0.0)).norm() < 1e-6);
    assert!(frames.iter().all(|p| p.subject_id == "person_7"));
}

#[test]
fn test_tracked_position_scene_analysis() {
    let config = load_config();
    let registry = CameraRegistry::from_configs(&config.cameras).unwrap();

    let scene = Scene::new(
        vec![
            Structure { id: 0, center: [-1.0, 0.0, -1.0], point_count: 400 },
            Structure { id: 1, center: [1.0, 0.0, -1.0], point_count: 250 },
        ],
        // front カメラと原点の間を横切る梁
        vec![StructuralLine::new(Vec3::new(0.0, 0.0, 3.0), Vec3::new(1.0, 0.0, 0.0)).unwrap()],
    );

    let engine = VisibilityEngine::new(config.visibility.clone());
    let subject = scene.analyze_subject(&registry, &engine, &Vec3::zeros());
    assert_eq!(subject.camera_count, 1);
    assert_eq!(subject.visible_cameras[0].camera_id, "side");

    let analysis = scene.analyze_scene(&registry, &config.scene);
    assert_eq!(analysis.cameras.len(), 2);
    assert_eq!(analysis.cameras["front"].visible_structures, vec![0, 1]);

    let json = serde_json::to_value(&analysis).unwrap();
    assert_eq!(json["structural_lines"][0]["id"], 0);
    assert_eq!(json["structures"][1]["point_count"], 250);
}

#[test]
fn test_sample_config_parses() {
    let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/director.toml")).unwrap();
    let registry = CameraRegistry::from_configs(&config.cameras).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get("front").unwrap().name(), "正面");
    assert_eq!(config.service.frame_interval_ms, 33);
}

#[test]
fn test_camera_without_direction_fails_startup() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.replacen("direction = [0.0, 0.0, -1.0]\n", "", 1).as_bytes())
        .unwrap();

    let err = Config::load_if_present(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("missing field `direction`"), "{err:#}");
}
