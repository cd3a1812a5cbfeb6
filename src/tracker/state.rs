use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::history::History;
use super::motion::{default_direction, infer_motion, Activity};
use crate::camera::{CameraRegistry, Vec3};
use crate::config::TrackerConfig;
use crate::detection::{Detections, Observation};
use crate::triangulation::Triangulator;

/// 人物の標準身長（ワールド単位）。説明用のサイズ推定にのみ使い、位置計算には使わない
pub const CANONICAL_HEIGHT: f64 = 1.7;
const ESTIMATED_WIDTH: f64 = 0.5;
const ESTIMATED_DEPTH: f64 = 0.3;

/// 被写体の推定サイズ
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubjectSize {
    pub height: f64,
    pub width: f64,
    pub depth: f64,
    /// 1ピクセルあたりのワールド長（平均bbox高さから）
    pub pixel_to_world: Option<f64>,
}

impl SubjectSize {
    fn from_observations<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Self {
        let (sum, count) = observations
            .into_iter()
            .fold((0.0, 0usize), |(sum, count), o| (sum + o.size[1], count + 1));
        let pixel_to_world = if count == 0 {
            None
        } else {
            let avg_height = sum / count as f64;
            (avg_height > 0.0).then(|| CANONICAL_HEIGHT / avg_height)
        };
        Self {
            height: CANONICAL_HEIGHT,
            width: ESTIMATED_WIDTH,
            depth: ESTIMATED_DEPTH,
            pixel_to_world,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// ミリ秒（UNIX時刻）
    pub timestamp: i64,
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub activity: Activity,
}

/// 1被写体の追跡状態
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    pub activity: Activity,
    pub size: SubjectSize,
    /// 最後に更新されたフレーム番号
    pub last_frame: u64,
    pub history: History<HistoryEntry>,
}

impl Track {
    pub fn snapshot(&self) -> TrackedSubject {
        TrackedSubject {
            subject_id: self.id.clone(),
            position: self.position.into(),
            velocity: self.velocity.into(),
            direction: self.direction.into(),
            activity: self.activity,
            size: self.size,
        }
    }
}

/// `track()` の出力1件（配信層へ渡す）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedSubject {
    pub subject_id: String,
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub direction: [f64; 3],
    pub activity: Activity,
    pub size: SubjectSize,
}

/// running / idle の切り替えハンドル。フレームループと制御側で共有する
#[derive(Debug, Clone, Default)]
pub struct TrackerControl {
    running: Arc<AtomicBool>,
}

impl TrackerControl {
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!("tracking started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("tracking stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// 全被写体のトラック
pub struct TrackState {
    tracks: BTreeMap<String, Track>,
    triangulator: Triangulator,
    history_capacity: usize,
    control: TrackerControl,
    frame_count: u64,
    timestamp_ms: i64,
}

impl TrackState {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            tracks: BTreeMap::new(),
            triangulator: Triangulator::from_config(config),
            history_capacity: config.track_buffer,
            control: TrackerControl::default(),
            frame_count: 0,
            timestamp_ms: 0,
        }
    }

    pub fn control(&self) -> TrackerControl {
        self.control.clone()
    }

    pub fn start(&self) {
        self.control.start();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// 処理済みフレーム数（idle 中は増えない）
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 直近フレームのタイムスタンプ（ミリ秒）
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// 現在時刻で1フレーム処理
    pub fn track(&mut self, registry: &CameraRegistry, detections: &Detections) -> Vec<TrackedSubject> {
        let now = chrono::Utc::now().timestamp_millis();
        self.process_frame(registry, detections, now)
    }

    /// 1フレーム分の検出を処理
    ///
    /// 2台以上で観測された被写体を三角測量し、動きを推定して履歴に追加する。
    /// 三角測量に失敗した被写体はこのフレームだけスキップする。
    pub fn process_frame(
        &mut self,
        registry: &CameraRegistry,
        detections: &Detections,
        timestamp_ms: i64,
    ) -> Vec<TrackedSubject> {
        if !self.is_running() {
            return Vec::new();
        }

        self.frame_count += 1;
        self.timestamp_ms = timestamp_ms;
        let frame = self.frame_count;

        let mut results = Vec::with_capacity(detections.len());
        for (subject_id, observations) in detections {
            if observations.len() < 2 {
                debug!(subject_id = %subject_id, frame, views = observations.len(), "not enough views");
                continue;
            }

            let triangulated = match self.triangulator.triangulate(registry, observations) {
                Ok(t) => t,
                Err(e) => {
                    let cameras: Vec<&str> = observations.iter().map(|o| o.camera_id.as_str()).collect();
                    warn!(subject_id = %subject_id, frame, ?cameras, "triangulation failed: {e}");
                    continue;
                }
            };

            // 位置と同じ観測集合から
            let size = SubjectSize::from_observations(
                self.triangulator.usable(registry, observations).map(|(obs, _)| obs),
            );
            let track = self.update_track(subject_id, triangulated.position, size, frame, timestamp_ms);
            debug!(
                subject_id = %subject_id,
                frame,
                reprojection_error = triangulated.reprojection_error,
                activity = ?track.activity,
                "track updated"
            );
            results.push(track.snapshot());
        }
        results
    }

    fn update_track(
        &mut self,
        subject_id: &str,
        position: Vec3,
        size: SubjectSize,
        frame: u64,
        timestamp_ms: i64,
    ) -> &Track {
        let capacity = self.history_capacity;
        let previous = self.tracks.get(subject_id).map(|t| t.position);
        let track = self
            .tracks
            .entry(subject_id.to_string())
            .or_insert_with(|| Track {
                id: subject_id.to_string(),
                position,
                velocity: Vec3::zeros(),
                direction: default_direction(),
                activity: Activity::Standing,
                size,
                last_frame: frame,
                history: History::new(capacity),
            });

        let motion = infer_motion(previous.as_ref(), &track.direction, &position);

        track.position = position;
        track.velocity = motion.velocity;
        track.direction = motion.direction;
        track.activity = motion.activity;
        track.size = size;
        track.last_frame = frame;
        track.history.push(HistoryEntry {
            timestamp: timestamp_ms,
            position: position.into(),
            velocity: motion.velocity.into(),
            activity: motion.activity,
        });
        track
    }

    pub fn get(&self, subject_id: &str) -> Option<&Track> {
        self.tracks.get(subject_id)
    }

    /// id順
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn history(&self, subject_id: &str) -> Option<&History<HistoryEntry>> {
        self.tracks.get(subject_id).map(|t| &t.history)
    }

    /// 見えなくなった被写体を破棄（呼び出し側の判断で行う）
    pub fn forget(&mut self, subject_id: &str) -> bool {
        self.tracks.remove(subject_id).is_some()
    }

    /// `max_idle_frames` より長く更新されていないトラックを破棄し、破棄数を返す
    pub fn forget_stale(&mut self, max_idle_frames: u64) -> usize {
        let current = self.frame_count;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, t| current.saturating_sub(t.last_frame) <= max_idle_frames);
        before - self.tracks.len()
    }
}
