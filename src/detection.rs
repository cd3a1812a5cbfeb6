//! Per-frame 2D detections handed in by the external detector/tracker.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::camera::Frame;

/// 1台のカメラでの被写体の観測
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera_id: String,
    /// バウンディングボックス中心（ピクセル）
    pub point: [f64; 2],
    /// バウンディングボックスの幅・高さ（ピクセル）
    pub size: [f64; 2],
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 { 1.0 }

impl Observation {
    pub fn new(camera_id: impl Into<String>, point: [f64; 2], size: [f64; 2], confidence: f64) -> Self {
        Self {
            camera_id: camera_id.into(),
            point,
            size,
            confidence,
        }
    }
}

/// subject id → そのフレームの全カメラでの観測
///
/// id はカメラ間で同一人物に対応付け済みであること（検出器側の責務）。
pub type Detections = BTreeMap<String, Vec<Observation>>;

/// 1フレーム分の記録（リプレイ用 JSON Lines の1行）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionFrame {
    #[serde(default)]
    pub frame: u64,
    #[serde(default)]
    pub subjects: Detections,
}

/// 外部の2D検出・追跡器
pub trait Detector: Send {
    fn detect(&mut self, frame_index: u64, frames: &[Frame]) -> Result<Detections>;
}
