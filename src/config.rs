use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub visibility: VisibilityConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// 1台分のカメラ設定
///
/// position / direction は必須（キャリブレーション欠落は登録時エラー）。
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 映像ソース（rtsp://, デバイス番号, ファイルパス）
    #[serde(default)]
    pub url: Option<String>,
    /// ワールド座標 [x, y, z]
    pub position: [f64; 3],
    /// 前方ベクトル（正規化前でよい）
    pub direction: [f64; 3],
    /// 画角（度）
    #[serde(default = "default_fov")]
    pub fov: f64,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    /// 内部パラメータ行列 K (row-major 3x3)
    #[serde(default)]
    pub camera_matrix: Option<[[f64; 3]; 3]>,
    /// 歪み係数 [k1, k2, p1, p2, (k3)]
    #[serde(default)]
    pub dist_coeffs: Option<Vec<f64>>,
}

fn default_fov() -> f64 { 60.0 }
fn default_aspect_ratio() -> f64 { 16.0 / 9.0 }

impl CameraConfig {
    pub fn new(id: impl Into<String>, position: [f64; 3], direction: [f64; 3]) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: None,
            position,
            direction,
            fov: default_fov(),
            aspect_ratio: default_aspect_ratio(),
            camera_matrix: None,
            dist_coeffs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// 被写体ごとの履歴長
    #[serde(default = "default_track_buffer")]
    pub track_buffer: usize,
    /// これ未満の検出は三角測量に使わない
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f64,
    /// 平均再投影誤差の上限（ピクセル）。未設定なら棄却しない
    #[serde(default)]
    pub max_reprojection_error: Option<f64>,
}

fn default_track_buffer() -> usize { 30 }
fn default_detection_confidence() -> f64 { 0.5 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_buffer: default_track_buffer(),
            detection_confidence: default_detection_confidence(),
            max_reprojection_error: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisibilityConfig {
    /// これより遠いカメラは対象外（ワールド単位）
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
    /// 構造線を遮蔽判定用の線分にするときの半長
    #[serde(default = "default_segment_half_length")]
    pub segment_half_length: f64,
    /// 視線と構造線がこの距離以内で交差すれば遮蔽とみなす
    #[serde(default = "default_occlusion_tolerance")]
    pub occlusion_tolerance: f64,
    /// ライブフレームが無いときの画像サイズ
    #[serde(default = "default_reference_size")]
    pub reference_width: u32,
    #[serde(default = "default_reference_size")]
    pub reference_height: u32,
}

fn default_max_distance() -> f64 { 10.0 }
fn default_segment_half_length() -> f64 { 10.0 }
fn default_occlusion_tolerance() -> f64 { 0.05 }
fn default_reference_size() -> u32 { 1000 }

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            max_distance: default_max_distance(),
            segment_half_length: default_segment_half_length(),
            occlusion_tolerance: default_occlusion_tolerance(),
            reference_width: default_reference_size(),
            reference_height: default_reference_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SceneConfig {
    /// カメラ前方からこの角度以内の構造を「見えている」とする（度）
    #[serde(default = "default_view_angle")]
    pub view_angle_deg: f64,
}

fn default_view_angle() -> f64 { 180.0 }

impl Default for SceneConfig {
    fn default() -> Self {
        Self { view_angle_deg: default_view_angle() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// 定常時のフレーム間隔（約30fps）
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// フレーム処理エラー後の待機時間
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// 起動直後からトラッキングを有効にするか
    #[serde(default)]
    pub start_running: bool,
}

fn default_frame_interval_ms() -> u64 { 33 }
fn default_error_backoff_ms() -> u64 { 1000 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            start_running: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// ファイルが無ければデフォルト設定（カメラ無し）
    ///
    /// ファイルがあって読めない・パースできない場合はエラー。
    pub fn load_if_present<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
