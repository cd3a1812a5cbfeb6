//! Visibility of a world point from the camera set.
//!
//! Frame test (is the point inside the image and where), line-of-sight
//! occlusion against structural lines, and per-subject camera selection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera::{CameraModel, CameraRegistry, Vec3};
use crate::config::VisibilityConfig;
use crate::scene::StructuralLine;
use crate::tracker::state::CANONICAL_HEIGHT;

/// これ未満の距離なら近景
pub const CLOSE_SHOT_DISTANCE: f64 = 2.0;
/// これを超える距離なら遠景
pub const WIDE_SHOT_DISTANCE: f64 = 7.0;

const PARALLEL_EPSILON: f64 = 1e-10;

/// 画面内での見え方
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameMetrics {
    /// ピクセル座標
    pub image_position: [f64; 2],
    /// 画面中心を原点に [-1, 1] へ正規化した位置
    pub normalized_offset: [f64; 2],
    /// 中心からのずれ（0 = 中心、1 = 端）
    pub center_offset: f64,
    /// カメラ位置からの距離
    pub distance: f64,
    /// 標準身長の人物の見かけの高さ（ピクセル）
    pub apparent_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameVisibility {
    pub visible: bool,
    /// カメラ後方なら None
    #[serde(flatten)]
    pub metrics: Option<FrameMetrics>,
}

impl FrameVisibility {
    fn hidden() -> Self {
        Self { visible: false, metrics: None }
    }
}

/// 光線と線分の最接近
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// 光線上の距離（原点から）
    pub ray_t: f64,
    /// 線分中心からの符号付き距離
    pub segment_s: f64,
    /// 2直線の最接近距離
    pub gap: f64,
}

/// 光線と、中心 `center`・方向 `axis` の直線の共通垂線を求める
///
/// 方向がほぼ平行なら None。範囲判定は呼び出し側が行う。
pub fn ray_segment_intersection(origin: &Vec3, ray_dir: &Vec3, center: &Vec3, axis: &Vec3) -> Option<RayHit> {
    let d = ray_dir.try_normalize(PARALLEL_EPSILON)?;
    let u = axis.try_normalize(PARALLEL_EPSILON)?;

    let n = d.cross(&u);
    if n.norm_squared() < PARALLEL_EPSILON {
        return None;
    }

    let w = center - origin;
    let u_n = u.cross(&n);
    let d_n = d.cross(&n);
    let ray_t = w.dot(&u_n) / d.dot(&u_n);
    let segment_s = (-w).dot(&d_n) / u.dot(&d_n);

    let on_ray = origin + d * ray_t;
    let on_line = center + u * segment_s;
    Some(RayHit {
        ray_t,
        segment_s,
        gap: (on_ray - on_line).norm(),
    })
}

/// 撮影距離による分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotType {
    Close,
    Medium,
    Wide,
}

impl ShotType {
    pub fn from_distance(distance: f64) -> Self {
        if distance < CLOSE_SHOT_DISTANCE {
            ShotType::Close
        } else if distance > WIDE_SHOT_DISTANCE {
            ShotType::Wide
        } else {
            ShotType::Medium
        }
    }
}

/// 被写体を撮れない理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    OutOfRange,
    BehindCamera,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleCamera {
    pub camera_id: String,
    pub distance: f64,
    pub shot_type: ShotType,
    pub position: [f64; 3],
    pub direction: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedCamera {
    pub camera_id: String,
    pub distance: f64,
    pub reason: Rejection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectVisibility {
    pub subject_position: [f64; 3],
    /// 距離の近い順
    pub visible_cameras: Vec<VisibleCamera>,
    pub camera_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedCamera>,
}

/// 可視判定。設定値だけを持ち、カメラと構造線は呼び出しごとに渡す
#[derive(Debug, Clone, Default)]
pub struct VisibilityEngine {
    config: VisibilityConfig,
}

impl VisibilityEngine {
    pub fn new(config: VisibilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    /// 点がカメラ画面内に入るか
    ///
    /// `frame_size` が None なら設定の基準サイズ（既定 1000×1000）を使う。
    /// 後方の点は指標なしで不可視、画面外の点は指標付きで不可視。
    pub fn frame_visibility(
        &self,
        camera: &CameraModel,
        point: &Vec3,
        frame_size: Option<(u32, u32)>,
    ) -> FrameVisibility {
        let Some(projection) = camera.project(point) else {
            return FrameVisibility::hidden();
        };

        let (width, height) = frame_size
            .map(|(w, h)| (f64::from(w), f64::from(h)))
            .unwrap_or((
                f64::from(self.config.reference_width),
                f64::from(self.config.reference_height),
            ));

        let (x, y) = (projection.image.x, projection.image.y);
        let in_frame = (0.0..width).contains(&x) && (0.0..height).contains(&y);

        let half_w = width / 2.0;
        let half_h = height / 2.0;
        let nx = (x - half_w) / half_w;
        let ny = (y - half_h) / half_h;

        FrameVisibility {
            visible: in_frame,
            metrics: Some(FrameMetrics {
                image_position: [x, y],
                normalized_offset: [nx, ny],
                center_offset: (nx * nx + ny * ny).sqrt(),
                distance: (point - camera.position()).norm(),
                apparent_size: camera.focal_length() * CANONICAL_HEIGHT / projection.depth,
            }),
        }
    }

    /// 登録済みカメラで判定。ライブフレームのサイズがあればそれを使う
    pub fn camera_view(&self, registry: &CameraRegistry, camera_id: &str, point: &Vec3) -> Option<FrameVisibility> {
        let camera = registry.get(camera_id)?;
        Some(self.frame_visibility(camera, point, registry.frame_size(camera_id)))
    }

    /// カメラ→対象の視線がいずれかの構造線に遮られるか
    pub fn occlusion_test(&self, camera_position: &Vec3, target: &Vec3, lines: &[StructuralLine]) -> bool {
        let to_target = target - camera_position;
        let distance = to_target.norm();
        if distance < PARALLEL_EPSILON {
            return false;
        }
        let half_length = self.config.segment_half_length;
        let tolerance = self.config.occlusion_tolerance;

        lines.iter().enumerate().any(|(i, line)| {
            let Some(hit) = ray_segment_intersection(camera_position, &to_target, &line.point, &line.direction) else {
                debug!(line = i, "structural line parallel to line of sight");
                return false;
            };
            hit.ray_t >= 0.0
                && hit.ray_t <= distance
                && hit.segment_s.abs() <= half_length
                && hit.gap <= tolerance
        })
    }

    /// 1台のカメラで被写体を撮れるか。撮れるなら距離を返す
    pub fn check_camera(
        &self,
        camera: &CameraModel,
        subject: &Vec3,
        lines: &[StructuralLine],
    ) -> Result<f64, (f64, Rejection)> {
        let to_subject = subject - camera.position();
        let distance = to_subject.norm();

        if distance > self.config.max_distance {
            return Err((distance, Rejection::OutOfRange));
        }
        if camera.direction().dot(&to_subject) <= 0.0 {
            return Err((distance, Rejection::BehindCamera));
        }
        if self.occlusion_test(camera.position(), subject, lines) {
            return Err((distance, Rejection::Blocked));
        }
        Ok(distance)
    }

    /// 被写体を撮れるカメラを近い順に列挙
    pub fn subject_visibility<'a, I>(&self, subject: &Vec3, cameras: I, lines: &[StructuralLine]) -> SubjectVisibility
    where
        I: IntoIterator<Item = &'a CameraModel>,
    {
        let mut visible_cameras = Vec::new();
        let mut rejected = Vec::new();

        for camera in cameras {
            match self.check_camera(camera, subject, lines) {
                Ok(distance) => visible_cameras.push(VisibleCamera {
                    camera_id: camera.id().to_string(),
                    distance,
                    shot_type: ShotType::from_distance(distance),
                    position: (*camera.position()).into(),
                    direction: (*camera.direction()).into(),
                }),
                Err((distance, reason)) => {
                    debug!(camera_id = camera.id(), ?reason, distance, "camera rejected");
                    rejected.push(RejectedCamera {
                        camera_id: camera.id().to_string(),
                        distance,
                        reason,
                    });
                }
            }
        }

        visible_cameras.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        SubjectVisibility {
            subject_position: (*subject).into(),
            camera_count: visible_cameras.len(),
            visible_cameras,
            rejected,
        }
    }
}
