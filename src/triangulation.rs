use nalgebra::DMatrix;
use tracing::debug;

use crate::camera::{CameraModel, CameraRegistry, Vec3};
use crate::config::TrackerConfig;
use crate::detection::Observation;
use crate::error::TriangulationError;

/// 同次座標 w がこれ以下なら無限遠（平行な光線）とみなす
const MIN_HOMOGENEOUS_W: f64 = 1e-10;

/// 単一3D点のDLT三角測量
///
/// 各カメラについて `u * P[2] - P[0]`, `v * P[2] - P[1]` の2行を積み、
/// 2N×4 行列の最小特異値に対応する右特異ベクトルを同次化して返す。
pub fn triangulate_point(
    cameras: &[&CameraModel],
    points_2d: &[(f64, f64)],
) -> Result<Vec3, TriangulationError> {
    let n = cameras.len().min(points_2d.len());
    if n < 2 {
        return Err(TriangulationError::InsufficientViews(n));
    }

    let mut a = DMatrix::<f64>::zeros(2 * n, 4);
    for (i, (cam, &(u, v))) in cameras.iter().zip(points_2d.iter()).enumerate() {
        let p = cam.projection_matrix();
        a.row_mut(2 * i).copy_from(&(p.row(2) * u - p.row(0)));
        a.row_mut(2 * i + 1).copy_from(&(p.row(2) * v - p.row(1)));
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(TriangulationError::Degenerate)?;
    let min_idx = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| x.total_cmp(y))
        .map(|(i, _)| i)
        .ok_or(TriangulationError::Degenerate)?;

    let x = v_t.row(min_idx);
    let w = x[3];
    if !w.is_finite() || w.abs() < MIN_HOMOGENEOUS_W {
        return Err(TriangulationError::Degenerate);
    }

    let point = Vec3::new(x[0] / w, x[1] / w, x[2] / w);
    if !point.iter().all(|c| c.is_finite()) {
        return Err(TriangulationError::Degenerate);
    }
    Ok(point)
}

/// 平均再投影誤差（ピクセル）。どれかのカメラの後方にある点は無限大
pub fn reprojection_error(cameras: &[&CameraModel], points_2d: &[(f64, f64)], point: &Vec3) -> f64 {
    let n = cameras.len().min(points_2d.len());
    if n == 0 {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for (cam, &(u, v)) in cameras.iter().zip(points_2d.iter()) {
        match cam.project(point) {
            Some(p) => sum += ((p.image.x - u).powi(2) + (p.image.y - v).powi(2)).sqrt(),
            None => return f64::INFINITY,
        }
    }
    sum / n as f64
}

/// 三角測量結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangulated {
    pub position: Vec3,
    pub reprojection_error: f64,
    /// 使用したカメラ数
    pub views: usize,
}

/// 観測リストから3D位置を求める
#[derive(Debug, Clone)]
pub struct Triangulator {
    min_confidence: f64,
    max_reprojection_error: Option<f64>,
}

impl Triangulator {
    pub fn new(min_confidence: f64, max_reprojection_error: Option<f64>) -> Self {
        Self {
            min_confidence,
            max_reprojection_error,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.detection_confidence, config.max_reprojection_error)
    }

    /// 三角測量に使う観測と、そのカメラの組
    ///
    /// 信頼度が閾値未満の観測と、未登録カメラの観測を除く。
    pub fn usable<'a>(
        &'a self,
        registry: &'a CameraRegistry,
        observations: &'a [Observation],
    ) -> impl Iterator<Item = (&'a Observation, &'a CameraModel)> + 'a {
        observations
            .iter()
            .filter(move |obs| obs.confidence >= self.min_confidence)
            .filter_map(move |obs| match registry.get(&obs.camera_id) {
                Some(cam) => Some((obs, cam.as_ref())),
                None => {
                    debug!(camera_id = %obs.camera_id, "observation from unknown camera skipped");
                    None
                }
            })
    }

    /// - 未登録カメラ・低信頼度の観測は捨てる
    /// - 歪み係数があるカメラは歪み補正してから使う
    /// - 有効な観測が2未満なら失敗
    pub fn triangulate(
        &self,
        registry: &CameraRegistry,
        observations: &[Observation],
    ) -> Result<Triangulated, TriangulationError> {
        let mut cameras = Vec::with_capacity(observations.len());
        let mut points = Vec::with_capacity(observations.len());

        for (obs, cam) in self.usable(registry, observations) {
            cameras.push(cam);
            points.push(cam.undistort_point(obs.point[0], obs.point[1]));
        }

        let position = triangulate_point(&cameras, &points)?;
        let error = reprojection_error(&cameras, &points, &position);

        if let Some(limit) = self.max_reprojection_error {
            if !(error < limit) {
                return Err(TriangulationError::ReprojectionError { error, limit });
            }
        }

        Ok(Triangulated {
            position,
            reprojection_error: error,
            views: cameras.len(),
        })
    }
}

impl Default for Triangulator {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}
