//! Shot labels of a camera relative to the scene's structures.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::camera::{CameraModel, Vec3};

/// 主軸とのなす角がこれ未満なら正面
const FRONT_ANGLE_DEG: f64 = 30.0;
/// これを超えれば背面
const BACK_ANGLE_DEG: f64 = 150.0;
/// 前方ベクトルのY成分の閾値（俯瞰/あおり）
const VERTICAL_LIMIT: f64 = 0.4;
const CLOSE_UP_DISTANCE: f64 = 1.5;
const CLOSE_UP_MAX_STRUCTURES: usize = 10;
const WIDE_DISTANCE: f64 = 4.0;
const WIDE_MIN_STRUCTURES: usize = 20;

const DEGENERATE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Horizontal {
    Front,
    Back,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Vertical {
    HighAngle,
    Level,
    LowAngle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scale {
    CloseUp,
    Medium,
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewLabel {
    pub horizontal: Horizontal,
    pub vertical: Vertical,
    pub scale: Scale,
}

/// カメラのショット分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShotLabel {
    /// 見えている構造が1つもない
    NoView,
    View(ViewLabel),
}

impl std::fmt::Display for ShotLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShotLabel::NoView => write!(f, "no-view"),
            ShotLabel::View(v) => {
                let h = match v.horizontal {
                    Horizontal::Front => "front",
                    Horizontal::Back => "back",
                    Horizontal::Left => "left",
                    Horizontal::Right => "right",
                };
                let vert = match v.vertical {
                    Vertical::HighAngle => "high-angle",
                    Vertical::Level => "level",
                    Vertical::LowAngle => "low-angle",
                };
                let s = match v.scale {
                    Scale::CloseUp => "close-up",
                    Scale::Medium => "medium",
                    Scale::Wide => "wide",
                };
                write!(f, "{h} {vert} {s}")
            }
        }
    }
}

/// 構造重心の第1主成分（共分散行列の最大固有値の固有ベクトル）
///
/// 重心が2未満、または広がりが無い場合はワールドX軸。
pub fn main_axis(centroids: &[Vec3]) -> Vec3 {
    if centroids.len() < 2 {
        return Vec3::x();
    }

    let n = centroids.len() as f64;
    let mean = centroids.iter().fold(Vec3::zeros(), |acc, c| acc + c) / n;
    let covariance = centroids
        .iter()
        .map(|c| {
            let d = c - mean;
            d * d.transpose()
        })
        .fold(Matrix3::zeros(), |acc, m| acc + m)
        / n;

    let eigen = covariance.symmetric_eigen();
    let (index, largest) = eigen
        .eigenvalues
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });

    if !(largest > DEGENERATE_EPSILON) {
        return Vec3::x();
    }
    let axis: Vec3 = eigen.eigenvectors.column(index).into_owned();
    let Some(axis) = axis.try_normalize(DEGENERATE_EPSILON) else {
        return Vec3::x();
    };

    // 固有ベクトルの符号は不定。絶対値最大の成分を正にそろえる
    if axis.iter().copied().fold(0.0_f64, |m, v| if v.abs() > m.abs() { v } else { m }) < 0.0 {
        -axis
    } else {
        axis
    }
}

/// カメラ前方から `angle_deg` 以内にある構造のインデックス
pub fn visible_structures(camera: &CameraModel, centroids: &[Vec3], angle_deg: f64) -> Vec<usize> {
    let threshold = angle_deg.to_radians();
    centroids
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let to_structure = (c - camera.position()).try_normalize(DEGENERATE_EPSILON)?;
            let angle = camera.direction().dot(&to_structure).clamp(-1.0, 1.0).acos();
            (angle < threshold).then_some(i)
        })
        .collect()
}

fn classify_horizontal(direction: &Vec3, axis: &Vec3) -> Horizontal {
    let cam = nalgebra::Vector2::new(direction.x, direction.z);
    let main = nalgebra::Vector2::new(axis.x, axis.z);
    let (Some(cam), Some(main)) = (
        cam.try_normalize(DEGENERATE_EPSILON),
        main.try_normalize(DEGENERATE_EPSILON),
    ) else {
        return Horizontal::Front;
    };

    let angle = cam.dot(&main).clamp(-1.0, 1.0).acos().to_degrees();
    let cross = main.x * cam.y - main.y * cam.x;

    if angle < FRONT_ANGLE_DEG {
        Horizontal::Front
    } else if angle > BACK_ANGLE_DEG {
        Horizontal::Back
    } else if cross > 0.0 {
        Horizontal::Left
    } else {
        Horizontal::Right
    }
}

fn classify_vertical(direction: &Vec3) -> Vertical {
    if direction.y < -VERTICAL_LIMIT {
        Vertical::HighAngle
    } else if direction.y > VERTICAL_LIMIT {
        Vertical::LowAngle
    } else {
        Vertical::Level
    }
}

fn classify_scale(distance: f64, count: usize) -> Scale {
    if distance < CLOSE_UP_DISTANCE && count < CLOSE_UP_MAX_STRUCTURES {
        Scale::CloseUp
    } else if distance > WIDE_DISTANCE && count > WIDE_MIN_STRUCTURES {
        Scale::Wide
    } else {
        Scale::Medium
    }
}

/// 見えている構造（`visible` は `centroids` のインデックス）に対するショット分類
pub fn classify(camera: &CameraModel, visible: &[usize], centroids: &[Vec3], axis: &Vec3) -> ShotLabel {
    let seen: Vec<&Vec3> = visible.iter().filter_map(|&i| centroids.get(i)).collect();
    if seen.is_empty() {
        return ShotLabel::NoView;
    }

    let mean = seen.iter().fold(Vec3::zeros(), |acc, c| acc + *c) / seen.len() as f64;
    let distance = (camera.position() - mean).norm();

    ShotLabel::View(ViewLabel {
        horizontal: classify_horizontal(camera.direction(), axis),
        vertical: classify_vertical(camera.direction()),
        scale: classify_scale(distance, seen.len()),
    })
}
