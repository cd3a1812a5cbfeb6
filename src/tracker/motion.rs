use serde::{Deserialize, Serialize};

use crate::camera::Vec3;

/// これを超える1フレームの移動量で「移動中」（単位/フレーム）
pub const MOVING_SPEED: f64 = 0.05;
/// これを超えると走っている
pub const RUNNING_SPEED: f64 = 0.3;
/// 向きを更新する最小の水平移動量
pub const MIN_HORIZONTAL_SPEED: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    #[default]
    Standing,
    Walking,
    Running,
}

/// 一度も動いていない被写体の向き
pub fn default_direction() -> Vec3 {
    Vec3::x()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    /// 1フレームあたりの変位（正規化しない）
    pub velocity: Vec3,
    /// 水平面に射影した単位ベクトル
    pub direction: Vec3,
    pub activity: Activity,
}

/// 前フレームの位置との差分から速度・向き・状態を推定
///
/// - 移動量 <= 0.05: 静止（速度ゼロ、向きは前回のまま）
/// - 移動量 > 0.05: 速度 = 変位。水平移動 > 0.01 なら向きを更新し、
///   0.3 を超えれば running、それ以外は walking
/// - 垂直方向だけの移動は standing のまま
pub fn infer_motion(previous: Option<&Vec3>, previous_direction: &Vec3, current: &Vec3) -> Motion {
    let mut motion = Motion {
        velocity: Vec3::zeros(),
        direction: *previous_direction,
        activity: Activity::Standing,
    };

    let Some(previous) = previous else {
        return motion;
    };

    let displacement = current - previous;
    let speed = displacement.norm();
    if !(speed > MOVING_SPEED) {
        return motion;
    }

    motion.velocity = displacement;

    let horizontal = Vec3::new(displacement.x, 0.0, displacement.z);
    let horizontal_speed = horizontal.norm();
    if horizontal_speed > MIN_HORIZONTAL_SPEED {
        motion.direction = horizontal / horizontal_speed;
        motion.activity = if speed > RUNNING_SPEED {
            Activity::Running
        } else {
            Activity::Walking
        };
    }

    motion
}
