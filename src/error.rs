use thiserror::Error;

/// カメラ登録時の設定エラー（致命的。デフォルト値で黙って補わない）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("camera id must not be empty")]
    EmptyCameraId,

    #[error("camera {0} is registered twice")]
    DuplicateCamera(String),

    #[error("camera {camera_id}: direction must be a finite non-zero vector, got {direction:?}")]
    DegenerateDirection {
        camera_id: String,
        direction: [f64; 3],
    },

    #[error("camera {camera_id}: field of view must be in (0, 180) degrees, got {fov}")]
    InvalidFov { camera_id: String, fov: f64 },

    #[error("camera {camera_id}: aspect ratio must be positive, got {aspect_ratio}")]
    InvalidAspectRatio { camera_id: String, aspect_ratio: f64 },

    #[error("camera {camera_id}: intrinsic matrix has zero focal length")]
    InvalidIntrinsic { camera_id: String },

    #[error("camera {camera_id}: expected 4 or 5 distortion coefficients, got {count}")]
    InvalidDistortion { camera_id: String, count: usize },

    #[error("camera {0} is not registered")]
    UnknownCamera(String),
}

/// 三角測量の失敗理由（そのフレームのみスキップする一時的な失敗）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TriangulationError {
    #[error("need at least 2 usable views, got {0}")]
    InsufficientViews(usize),

    #[error("degenerate configuration (parallel rays or homogeneous w ~ 0)")]
    Degenerate,

    #[error("mean reprojection error {error:.2}px exceeds {limit:.2}px")]
    ReprojectionError { error: f64, limit: f64 },
}
