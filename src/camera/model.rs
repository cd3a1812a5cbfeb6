use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};
use once_cell::sync::OnceCell;

use crate::config::CameraConfig;
use crate::error::ConfigError;

pub type Vec3 = Vector3<f64>;

/// 内部パラメータ合成時に仮定する画像サイズ（ピクセル）
pub const REFERENCE_WIDTH: f64 = 1000.0;
pub const REFERENCE_HEIGHT: f64 = 1000.0;

/// 前方ベクトルのY成分がこれ以上なら補助upベクトルにZ軸を使う
const VERTICAL_FORWARD_LIMIT: f64 = 0.9;

/// 遅延計算して使い回す値
///
/// 入力が変わったら `invalidate` でセルごと作り直す（中身を書き換えない）。
#[derive(Debug, Clone, Default)]
pub struct Cached<T> {
    cell: OnceCell<T>,
}

impl<T> Cached<T> {
    pub fn new() -> Self {
        Self { cell: OnceCell::new() }
    }

    pub fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        self.cell.get_or_init(f)
    }

    pub fn is_computed(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn invalidate(&mut self) {
        self.cell = OnceCell::new();
    }
}

/// 投影結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// ピクセル座標
    pub image: Vector2<f64>,
    /// カメラ前方への距離（光学座標系のz）
    pub depth: f64,
}

/// 位置・向きからカメラ姿勢行列 [R | position] を構築
///
/// z軸 = -forward、up は通常ワールドY軸、ほぼ鉛直を向くときはZ軸。
/// direction がゼロベクトル（または非有限）なら None。
pub fn look_at(position: &Vec3, direction: &Vec3) -> Option<Matrix4<f64>> {
    if !direction.iter().all(|v| v.is_finite()) {
        return None;
    }
    let forward = direction.try_normalize(1e-12)?;

    let up = if forward.y.abs() < VERTICAL_FORWARD_LIMIT {
        Vec3::y()
    } else {
        Vec3::z()
    };

    let z_axis = -forward;
    let x_axis = up.cross(&z_axis).normalize();
    let y_axis = z_axis.cross(&x_axis);

    let rotation = Matrix3::from_columns(&[x_axis, y_axis, z_axis]);
    let mut transform = Matrix4::identity();
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    transform.fixed_view_mut::<3, 1>(0, 3).copy_from(position);
    Some(transform)
}

/// look-at座標系（-z前方, y上）→ 光学座標系（z前方, y下）
fn optical_flip() -> Matrix3<f64> {
    Matrix3::from_diagonal(&Vec3::new(1.0, -1.0, -1.0))
}

/// 固定カメラ1台のモデル
#[derive(Debug, Clone)]
pub struct CameraModel {
    id: String,
    name: Option<String>,
    url: Option<String>,
    position: Vec3,
    /// 常に単位ベクトル
    direction: Vec3,
    fov: f64,
    aspect_ratio: f64,
    explicit_intrinsic: Option<Matrix3<f64>>,
    /// [k1, k2, p1, p2, k3]
    dist_coeffs: Option<[f64; 5]>,
    intrinsic: Cached<Matrix3<f64>>,
    extrinsic: Cached<Matrix4<f64>>,
    projection: Cached<Matrix3x4<f64>>,
}

impl CameraModel {
    pub fn from_config(config: &CameraConfig) -> Result<Self, ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::EmptyCameraId);
        }
        let id = config.id.clone();

        if !(config.fov > 0.0 && config.fov < 180.0) {
            return Err(ConfigError::InvalidFov { camera_id: id, fov: config.fov });
        }
        if !(config.aspect_ratio > 0.0 && config.aspect_ratio.is_finite()) {
            return Err(ConfigError::InvalidAspectRatio {
                camera_id: id,
                aspect_ratio: config.aspect_ratio,
            });
        }

        let direction = normalize_direction(&id, config.direction)?;

        // row-major → nalgebra
        let explicit_intrinsic = match config.camera_matrix {
            Some(k) => {
                let m = Matrix3::from_fn(|r, c| k[r][c]);
                if m[(0, 0)].abs() < f64::EPSILON || m[(1, 1)].abs() < f64::EPSILON {
                    return Err(ConfigError::InvalidIntrinsic { camera_id: id });
                }
                Some(m)
            }
            None => None,
        };

        let dist_coeffs = match &config.dist_coeffs {
            None => None,
            Some(d) if d.len() == 4 => Some([d[0], d[1], d[2], d[3], 0.0]),
            Some(d) if d.len() == 5 => Some([d[0], d[1], d[2], d[3], d[4]]),
            Some(d) => {
                return Err(ConfigError::InvalidDistortion { camera_id: id, count: d.len() })
            }
        };

        Ok(Self {
            id,
            name: config.name.clone(),
            url: config.url.clone(),
            position: Vec3::from(config.position),
            direction,
            fov: config.fov,
            aspect_ratio: config.aspect_ratio,
            explicit_intrinsic,
            dist_coeffs,
            intrinsic: Cached::new(),
            extrinsic: Cached::new(),
            projection: Cached::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 表示名（未設定なら id）
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn position(&self) -> &Vec3 {
        &self.position
    }

    pub fn direction(&self) -> &Vec3 {
        &self.direction
    }

    pub fn fov(&self) -> f64 {
        self.fov
    }

    /// 位置・向きを変更し、姿勢に依存するキャッシュを破棄する
    pub fn set_pose(&mut self, position: Vec3, direction: Vec3) -> Result<(), ConfigError> {
        self.direction = normalize_direction(&self.id, direction.into())?;
        self.position = position;
        self.extrinsic.invalidate();
        self.projection.invalidate();
        Ok(())
    }

    /// 姿勢だけ変えた新しいモデルを返す（共有中のモデルは変更しない）
    pub fn with_pose(&self, position: Vec3, direction: Vec3) -> Result<Self, ConfigError> {
        let mut model = self.clone();
        model.set_pose(position, direction)?;
        Ok(model)
    }

    /// 内部パラメータ行列 K
    ///
    /// 明示指定が無ければ FOV とアスペクト比から合成する:
    /// focal = 1/tan(FOV/2), K = [[focal*W, 0, W/2], [0, focal*W/aspect, H/2], [0, 0, 1]]
    pub fn intrinsic_matrix(&self) -> &Matrix3<f64> {
        self.intrinsic.get_or_init(|| match self.explicit_intrinsic {
            Some(k) => k,
            None => {
                let focal = 1.0 / (self.fov.to_radians() / 2.0).tan();
                Matrix3::new(
                    focal * REFERENCE_WIDTH, 0.0, REFERENCE_WIDTH / 2.0,
                    0.0, focal * REFERENCE_WIDTH / self.aspect_ratio, REFERENCE_HEIGHT / 2.0,
                    0.0, 0.0, 1.0,
                )
            }
        })
    }

    /// カメラ姿勢 [R | position]（列が x, y, z 軸）
    pub fn extrinsic_matrix(&self) -> &Matrix4<f64> {
        self.extrinsic.get_or_init(|| {
            // direction は構築時・set_pose時に検証済み
            look_at(&self.position, &self.direction).unwrap_or_else(Matrix4::identity)
        })
    }

    /// ワールド → look-at カメラ座標系（extrinsic の逆変換）
    pub fn world_to_camera(&self) -> Matrix4<f64> {
        let pose = self.extrinsic_matrix();
        let r_t = pose.fixed_view::<3, 3>(0, 0).transpose();
        let t = -(r_t * pose.fixed_view::<3, 1>(0, 3));
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_t);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        m
    }

    /// 射影行列 P = K * [R | t]（光学座標系）
    pub fn projection_matrix(&self) -> &Matrix3x4<f64> {
        self.projection.get_or_init(|| {
            let w2c = self.world_to_camera();
            let flip = optical_flip();
            let mut rt = Matrix3x4::zeros();
            rt.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(flip * w2c.fixed_view::<3, 3>(0, 0)));
            rt.fixed_view_mut::<3, 1>(0, 3)
                .copy_from(&(flip * w2c.fixed_view::<3, 1>(0, 3)));
            self.intrinsic_matrix() * rt
        })
    }

    /// ワールド座標 → 光学座標系（x右, y下, z前方）
    pub fn to_camera(&self, world: &Vec3) -> Vec3 {
        let w2c = self.world_to_camera();
        let look_at_space = w2c.fixed_view::<3, 3>(0, 0) * world + w2c.fixed_view::<3, 1>(0, 3);
        optical_flip() * look_at_space
    }

    /// ワールド座標をピクセル座標へ投影。カメラの後方（depth <= 0）なら None
    pub fn project(&self, world: &Vec3) -> Option<Projection> {
        let cam = self.to_camera(world);
        if cam.z <= 0.0 {
            return None;
        }
        let normalized = Vec3::new(cam.x / cam.z, cam.y / cam.z, 1.0);
        let image = self.intrinsic_matrix() * normalized;
        Some(Projection {
            image: Vector2::new(image.x / image.z, image.y / image.z),
            depth: cam.z,
        })
    }

    pub fn focal_length(&self) -> f64 {
        self.intrinsic_matrix()[(0, 0)]
    }

    /// 歪んだピクセル座標を理想ピクセル座標に変換
    /// Newton-Raphson法で順方向の歪みモデルを逆に解く
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = match self.dist_coeffs {
            Some(d) if d.iter().any(|c| *c != 0.0) => d,
            _ => return (u_dist, v_dist),
        };

        let k = self.intrinsic_matrix();
        let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);

        let xd = (u_dist - cx) / fx;
        let yd = (v_dist - cy) / fy;

        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
            let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            if residual < 1e-18 {
                break;
            }

            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-14 {
                break;
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j01 * fx_val + j00 * fy_val) / det;
        }

        (best.0 * fx + cx, best.1 * fy + cy)
    }
}

fn normalize_direction(camera_id: &str, direction: [f64; 3]) -> Result<Vec3, ConfigError> {
    let v = Vec3::from(direction);
    let degenerate = || ConfigError::DegenerateDirection {
        camera_id: camera_id.to_string(),
        direction,
    };
    if !v.iter().all(|c| c.is_finite()) {
        return Err(degenerate());
    }
    v.try_normalize(1e-12).ok_or_else(degenerate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(position: [f64; 3], direction: [f64; 3]) -> CameraModel {
        CameraModel::from_config(&CameraConfig::new("cam", position, direction)).unwrap()
    }

    fn assert_orthonormal(m: &Matrix4<f64>) {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        for i in 0..3 {
            assert!((r.column(i).norm() - 1.0).abs() < 1e-9, "column {} not unit: {}", i, r);
            for j in (i + 1)..3 {
                assert!(r.column(i).dot(&r.column(j)).abs() < 1e-9, "columns {} {} not orthogonal", i, j);
            }
        }
        assert!((r.determinant() - 1.0).abs() < 1e-9);
        assert!(m.try_inverse().is_some());
    }

    #[test]
    fn test_extrinsic_orthonormal_for_many_directions() {
        let directions = [
            [0.0, 0.0, -1.0],
            [-1.0, 0.0, 0.0],
            [1.0, 2.0, 3.0],
            [0.0, 1.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.1, -0.95, 0.2],
            [0.0, 0.9, 0.4358898943540674],
            [-3.0, 0.5, 1e-6],
        ];
        for d in directions {
            let pose = look_at(&Vec3::new(1.0, 2.0, 3.0), &Vec3::from(d)).unwrap();
            assert_orthonormal(&pose);
        }
    }

    #[test]
    fn test_look_at_zero_direction() {
        assert!(look_at(&Vec3::zeros(), &Vec3::zeros()).is_none());
    }

    #[test]
    fn test_look_at_axes() {
        let pose = look_at(&Vec3::new(0.0, 0.0, 5.0), &Vec3::new(0.0, 0.0, -1.0)).unwrap();
        // z軸 = -forward = +Z, x軸 = Y × Z = +X
        assert!((pose.fixed_view::<3, 1>(0, 2) - Vec3::z()).norm() < 1e-12);
        assert!((pose.fixed_view::<3, 1>(0, 0) - Vec3::x()).norm() < 1e-12);
        assert!((pose.fixed_view::<3, 1>(0, 3) - Vec3::new(0.0, 0.0, 5.0)).norm() < 1e-12);
    }

    #[test]
    fn test_direction_renormalized() {
        let cam = camera([0.0, 0.0, 0.0], [0.0, 0.0, -10.0]);
        assert!((cam.direction().norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_direction_rejected() {
        let result = CameraModel::from_config(&CameraConfig::new("bad", [0.0; 3], [0.0; 3]));
        assert!(matches!(result, Err(ConfigError::DegenerateDirection { .. })));

        let result = CameraModel::from_config(&CameraConfig::new("nan", [0.0; 3], [f64::NAN, 0.0, 1.0]));
        assert!(matches!(result, Err(ConfigError::DegenerateDirection { .. })));
    }

    #[test]
    fn test_invalid_fov_and_aspect() {
        let mut config = CameraConfig::new("cam", [0.0; 3], [0.0, 0.0, 1.0]);
        config.fov = 0.0;
        assert!(matches!(CameraModel::from_config(&config), Err(ConfigError::InvalidFov { .. })));

        config.fov = 60.0;
        config.aspect_ratio = -1.0;
        assert!(matches!(
            CameraModel::from_config(&config),
            Err(ConfigError::InvalidAspectRatio { .. })
        ));
    }

    #[test]
    fn test_synthesized_intrinsic() {
        let mut config = CameraConfig::new("cam", [0.0; 3], [0.0, 0.0, 1.0]);
        config.fov = 90.0;
        config.aspect_ratio = 2.0;
        let cam = CameraModel::from_config(&config).unwrap();
        let k = cam.intrinsic_matrix();
        // tan(45°) = 1 → focal = 1
        assert!((k[(0, 0)] - 1000.0).abs() < 1e-9);
        assert!((k[(1, 1)] - 500.0).abs() < 1e-9);
        assert_eq!(k[(0, 2)], 500.0);
        assert_eq!(k[(1, 2)], 500.0);
        assert_eq!(k[(2, 2)], 1.0);
    }

    #[test]
    fn test_explicit_intrinsic_used() {
        let mut config = CameraConfig::new("cam", [0.0; 3], [0.0, 0.0, 1.0]);
        config.camera_matrix = Some([[800.0, 0.0, 320.0], [0.0, 810.0, 240.0], [0.0, 0.0, 1.0]]);
        let cam = CameraModel::from_config(&config).unwrap();
        assert_eq!(cam.intrinsic_matrix()[(0, 2)], 320.0);
        assert_eq!(cam.intrinsic_matrix()[(1, 1)], 810.0);
    }

    #[test]
    fn test_project_center_and_behind() {
        let cam = camera([0.0, 0.0, 5.0], [0.0, 0.0, -1.0]);

        let p = cam.project(&Vec3::zeros()).unwrap();
        assert!((p.image.x - 500.0).abs() < 1e-9);
        assert!((p.image.y - 500.0).abs() < 1e-9);
        assert!((p.depth - 5.0).abs() < 1e-9);

        // カメラの真後ろ
        assert!(cam.project(&Vec3::new(0.0, 0.0, 10.0)).is_none());
    }

    #[test]
    fn test_project_image_axes() {
        let cam = camera([0.0, 0.0, 5.0], [0.0, 0.0, -1.0]);
        // ワールド+X は画像右、ワールド+Y（上）は画像上（v が小さい）
        let right = cam.project(&Vec3::new(1.0, 0.0, 0.0)).unwrap();
        let up = cam.project(&Vec3::new(0.0, 1.0, 0.0)).unwrap();
        assert!(right.image.x > 500.0);
        assert!(up.image.y < 500.0);
    }

    #[test]
    fn test_projection_matrix_matches_project() {
        let cam = camera([2.0, 1.5, 4.0], [-0.4, -0.2, -1.0]);
        let point = Vec3::new(0.3, 0.8, -0.5);
        let projected = cam.project(&point).unwrap();

        let h = cam.projection_matrix() * point.push(1.0);
        assert!((h.x / h.z - projected.image.x).abs() < 1e-6);
        assert!((h.y / h.z - projected.image.y).abs() < 1e-6);
    }

    #[test]
    fn test_set_pose_invalidates_cache() {
        let mut cam = camera([0.0, 0.0, 5.0], [0.0, 0.0, -1.0]);
        let before = *cam.extrinsic_matrix();
        let _ = cam.projection_matrix();

        cam.set_pose(Vec3::new(5.0, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0)).unwrap();
        let after = *cam.extrinsic_matrix();

        assert_ne!(before, after);
        assert!((after.fixed_view::<3, 1>(0, 3) - Vec3::new(5.0, 0.0, 0.0)).norm() < 1e-12);
        assert!((cam.direction() - Vec3::new(-1.0, 0.0, 0.0)).norm() < 1e-12);
        // 新しい姿勢で投影できる
        let p = cam.project(&Vec3::zeros()).unwrap();
        assert!((p.depth - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_pose_rejects_zero_direction() {
        let mut cam = camera([0.0, 0.0, 5.0], [0.0, 0.0, -1.0]);
        assert!(cam.set_pose(Vec3::zeros(), Vec3::zeros()).is_err());
        // 失敗時は元の姿勢のまま
        assert!((cam.position() - Vec3::new(0.0, 0.0, 5.0)).norm() < 1e-12);
    }

    #[test]
    fn test_cached_invalidate() {
        let mut cached: Cached<u32> = Cached::new();
        assert!(!cached.is_computed());
        assert_eq!(*cached.get_or_init(|| 1), 1);
        assert_eq!(*cached.get_or_init(|| 2), 1);
        cached.invalidate();
        assert_eq!(*cached.get_or_init(|| 3), 3);
    }

    #[test]
    fn test_undistort_identity_without_coeffs() {
        let cam = camera([0.0; 3], [0.0, 0.0, 1.0]);
        assert_eq!(cam.undistort_point(123.0, 456.0), (123.0, 456.0));
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let mut config = CameraConfig::new("cam", [0.0; 3], [0.0, 0.0, 1.0]);
        config.dist_coeffs = Some(vec![0.1, -0.05, 0.001, -0.002, 0.01]);
        let cam = CameraModel::from_config(&config).unwrap();
        let k = *cam.intrinsic_matrix();

        // 理想点 → 順方向の歪みモデル → 歪み補正
        let (x, y) = (0.2, -0.15);
        let r2: f64 = x * x + y * y;
        let radial = 1.0 + 0.1 * r2 - 0.05 * r2 * r2 + 0.01 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * 0.001 * x * y + -0.002 * (r2 + 2.0 * x * x);
        let yd = y * radial + 0.001 * (r2 + 2.0 * y * y) + 2.0 * -0.002 * x * y;
        let u = xd * k[(0, 0)] + k[(0, 2)];
        let v = yd * k[(1, 1)] + k[(1, 2)];

        let (uu, vu) = cam.undistort_point(u, v);
        assert!((uu - (x * k[(0, 0)] + k[(0, 2)])).abs() < 1e-6);
        assert!((vu - (y * k[(1, 1)] + k[(1, 2)])).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_distortion_length() {
        let mut config = CameraConfig::new("cam", [0.0; 3], [0.0, 0.0, 1.0]);
        config.dist_coeffs = Some(vec![0.1, 0.2]);
        assert!(matches!(
            CameraModel::from_config(&config),
            Err(ConfigError::InvalidDistortion { count: 2, .. })
        ));
    }
}
