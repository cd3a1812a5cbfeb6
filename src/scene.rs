//! Scene geometry (structures and structural lines) and the scene/subject
//! analysis built on top of the camera registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::camera::{CameraRegistry, Vec3};
use crate::config::{CameraConfig, SceneConfig};
use crate::error::ConfigError;
use crate::shot::{self, ShotLabel};
use crate::visibility::{SubjectVisibility, VisibilityEngine};

/// 法線の外積がこれ未満の平面対は平行とみなす
const PARALLEL_PLANES_EPSILON: f64 = 1e-6;

/// 点群クラスタ（外部で抽出済み）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub id: usize,
    pub center: [f64; 3],
    #[serde(default)]
    pub point_count: usize,
}

impl Structure {
    pub fn centroid(&self) -> Vec3 {
        Vec3::from(self.center)
    }
}

/// 遮蔽判定に使う構造線（点 + 単位方向）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralLine {
    pub point: Vec3,
    pub direction: Vec3,
}

impl StructuralLine {
    /// 方向がゼロなら None
    pub fn new(point: Vec3, direction: Vec3) -> Option<Self> {
        let direction = direction.try_normalize(1e-12)?;
        Some(Self { point, direction })
    }

    /// 2平面 `ax + by + cz + d = 0` の交線
    ///
    /// 方向は法線の外積、点は2平面と `direction·p = 0` の連立解。
    /// ほぼ平行な平面なら None。
    pub fn from_planes(plane1: [f64; 4], plane2: [f64; 4]) -> Option<Self> {
        let n1 = Vector3::new(plane1[0], plane1[1], plane1[2]);
        let n2 = Vector3::new(plane2[0], plane2[1], plane2[2]);

        let cross = n1.cross(&n2);
        if cross.norm() < PARALLEL_PLANES_EPSILON {
            return None;
        }
        let direction = cross.normalize();

        let a = Matrix3::from_rows(&[n1.transpose(), n2.transpose(), direction.transpose()]);
        let b = Vector3::new(-plane1[3], -plane2[3], 0.0);
        let point = a.lu().solve(&b)?;
        Some(Self { point, direction })
    }

    /// 平面リストの全ペアから交線を作る
    pub fn from_plane_set(planes: &[[f64; 4]]) -> Vec<Self> {
        let mut lines = Vec::new();
        for (i, p1) in planes.iter().enumerate() {
            for p2 in &planes[i + 1..] {
                if let Some(line) = Self::from_planes(*p1, *p2) {
                    lines.push(line);
                }
            }
        }
        lines
    }
}

/// 構造と構造線。読み取り専用
#[derive(Debug, Clone, Default)]
pub struct Scene {
    structures: Vec<Structure>,
    lines: Vec<StructuralLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraAnalysis {
    pub position: [f64; 3],
    pub direction: [f64; 3],
    pub label: ShotLabel,
    /// 見えている構造の id
    pub visible_structures: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineRecord {
    pub id: usize,
    pub point: [f64; 3],
    pub direction: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneAnalysis {
    pub cameras: BTreeMap<String, CameraAnalysis>,
    pub structures: Vec<Structure>,
    pub structural_lines: Vec<LineRecord>,
}

impl Scene {
    pub fn new(structures: Vec<Structure>, lines: Vec<StructuralLine>) -> Self {
        Self { structures, lines }
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn lines(&self) -> &[StructuralLine] {
        &self.lines
    }

    pub fn centroids(&self) -> Vec<Vec3> {
        self.structures.iter().map(Structure::centroid).collect()
    }

    /// 全カメラのショット分類
    pub fn analyze_scene(&self, registry: &CameraRegistry, config: &SceneConfig) -> SceneAnalysis {
        let centroids = self.centroids();
        let axis = shot::main_axis(&centroids);
        debug!(structures = centroids.len(), ?axis, "scene main axis");

        let cameras = registry
            .iter()
            .map(|camera| {
                let visible = shot::visible_structures(camera, &centroids, config.view_angle_deg);
                let label = shot::classify(camera, &visible, &centroids, &axis);
                let analysis = CameraAnalysis {
                    position: (*camera.position()).into(),
                    direction: (*camera.direction()).into(),
                    label,
                    visible_structures: visible.iter().map(|&i| self.structures[i].id).collect(),
                };
                (camera.id().to_string(), analysis)
            })
            .collect();

        SceneAnalysis {
            cameras,
            structures: self.structures.clone(),
            structural_lines: self
                .lines
                .iter()
                .enumerate()
                .map(|(id, line)| LineRecord {
                    id,
                    point: line.point.into(),
                    direction: line.direction.into(),
                })
                .collect(),
        }
    }

    /// 被写体位置を撮れるカメラ（構造線による遮蔽込み）
    pub fn analyze_subject(
        &self,
        registry: &CameraRegistry,
        engine: &VisibilityEngine,
        position: &Vec3,
    ) -> SubjectVisibility {
        engine.subject_visibility(position, registry.iter().map(|c| c.as_ref()), &self.lines)
    }
}

/// 3D再構成のカメラ姿勢（回転行列の3行目の逆向きが前方）
#[derive(Debug, Clone, Deserialize)]
pub struct CameraPose {
    pub id: String,
    pub position: [f64; 3],
    /// row-major 3x3
    pub rotation: [[f64; 3]; 3],
    #[serde(default)]
    pub img_name: Option<String>,
    #[serde(default)]
    pub fx: Option<f64>,
    #[serde(default)]
    pub fy: Option<f64>,
}

impl CameraPose {
    pub fn to_config(&self) -> CameraConfig {
        let [x, y, z] = self.rotation[2];
        let mut config = CameraConfig::new(self.id.clone(), self.position, [-x, -y, -z]);
        config.name = self.img_name.clone().filter(|n| !n.is_empty());
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SceneCamera {
    Config(CameraConfig),
    Pose(CameraPose),
}

impl SceneCamera {
    pub fn to_config(&self) -> CameraConfig {
        match self {
            SceneCamera::Config(c) => c.clone(),
            SceneCamera::Pose(p) => p.to_config(),
        }
    }
}

/// シーンファイル（JSON）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SceneDocument {
    #[serde(default)]
    pub cameras: Vec<SceneCamera>,
    #[serde(default)]
    pub structures: Vec<Structure>,
    #[serde(default)]
    pub structural_lines: Vec<StructuralLine>,
    /// 構造線の代わりに平面を渡してもよい
    #[serde(default)]
    pub planes: Vec<[f64; 4]>,
}

impl SceneDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// 姿勢形式のカメラも設定形式に変換して返す
    pub fn camera_configs(&self) -> Vec<CameraConfig> {
        self.cameras.iter().map(SceneCamera::to_config).collect()
    }

    pub fn registry(&self) -> Result<CameraRegistry, ConfigError> {
        CameraRegistry::from_configs(&self.camera_configs())
    }

    pub fn into_scene(self) -> Scene {
        let mut lines: Vec<StructuralLine> = self
            .structural_lines
            .into_iter()
            .filter_map(|l| StructuralLine::new(l.point, l.direction))
            .collect();
        let from_planes = StructuralLine::from_plane_set(&self.planes);
        if !from_planes.is_empty() {
            info!("{} structural lines derived from {} planes", from_planes.len(), self.planes.len());
        }
        lines.extend(from_planes);
        Scene::new(self.structures, lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_intersection() {
        let line = StructuralLine::from_planes([1.0, 0.0, 0.0, -1.0], [0.0, 1.0, 0.0, -2.0]).unwrap();
        assert!((line.direction - Vec3::z()).norm() < 1e-12);
        assert!((line.point - Vec3::new(1.0, 2.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_parallel_planes_no_line() {
        assert!(StructuralLine::from_planes([0.0, 1.0, 0.0, 0.0], [0.0, 2.0, 0.0, -3.0]).is_none());
    }

    #[test]
    fn test_plane_set_pairs() {
        let planes = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0, -1.0],
        ];
        // z=0 と z=1 は平行 → 6ペア中5本
        assert_eq!(StructuralLine::from_plane_set(&planes).len(), 5);
    }

    #[test]
    fn test_zero_direction_line_rejected() {
        assert!(StructuralLine::new(Vec3::zeros(), Vec3::zeros()).is_none());
    }

    #[test]
    fn test_camera_pose_direction() {
        let pose = CameraPose {
            id: "7".into(),
            position: [0.0, 1.0, 4.0],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            img_name: Some("00007.png".into()),
            fx: None,
            fy: None,
        };
        let config = pose.to_config();
        assert_eq!(config.direction, [-0.0, -0.0, -1.0]);
        assert_eq!(config.name.as_deref(), Some("00007.png"));
    }

    fn document() -> SceneDocument {
        serde_json::from_str(
            r#"{
                "cameras": [
                    {"id": "front", "position": [0.0, 0.0, 5.0], "direction": [0.0, 0.0, -1.0]},
                    {"id": "top", "position": [0.0, 5.0, 0.5],
                     "rotation": [[1, 0, 0], [0, 0, -1], [0, 1, 0]]}
                ],
                "structures": [
                    {"id": 0, "center": [-1.0, 0.0, 0.0], "point_count": 120},
                    {"id": 1, "center": [1.0, 0.0, 0.0], "point_count": 300}
                ],
                "structural_lines": [{"point": [0.0, 0.0, 2.5], "direction": [2.0, 0.0, 0.0]}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_document_mixed_cameras() {
        let doc = document();
        let registry = doc.registry().unwrap();
        assert_eq!(registry.len(), 2);
        let top = registry.get("top").unwrap();
        assert!((top.direction() - Vec3::new(0.0, -1.0, 0.0)).norm() < 1e-12);

        let scene = doc.into_scene();
        assert_eq!(scene.lines().len(), 1);
        assert!((scene.lines()[0].direction - Vec3::x()).norm() < 1e-12);
    }

    #[test]
    fn test_analyze_scene() {
        let doc = document();
        let registry = doc.registry().unwrap();
        let scene = doc.into_scene();

        let analysis = scene.analyze_scene(&registry, &SceneConfig::default());
        assert_eq!(analysis.cameras.len(), 2);
        assert_eq!(analysis.structures.len(), 2);
        assert_eq!(analysis.structural_lines.len(), 1);

        let front = &analysis.cameras["front"];
        assert_eq!(front.visible_structures, vec![0, 1]);
        assert_eq!(front.label.to_string(), "right level medium");

        let top = &analysis.cameras["top"];
        assert_eq!(top.label.to_string(), "front high-angle medium");
    }

    #[test]
    fn test_analyze_subject_blocked_by_line() {
        let doc = document();
        let registry = doc.registry().unwrap();
        let scene = doc.into_scene();
        let engine = VisibilityEngine::default();

        let result = scene.analyze_subject(&registry, &engine, &Vec3::zeros());
        let ids: Vec<&str> = result.visible_cameras.iter().map(|c| c.camera_id.as_str()).collect();
        assert_eq!(ids, vec!["top"]);
        assert_eq!(result.rejected.len(), 1);
    }
}
