use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::model::{CameraModel, Vec3};
use crate::config::CameraConfig;
use crate::error::ConfigError;

/// 外部へ公開するカメラ情報
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub position: [f64; 3],
    pub direction: [f64; 3],
    pub fov: f64,
    pub is_active: bool,
}

/// カメラの登録簿
///
/// モデルは `Arc` で共有し、姿勢変更時は新しいモデルに差し替える。
#[derive(Debug, Default, Clone)]
pub struct CameraRegistry {
    cameras: BTreeMap<String, Arc<CameraModel>>,
    /// 登録順（最初のカメラが初期アクティブ）
    order: Vec<String>,
    active: Option<String>,
    /// 直近フレームの解像度
    frame_sizes: HashMap<String, (u32, u32)>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定から全カメラを登録。1台でも不正なら登録全体を失敗させる
    pub fn from_configs(configs: &[CameraConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config)?;
        }
        info!(cameras = registry.len(), "camera registry ready");
        Ok(registry)
    }

    pub fn register(&mut self, config: &CameraConfig) -> Result<Arc<CameraModel>, ConfigError> {
        if self.cameras.contains_key(&config.id) {
            return Err(ConfigError::DuplicateCamera(config.id.clone()));
        }
        let model = Arc::new(CameraModel::from_config(config)?);
        self.cameras.insert(config.id.clone(), Arc::clone(&model));
        self.order.push(config.id.clone());
        if self.active.is_none() {
            self.active = Some(config.id.clone());
        }
        Ok(model)
    }

    pub fn get(&self, camera_id: &str) -> Option<&Arc<CameraModel>> {
        self.cameras.get(camera_id)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// id順に列挙
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CameraModel>> {
        self.cameras.values()
    }

    /// 姿勢を更新（新しいモデルで置き換え、既存の参照は古い姿勢のまま）
    pub fn update_pose(
        &mut self,
        camera_id: &str,
        position: Vec3,
        direction: Vec3,
    ) -> Result<(), ConfigError> {
        let current = self
            .cameras
            .get(camera_id)
            .ok_or_else(|| ConfigError::UnknownCamera(camera_id.to_string()))?;
        let updated = Arc::new(current.with_pose(position, direction)?);
        self.cameras.insert(camera_id.to_string(), updated);
        Ok(())
    }

    pub fn set_active(&mut self, camera_id: &str) -> bool {
        if self.cameras.contains_key(camera_id) {
            self.active = Some(camera_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_frame_size(&mut self, camera_id: &str, width: u32, height: u32) {
        if self.cameras.contains_key(camera_id) {
            self.frame_sizes.insert(camera_id.to_string(), (width, height));
        }
    }

    pub fn frame_size(&self, camera_id: &str) -> Option<(u32, u32)> {
        self.frame_sizes.get(camera_id).copied()
    }

    /// 登録順のカメラ情報
    pub fn cameras_info(&self) -> Vec<CameraInfo> {
        self.order
            .iter()
            .filter_map(|id| self.cameras.get(id))
            .map(|cam| CameraInfo {
                id: cam.id().to_string(),
                name: cam.name().to_string(),
                position: (*cam.position()).into(),
                direction: (*cam.direction()).into(),
                fov: cam.fov(),
                is_active: self.active.as_deref() == Some(cam.id()),
            })
            .collect()
    }
}
