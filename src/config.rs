// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/config.rs - 流水线配置
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
  dataset::{ShardLocator, UnifiedManifest},
  detector::{DEFAULT_CONFIDENCE, ThresholdError, Thresholds},
  stream::DEFAULT_WORKERS,
};

pub const DATASET_PARTS_DIR: &str = "dataset_parts";
pub const UNIFIED_DATASET_DIR: &str = "unified_dataset";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  Yaml(#[from] serde_yaml::Error),
  #[error("阈值配置错误: {0}")]
  Threshold(#[from] ThresholdError),
  #[error("配置中没有任何数据集")]
  NoDatasets,
}

/// 一个单类别数据集分片的来源描述；下载本身不在本项目内
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
  pub workspace_id: String,
  pub project_id: String,
  pub version: u32,
  #[serde(default = "default_format")]
  pub format: String,
  pub target_class: String,
}

fn default_format() -> String {
  "yolov8".to_string()
}

impl DatasetConfig {
  pub fn id(&self) -> String {
    format!("{}/{}/{}", self.workspace_id, self.project_id, self.version)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
  pub environmental: Option<PathBuf>,
  pub general: Option<PathBuf>,
  /// 解析类别名时优先使用的清单
  pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
  pub environmental: f32,
  pub general: f32,
}

impl Default for ThresholdConfig {
  fn default() -> Self {
    Self {
      environmental: DEFAULT_CONFIDENCE,
      general: DEFAULT_CONFIDENCE,
    }
  }
}

impl ThresholdConfig {
  pub fn thresholds(&self) -> Result<Thresholds, ThresholdError> {
    Thresholds::new(self.environmental, self.general)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  pub workers: usize,
  pub prefetch: Option<usize>,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      workers: DEFAULT_WORKERS,
      prefetch: None,
    }
  }
}

impl StreamConfig {
  /// 解码窗口；未配置时等于实际使用的线程数
  pub fn prefetch_for(&self, workers: usize) -> usize {
    self.prefetch.unwrap_or(workers).max(1)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
  pub font: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
  #[serde(default = "default_workspace")]
  pub workspace: PathBuf,
  pub datasets: Vec<DatasetConfig>,
  #[serde(default)]
  pub models: ModelPaths,
  #[serde(default)]
  pub thresholds: ThresholdConfig,
  #[serde(default)]
  pub stream: StreamConfig,
  #[serde(default)]
  pub render: RenderConfig,
}

fn default_workspace() -> PathBuf {
  PathBuf::from(".")
}

impl PipelineConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config = Self::from_yaml(&content)?;
    debug!("已加载配置: {}", path.display());
    Ok(config)
  }

  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_yaml::from_str(content)?;
    if config.datasets.is_empty() {
      return Err(ConfigError::NoDatasets);
    }
    config.thresholds.thresholds()?;
    Ok(config)
  }

  /// 类别顺序即 `datasets` 中 `target_class` 的顺序
  pub fn categories(&self) -> Vec<String> {
    self.datasets.iter().map(|d| d.target_class.clone()).collect()
  }

  pub fn parts_dir(&self) -> PathBuf {
    self.workspace.join(DATASET_PARTS_DIR)
  }

  pub fn unified_dir(&self) -> PathBuf {
    self.workspace.join(UNIFIED_DATASET_DIR)
  }

  pub fn shard_locator(&self) -> ShardLocator {
    ShardLocator::new(self.parts_dir())
  }

  /// 未配置时使用训练输出的默认位置
  pub fn environmental_weights(&self) -> PathBuf {
    self.models.environmental.clone().unwrap_or_else(|| {
      self
        .workspace
        .join("runs")
        .join("unified_model")
        .join("weights")
        .join("best.onnx")
    })
  }

  pub fn general_weights(&self) -> PathBuf {
    self
      .models
      .general
      .clone()
      .unwrap_or_else(|| self.workspace.join("yolov8n.onnx"))
  }

  /// 显式配置的清单，否则为合并数据集的清单
  pub fn manifest_path(&self) -> PathBuf {
    self
      .models
      .manifest
      .clone()
      .unwrap_or_else(|| UnifiedManifest::path_in(&self.unified_dir()))
  }
}
