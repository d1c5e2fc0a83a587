// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/model.rs - 模型
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

use std::{collections::BTreeMap, fmt, path::PathBuf};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

pub mod labels;
pub mod registry;
#[cfg(feature = "onnx")]
pub mod yolov8;

/// 检测模型。实现需要可在线程间共享，推理本身由调用方串行发起。
pub trait Model: Send + Sync {
  fn infer(&self, frame: &RgbImage) -> Result<DetectResult, ModelError>;

  /// 模型文件自带的类别表
  fn embedded_names(&self) -> Option<ClassNames> {
    None
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
}

impl DetectItem {
  pub fn area(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
  }

  pub fn iou(&self, other: &DetectItem) -> f32 {
    let x_min = self.bbox[0].max(other.bbox[0]);
    let y_min = self.bbox[1].max(other.bbox[1]);
    let x_max = self.bbox[2].min(other.bbox[2]);
    let y_max = self.bbox[3].min(other.bbox[3]);
    let inter = (x_max - x_min).max(0.0) * (y_max - y_min).max(0.0);
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DetectItem> {
    self.items.iter()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {}", .0.display())]
  NotFound(PathBuf),
  #[error("不支持的模型格式: {}", .0.display())]
  UnsupportedFormat(PathBuf),
  #[error("模型加载错误: {0}")]
  Load(String),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 两个检测模型的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
  Environmental,
  General,
}

impl ModelKind {
  /// 未知类别编号的名称前缀
  pub fn namespace(self) -> &'static str {
    match self {
      ModelKind::Environmental => "Env",
      ModelKind::General => "COCO",
    }
  }

  pub fn fallback_names(self) -> ClassNames {
    match self {
      ModelKind::Environmental => ClassNames::from_list(labels::ENVIRONMENTAL_CLASSES),
      ModelKind::General => ClassNames::from_list(labels::COCO_CLASSES),
    }
  }
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelKind::Environmental => f.write_str("environmental"),
      ModelKind::General => f.write_str("general"),
    }
  }
}

/// 类别编号到名称的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNames {
  names: BTreeMap<u32, String>,
}

impl ClassNames {
  pub fn from_map(names: BTreeMap<u32, String>) -> Self {
    Self { names }
  }

  pub fn from_list<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: (0u32..).zip(names.into_iter().map(Into::into)).collect(),
    }
  }

  pub fn get(&self, class_id: u32) -> Option<&str> {
    self.names.get(&class_id).map(String::as_str)
  }

  /// 未知编号降级为 `<namespace>-<id>`
  pub fn resolve(&self, class_id: u32, namespace: &str) -> String {
    match self.get(class_id) {
      Some(name) => name.to_string(),
      None => format!("{}-{}", namespace, class_id),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}
