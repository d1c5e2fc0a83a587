// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/detector.rs - 双模型检测
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

use std::path::Path;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{
  ModelKind,
  registry::{ModelHandle, ModelRegistry},
};

pub const DEFAULT_CONFIDENCE: f32 = 0.25;

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
  #[error("置信度阈值必须位于 (0, 1) 区间，实际为 {0}")]
  OutOfRange(f32),
}

pub fn validate_threshold(value: f32) -> Result<f32, ThresholdError> {
  if value > 0.0 && value < 1.0 {
    Ok(value)
  } else {
    Err(ThresholdError::OutOfRange(value))
  }
}

/// 两个模型各自的置信度阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  environmental: f32,
  general: f32,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      environmental: DEFAULT_CONFIDENCE,
      general: DEFAULT_CONFIDENCE,
    }
  }
}

impl Thresholds {
  pub fn new(environmental: f32, general: f32) -> Result<Self, ThresholdError> {
    Ok(Self {
      environmental: validate_threshold(environmental)?,
      general: validate_threshold(general)?,
    })
  }

  pub fn environmental(&self) -> f32 {
    self.environmental
  }

  pub fn general(&self) -> f32 {
    self.general
  }

  pub fn for_kind(&self, kind: ModelKind) -> f32 {
    match kind {
      ModelKind::Environmental => self.environmental,
      ModelKind::General => self.general,
    }
  }
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  #[serde(skip)]
  pub source: ModelKind,
  #[serde(rename = "class")]
  pub class_name: String,
  pub confidence: f32,
  #[serde(rename = "box")]
  pub bbox: [f32; 4], // [x1, y1, x2, y2]，像素坐标
}

impl Detection {
  /// 绘制用的标签文本
  pub fn label(&self) -> String {
    format!("{} {:.2}", self.class_name, self.confidence)
  }
}

/// 一帧图像的双模型检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DualDetection {
  pub environmental: Vec<Detection>,
  pub general: Vec<Detection>,
}

impl DualDetection {
  pub fn len(&self) -> usize {
    self.environmental.len() + self.general.len()
  }

  pub fn is_empty(&self) -> bool {
    self.environmental.is_empty() && self.general.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Detection> {
    self.environmental.iter().chain(self.general.iter())
  }

  pub fn to_json(&self) -> serde_json::Value {
    serde_json::json!({
      "environmental": self.environmental,
      "general": self.general,
    })
  }
}

/// 环境模型与通用模型组合检测。任何一侧失败都只会让该侧为空，不影响另一侧。
#[derive(Debug, Clone)]
pub struct DualDetector {
  environmental: ModelHandle,
  general: ModelHandle,
}

impl DualDetector {
  pub fn new(environmental: ModelHandle, general: ModelHandle) -> Self {
    Self {
      environmental,
      general,
    }
  }

  /// 未配置路径的一侧直接禁用
  pub fn from_registry(
    registry: &ModelRegistry,
    environmental: Option<&Path>,
    general: Option<&Path>,
  ) -> Self {
    let handle = |path: Option<&Path>, kind: ModelKind| match path {
      Some(path) => registry.get_or_load(path, kind),
      None => ModelHandle::disabled("", format!("未配置{}模型路径", kind)),
    };
    Self::new(
      handle(environmental, ModelKind::Environmental),
      handle(general, ModelKind::General),
    )
  }

  pub fn environmental(&self) -> &ModelHandle {
    &self.environmental
  }

  pub fn general(&self) -> &ModelHandle {
    &self.general
  }

  pub fn handle(&self, kind: ModelKind) -> &ModelHandle {
    match kind {
      ModelKind::Environmental => &self.environmental,
      ModelKind::General => &self.general,
    }
  }

  pub fn detect(&self, frame: &RgbImage, thresholds: Thresholds) -> DualDetection {
    DualDetection {
      environmental: self.run_side(
        ModelKind::Environmental,
        frame,
        Some(thresholds.environmental()),
      ),
      general: self.run_side(ModelKind::General, frame, Some(thresholds.general())),
    }
  }

  /// 不经过置信度门限的原始结果
  pub fn detect_raw(&self, frame: &RgbImage) -> DualDetection {
    DualDetection {
      environmental: self.run_side(ModelKind::Environmental, frame, None),
      general: self.run_side(ModelKind::General, frame, None),
    }
  }

  /// 检测并绘制标注图，绘制不改变检测结果
  #[cfg(feature = "draw")]
  pub fn detect_annotated(
    &self,
    frame: &RgbImage,
    thresholds: Thresholds,
    draw: &crate::output::draw::Draw,
  ) -> (DualDetection, RgbImage) {
    let detections = self.detect(frame, thresholds);
    let annotated = draw.render(frame, &detections);
    (detections, annotated)
  }

  fn run_side(&self, kind: ModelKind, frame: &RgbImage, threshold: Option<f32>) -> Vec<Detection> {
    let model = match self.handle(kind) {
      ModelHandle::Ready(model) => model,
      ModelHandle::Disabled(disabled) => {
        debug!("{} 模型已禁用: {}", kind, disabled.reason);
        return Vec::new();
      }
    };

    let result = match model.infer(frame) {
      Ok(result) => result,
      Err(e) => {
        warn!("{} 模型推理失败，本帧该模型结果为空: {}", kind, e);
        return Vec::new();
      }
    };

    result
      .iter()
      .filter(|item| threshold.is_none_or(|t| item.score >= t))
      .map(|item| Detection {
        source: kind,
        class_name: model.class_name(item.class_id),
        confidence: item.score,
        bbox: item.bbox,
      })
      .collect()
  }
}
