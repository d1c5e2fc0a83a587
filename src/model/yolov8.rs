// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 推理后端
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

use std::{
  collections::BTreeMap,
  path::Path,
  sync::{Mutex, PoisonError},
};

use image::{Rgb, RgbImage, imageops::FilterType};
use ndarray::{Array, ArrayViewD, IxDyn};
use ort::{session::Session, value::TensorRef};
use tracing::{debug, warn};

use super::{ClassNames, DetectItem, DetectResult, Model, ModelError, registry::ModelLoader};

const DEFAULT_INPUT_SIZE: u32 = 640;
const LETTERBOX_FILL: u8 = 114;
// 低于该分数的候选框不进入 NMS，最终阈值由调用方决定
const MIN_CANDIDATE_SCORE: f32 = 0.05;
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// 以 ONNX Runtime 加载 `.onnx` 权重
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
  fn load(&self, weights_path: &Path) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(YoloV8Onnx::open(weights_path)?))
  }
}

pub struct YoloV8Onnx {
  session: Mutex<Session>,
  input_name: String,
  input_size: u32,
  names: Option<ClassNames>,
}

fn load_err(e: ort::Error) -> ModelError {
  ModelError::Load(e.to_string())
}

fn infer_err(e: ort::Error) -> ModelError {
  ModelError::Inference(e.to_string())
}

impl YoloV8Onnx {
  pub fn open(path: &Path) -> Result<Self, ModelError> {
    if !path.is_file() {
      return Err(ModelError::NotFound(path.to_path_buf()));
    }
    // 只接受导出后的 ONNX，不反序列化 `.pt` 等 pickle 格式
    if !path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("onnx")) {
      return Err(ModelError::UnsupportedFormat(path.to_path_buf()));
    }

    let session = Session::builder()
      .map_err(load_err)?
      .commit_from_file(path)
      .map_err(load_err)?;

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .ok_or_else(|| ModelError::Load("模型没有输入".to_string()))?;

    let (names, input_size) = match session.metadata() {
      Ok(metadata) => {
        let names = metadata
          .custom("names")
          .ok()
          .flatten()
          .and_then(|raw| parse_names(&raw));
        let input_size = metadata
          .custom("imgsz")
          .ok()
          .flatten()
          .and_then(|raw| parse_input_size(&raw))
          .unwrap_or(DEFAULT_INPUT_SIZE);
        (names, input_size)
      }
      Err(e) => {
        warn!("无法读取模型元数据: {}", e);
        (None, DEFAULT_INPUT_SIZE)
      }
    };
    debug!(
      "ONNX 模型输入 {} ({}x{})，内置类别: {}",
      input_name,
      input_size,
      input_size,
      names.as_ref().map_or(0, ClassNames::len)
    );

    Ok(Self {
      session: Mutex::new(session),
      input_name,
      input_size,
      names,
    })
  }
}

impl Model for YoloV8Onnx {
  fn infer(&self, frame: &RgbImage) -> Result<DetectResult, ModelError> {
    let (input, ratio) = letterbox(frame, self.input_size);
    let tensor = TensorRef::from_array_view(&input).map_err(infer_err)?;

    let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => tensor])
      .map_err(infer_err)?;
    let output = outputs[0].try_extract_array::<f32>().map_err(infer_err)?;

    let items = decode(
      output,
      ratio,
      frame.dimensions(),
      MIN_CANDIDATE_SCORE,
      NMS_IOU_THRESHOLD,
    )?;
    Ok(items.into())
  }

  fn embedded_names(&self) -> Option<ClassNames> {
    self.names.clone()
  }
}

/// 元数据里的 names 形如 `{0: 'person', 1: 'bicycle'}`，恰好是 YAML 流式映射
fn parse_names(raw: &str) -> Option<ClassNames> {
  match serde_yaml::from_str::<BTreeMap<u32, String>>(raw) {
    Ok(names) if !names.is_empty() => Some(ClassNames::from_map(names)),
    Ok(_) => None,
    Err(e) => {
      warn!("模型元数据中的类别表无法解析: {}", e);
      None
    }
  }
}

fn parse_input_size(raw: &str) -> Option<u32> {
  serde_yaml::from_str::<Vec<u32>>(raw)
    .ok()
    .and_then(|dims| dims.into_iter().max())
    .filter(|size| *size > 0)
}

/// 等比缩放后贴在左上角，其余部分填灰；返回 NCHW 张量和缩放比例
fn letterbox(frame: &RgbImage, size: u32) -> (Array<f32, IxDyn>, f32) {
  let (w, h) = frame.dimensions();
  let ratio = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
  let new_w = ((w as f32 * ratio).round() as u32).clamp(1, size);
  let new_h = ((h as f32 * ratio).round() as u32).clamp(1, size);
  let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

  let side = size as usize;
  let fill = LETTERBOX_FILL as f32 / 255.0;
  let mut input = Array::from_elem((1, 3, side, side), fill);
  for (x, y, Rgb(pixel)) in resized.enumerate_pixels() {
    let (x, y) = (x as usize, y as usize);
    for c in 0..3 {
      input[[0, c, y, x]] = pixel[c] as f32 / 255.0;
    }
  }
  (input.into_dyn(), ratio)
}

/// 解析 `[1, 4 + nc, anchors]` 输出：每个锚点取最高分类别，坐标还原到原图后做 NMS
fn decode(
  output: ArrayViewD<'_, f32>,
  ratio: f32,
  (width, height): (u32, u32),
  min_score: f32,
  iou_threshold: f32,
) -> Result<Vec<DetectItem>, ModelError> {
  let shape = output.shape();
  if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
    return Err(ModelError::Inference(format!("意外的输出形状: {:?}", shape)));
  }
  let (channels, anchors) = (shape[1], shape[2]);
  let (max_x, max_y) = (width as f32, height as f32);

  let mut candidates = Vec::new();
  for i in 0..anchors {
    let (class_id, score) = (4..channels)
      .map(|c| (c - 4, output[[0, c, i]]))
      .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
    if score < min_score {
      continue;
    }

    let cx = output[[0, 0, i]];
    let cy = output[[0, 1, i]];
    let bw = output[[0, 2, i]];
    let bh = output[[0, 3, i]];
    let bbox = [
      ((cx - bw / 2.0) / ratio).clamp(0.0, max_x),
      ((cy - bh / 2.0) / ratio).clamp(0.0, max_y),
      ((cx + bw / 2.0) / ratio).clamp(0.0, max_x),
      ((cy + bh / 2.0) / ratio).clamp(0.0, max_y),
    ];
    candidates.push(DetectItem {
      class_id: class_id as u32,
      score,
      bbox,
    });
  }

  non_max_suppression(&mut candidates, iou_threshold);
  Ok(candidates)
}

/// 按类别分别做 NMS，不同类别的重叠框互不抑制；结果按分数降序
fn non_max_suppression(items: &mut Vec<DetectItem>, iou_threshold: f32) {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept = 0;
  for index in 0..items.len() {
    let overlaps = (0..kept).any(|prev| {
      items[prev].class_id == items[index].class_id
        && items[prev].iou(&items[index]) > iou_threshold
    });
    if !overlaps {
      items.swap(kept, index);
      kept += 1;
    }
  }
  items.truncate(kept);
}
