// 该文件是 Jiejing （街景巡检） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::{
  fs,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::{Rgb, RgbImage};
use jiejing::model::{ClassNames, DetectItem, DetectResult, Model, ModelError};

/// 在 `<parts>/<category>/<split>/images|labels` 下写入一个分片。
/// `files` 中每项为 (图像文件名, 标注内容)；标注为 `None` 时不写标注文件。
pub fn write_shard(parts: &Path, category: &str, split: &str, files: &[(&str, Option<&str>)]) {
  let base = parts.join(category).join(split);
  let images = base.join("images");
  let labels = base.join("labels");
  fs::create_dir_all(&images).unwrap();
  fs::create_dir_all(&labels).unwrap();
  for (name, label) in files {
    fs::write(images.join(name), format!("fake image {}", name)).unwrap();
    if let Some(label) = label {
      let label_name = Path::new(name).with_extension("txt");
      fs::write(labels.join(label_name), label).unwrap();
    }
  }
}

pub fn files_in(dir: &Path) -> Vec<String> {
  let mut names: Vec<String> = fs::read_dir(dir)
    .unwrap()
    .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
    .collect();
  names.sort();
  names
}

/// 用像素编码检测结果的帧：(0,0) 的红色分量是检测数，
/// 第 `j` 个检测的分数为 (j+1,0) 红色分量除以 100
pub fn encoded_frame(scores: &[f32]) -> RgbImage {
  let mut image = RgbImage::new(scores.len() as u32 + 1, 1);
  image.put_pixel(0, 0, Rgb([scores.len() as u8, 0, 0]));
  for (j, score) in scores.iter().enumerate() {
    image.put_pixel(j as u32 + 1, 0, Rgb([(score * 100.0).round() as u8, 0, 0]));
  }
  image
}

pub fn write_encoded_frame(dir: &Path, name: &str, scores: &[f32]) -> PathBuf {
  let path = dir.join(name);
  encoded_frame(scores).save(&path).unwrap();
  path
}

/// 按 [`encoded_frame`] 的约定解码出检测，类别编号都为 `class_id`
pub struct PixelModel {
  pub class_id: u32,
  pub calls: Arc<AtomicUsize>,
}

impl PixelModel {
  pub fn new(class_id: u32) -> Self {
    Self {
      class_id,
      calls: Arc::new(AtomicUsize::new(0)),
    }
  }
}

impl Model for PixelModel {
  fn infer(&self, frame: &RgbImage) -> Result<DetectResult, ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let count = frame.get_pixel(0, 0)[0] as u32;
    let items: Vec<DetectItem> = (0..count)
      .map(|j| DetectItem {
        class_id: self.class_id,
        score: frame.get_pixel(j + 1, 0)[0] as f32 / 100.0,
        bbox: [0.0, 0.0, 1.0, 1.0],
      })
      .collect();
    Ok(items.into())
  }
}

/// 每次都返回同一组检测
pub struct ScriptedModel {
  pub items: Vec<DetectItem>,
  pub names: Option<ClassNames>,
}

impl ScriptedModel {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self { items, names: None }
  }
}

impl Model for ScriptedModel {
  fn infer(&self, _frame: &RgbImage) -> Result<DetectResult, ModelError> {
    Ok(self.items.clone().into())
  }

  fn embedded_names(&self) -> Option<ClassNames> {
    self.names.clone()
  }
}

/// 推理总是失败
pub struct FailingModel;

impl Model for FailingModel {
  fn infer(&self, _frame: &RgbImage) -> Result<DetectResult, ModelError> {
    Err(ModelError::Inference("device lost".to_string()))
  }
}

pub fn item(class_id: u32, score: f32) -> DetectItem {
  DetectItem {
    class_id,
    score,
    bbox: [10.0, 10.0, 40.0, 40.0],
  }
}
