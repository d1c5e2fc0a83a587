// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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
  path::{Path, PathBuf},
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{Datelike, Local};
use image::RgbImage;
use thiserror::Error;
use tracing::info;

#[cfg(feature = "draw")]
use super::draw::Draw;
use super::Render;
use crate::detector::DualDetection;

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 一次落盘产生的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
  pub image: PathBuf,
  pub record: PathBuf,
}

/// 按日期分目录保存检测图像与 JSON 结果：`<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.png`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  #[cfg(feature = "draw")]
  draw: Option<Draw>,
  frame_counter: AtomicU16,
  always: bool,
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      #[cfg(feature = "draw")]
      draw: None,
      frame_counter: AtomicU16::new(0),
      always: true,
    }
  }

  /// 保存标注后的图像而不是原图
  #[cfg(feature = "draw")]
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = Some(draw);
    self
  }

  /// 为 false 时没有检测结果的帧不落盘
  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  /// 保存一帧；被跳过时返回 `Ok(None)`
  pub fn save(
    &self,
    frame: &RgbImage,
    result: &DualDetection,
  ) -> Result<Option<SavedRecord>, DirectoryRecordOutputError> {
    if !self.always && result.is_empty() {
      return Ok(None);
    }

    let image_path = self.frame_path()?;
    self.rendered(frame, result).save(&image_path)?;

    let record_path = image_path.with_extension("json");
    let json = serde_json::to_string_pretty(&result.to_json())?;
    std::fs::write(&record_path, json)?;

    info!("检测结果已保存: {}", image_path.display());
    Ok(Some(SavedRecord {
      image: image_path,
      record: record_path,
    }))
  }

  #[cfg(feature = "draw")]
  fn rendered(&self, frame: &RgbImage, result: &DualDetection) -> RgbImage {
    match &self.draw {
      Some(draw) => draw.render(frame, result),
      None => frame.clone(),
    }
  }

  #[cfg(not(feature = "draw"))]
  fn rendered(&self, frame: &RgbImage, _result: &DualDetection) -> RgbImage {
    frame.clone()
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &DualDetection) -> Result<(), Self::Error> {
    self.save(frame, result).map(|_| ())
  }
}
