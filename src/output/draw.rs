// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::debug;

use crate::{
  detector::{Detection, DualDetection},
  model::ModelKind,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

pub const ENVIRONMENTAL_COLOR: [u8; 3] = [255, 0, 0]; // 红色
pub const GENERAL_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  Font(#[from] ab_glyph::InvalidFont),
}

pub fn color_of(kind: ModelKind) -> [u8; 3] {
  match kind {
    ModelKind::Environmental => ENVIRONMENTAL_COLOR,
    ModelKind::General => GENERAL_COLOR,
  }
}

/// 标注绘制器。没有字体时只画边框和标签底色。
#[derive(Clone)]
pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: Option<FontArc>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font: None,
    }
  }
}

impl std::fmt::Debug for Draw {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Draw")
      .field("font_size", &self.font_size)
      .field("has_font", &self.font.is_some())
      .finish()
  }
}

impl Draw {
  pub fn with_font(font: FontArc) -> Self {
    Self {
      font: Some(font),
      ..Self::default()
    }
  }

  pub fn from_font_file(path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    debug!("已加载标签字体: {}", path.display());
    Ok(Self::with_font(font))
  }

  /// 可选字体路径；未提供时不绘制文字
  pub fn from_optional_font(path: Option<&Path>) -> Result<Self, DrawError> {
    match path {
      Some(path) => Self::from_font_file(path),
      None => Ok(Self::default()),
    }
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在帧的副本上绘制两组检测结果，不修改输入
  pub fn render(&self, frame: &RgbImage, detections: &DualDetection) -> RgbImage {
    let mut image = frame.clone();
    for detection in detections.iter() {
      self.draw_detection(&mut image, detection);
    }
    image
  }

  // bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    let (w, h) = (image.width() as i32, image.height() as i32);
    let color = Rgb(color_of(detection.source));
    let bbox = &detection.bbox;

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（加粗为2像素）
    for thickness in 0..BOX_THICKNESS {
      let x_min_t = (x_min + thickness).min(w - 1);
      let y_min_t = (y_min + thickness).min(h - 1);
      let x_max_t = (x_max - thickness).max(0);
      let y_max_t = (y_max - thickness).max(0);

      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, color);
        image.put_pixel(x as u32, y_max_t as u32, color);
      }
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, color);
        image.put_pixel(x_max_t as u32, y as u32, color);
      }
    }

    let label = detection.label();
    let scale = PxScale::from(self.font_size);

    let (text_width, text_height) = match &self.font {
      Some(font) => {
        let (tw, th) = text_size(scale, font, &label);
        (tw as i32, (th as i32).max(self.label_text_height))
      }
      None => (
        (label.chars().count() as f32 * self.label_char_width) as i32,
        self.label_text_height,
      ),
    };

    // 标签背景在边框上方
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;
    let label_height = text_height.min(h - label_y).max(0) as u32;

    if label_width == 0 || label_height == 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb(TEXT_COLOR),
        label_x,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        &label,
      );
    }
  }
}
