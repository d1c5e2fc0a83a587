// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/input.rs - 图像输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;

use crate::dataset::is_image_file;

mod loader;
pub use self::loader::{LoadedFrame, OrderedFrameLoader};

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("I/O 错误 ({}): {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("图像解码错误 ({}): {source}", path.display())]
  Decode {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("解码线程崩溃 ({}): {message}", path.display())]
  Panicked { path: PathBuf, message: String },
}

impl FrameError {
  pub fn path(&self) -> &Path {
    match self {
      FrameError::Io { path, .. }
      | FrameError::Decode { path, .. }
      | FrameError::Panicked { path, .. } => path,
    }
  }
}

/// 读取并解码为 RGB 图像，格式按文件内容判断
pub fn decode_frame(path: &Path) -> Result<RgbImage, FrameError> {
  let io_err = |source| FrameError::Io {
    path: path.to_path_buf(),
    source,
  };
  let reader = ImageReader::open(path)
    .map_err(io_err)?
    .with_guessed_format()
    .map_err(io_err)?;
  let image = reader.decode().map_err(|source| FrameError::Decode {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(image.to_rgb8())
}

/// 目录下的图像文件，按文件名排序
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, FrameError> {
  let io_err = |source| FrameError::Io {
    path: dir.to_path_buf(),
    source,
  };
  let mut frames = Vec::new();
  for entry in std::fs::read_dir(dir).map_err(io_err)? {
    let path = entry.map_err(io_err)?.path();
    if path.is_file() && is_image_file(&path) {
      frames.push(path);
    }
  }
  frames.sort();
  Ok(frames)
}
