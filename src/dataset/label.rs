// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/dataset/label.rs - YOLO 标注类别重映射
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
  ffi::{OsStr, OsString},
  path::{Path, PathBuf},
};

use tracing::warn;

use super::LABEL_EXTENSION;

// class_id cx cy w h
const MIN_LABEL_TOKENS: usize = 5;

/// 重映射结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelRewrite {
  Rewritten { content: String, lines: usize },
  /// 没有任何有效标注行，按缺失处理
  Empty,
}

/// 把每一行的首个字段（类别编号）替换为 `class_index`，其余几何字段原样保留。
/// 字段不足五个的行会被丢弃。
pub fn remap_label(content: &str, class_index: usize, source: &Path) -> LabelRewrite {
  let index = class_index.to_string();
  let mut out = String::with_capacity(content.len() + 8);
  let mut lines = 0;

  for (line_no, line) in content.lines().enumerate() {
    let mut tokens = line.split_whitespace();
    if tokens.next().is_none() {
      continue;
    }
    let geometry: Vec<&str> = tokens.collect();
    if geometry.len() + 1 < MIN_LABEL_TOKENS {
      warn!(
        "标注行格式错误，已丢弃: {}:{} `{}`",
        source.display(),
        line_no + 1,
        line.trim()
      );
      continue;
    }

    out.push_str(&index);
    for token in geometry {
      out.push(' ');
      out.push_str(token);
    }
    out.push('\n');
    lines += 1;
  }

  if lines == 0 {
    LabelRewrite::Empty
  } else {
    LabelRewrite::Rewritten {
      content: out,
      lines,
    }
  }
}

/// 与图像同名的标注文件名
pub fn label_file_name(image_name: &OsStr) -> PathBuf {
  Path::new(image_name).with_extension(LABEL_EXTENSION)
}

/// 合并后带类别前缀的文件名，避免不同来源的同名文件互相覆盖
pub fn namespaced_name(category: &str, file_name: &OsStr) -> OsString {
  let mut name = OsString::from(format!("{}_", category));
  name.push(file_name);
  name
}

/// 读取一个标注文件的全部类别编号，主要用于校验
pub fn class_indices(content: &str) -> impl Iterator<Item = Option<usize>> + '_ {
  content
    .lines()
    .filter_map(|line| line.split_whitespace().next())
    .map(|token| token.parse().ok())
}
