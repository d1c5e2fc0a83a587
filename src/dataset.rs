// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/dataset.rs - 数据集分片与合并
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
  fmt,
  path::{Path, PathBuf},
};

pub mod label;
pub mod manifest;
pub mod shard;
pub mod unify;

pub use self::manifest::{GlobalClassTable, ManifestDocument, ManifestError, UnifiedManifest};
pub use self::shard::{ShardError, ShardLocator};
pub use self::unify::{DatasetUnifier, UnifyError, UnifyReport};

/// 参与合并的图像扩展名（不区分大小写）
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
/// YOLO 标注文件扩展名
pub const LABEL_EXTENSION: &str = "txt";

/// 数据集划分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
  Train,
  Valid,
  Test,
}

impl Split {
  pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

  /// 磁盘上的目录名
  pub fn dir_name(self) -> &'static str {
    match self {
      Split::Train => "train",
      Split::Valid => "valid",
      Split::Test => "test",
    }
  }
}

impl fmt::Display for Split {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.dir_name())
  }
}

/// 一个划分的图像目录与标注目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDirs {
  pub images: PathBuf,
  pub labels: PathBuf,
}

impl SplitDirs {
  /// `<root>/<split>/images` 与 `<root>/<split>/labels`，下载得到的分片使用这种布局
  pub fn shard_layout(root: &Path, split: Split) -> Self {
    let base = root.join(split.dir_name());
    Self {
      images: base.join("images"),
      labels: base.join("labels"),
    }
  }

  /// `<root>/images/<split>` 与 `<root>/labels/<split>`，合并后的数据集使用这种布局
  pub fn unified_layout(root: &Path, split: Split) -> Self {
    Self {
      images: root.join("images").join(split.dir_name()),
      labels: root.join("labels").join(split.dir_name()),
    }
  }
}

/// 单一类别的数据分片，由外部下载服务生成，合并过程只读
#[derive(Debug, Clone)]
pub struct CategoryShard {
  pub category: String,
  pub root: PathBuf,
  /// 仅包含图像目录存在的划分
  pub splits: BTreeMap<Split, SplitDirs>,
  /// 分片自带 data.yaml 中的类别名（若存在）
  pub source_names: Option<Vec<String>>,
}

impl CategoryShard {
  pub fn split(&self, split: Split) -> Option<&SplitDirs> {
    self.splits.get(&split)
  }
}

pub fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
    .unwrap_or(false)
}
