// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/dataset/shard.rs - 类别分片定位
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
  path::{Path, PathBuf},
};

use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{CategoryShard, Split, SplitDirs};

const SHARD_MANIFEST: &str = "data.yaml";

#[derive(Error, Debug)]
pub enum ShardError {
  #[error("类别 `{category}` 的数据分片不存在: {}", path.display())]
  MissingShard { category: String, path: PathBuf },
  #[error("类别 `{category}` 缺少 train 划分: {}", path.display())]
  MissingTrainSplit { category: String, path: PathBuf },
}

impl ShardError {
  pub fn category(&self) -> &str {
    match self {
      ShardError::MissingShard { category, .. } => category,
      ShardError::MissingTrainSplit { category, .. } => category,
    }
  }
}

/// 在 `<parts_root>/<category>` 下查找各类别的分片
#[derive(Debug, Clone)]
pub struct ShardLocator {
  parts_root: PathBuf,
}

impl ShardLocator {
  pub fn new(parts_root: impl Into<PathBuf>) -> Self {
    Self {
      parts_root: parts_root.into(),
    }
  }

  pub fn parts_root(&self) -> &Path {
    &self.parts_root
  }

  pub fn shard_dir(&self, category: &str) -> PathBuf {
    self.parts_root.join(category)
  }

  pub fn locate(&self, category: &str) -> Result<CategoryShard, ShardError> {
    let root = self.shard_dir(category);
    if !root.is_dir() {
      return Err(ShardError::MissingShard {
        category: category.to_string(),
        path: root,
      });
    }

    let mut splits = BTreeMap::new();
    for split in Split::ALL {
      let dirs = SplitDirs::shard_layout(&root, split);
      if dirs.images.is_dir() {
        splits.insert(split, dirs);
      } else {
        debug!("类别 {} 没有 {} 划分: {}", category, split, dirs.images.display());
      }
    }

    if !splits.contains_key(&Split::Train) {
      return Err(ShardError::MissingTrainSplit {
        category: category.to_string(),
        path: SplitDirs::shard_layout(&root, Split::Train).images,
      });
    }

    let source_names = read_source_names(&root.join(SHARD_MANIFEST));
    match &source_names {
      Some(names) => debug!("类别 {} 原始类别表: {:?}", category, names),
      None => warn!("类别 {} 的分片缺少可用的 {}", category, SHARD_MANIFEST),
    }

    Ok(CategoryShard {
      category: category.to_string(),
      root,
      splits,
      source_names,
    })
  }
}

/// 读取分片自带清单中的 `names`，兼容列表与映射两种写法
fn read_source_names(path: &Path) -> Option<Vec<String>> {
  let content = std::fs::read_to_string(path).ok()?;
  let document: Value = match serde_yaml::from_str(&content) {
    Ok(value) => value,
    Err(e) => {
      warn!("无法解析分片清单 {}: {}", path.display(), e);
      return None;
    }
  };

  match document.get("names")? {
    Value::Sequence(items) => Some(
      items
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect(),
    ),
    Value::Mapping(map) => {
      let mut entries: Vec<(u64, String)> = map
        .iter()
        .filter_map(|(k, v)| Some((k.as_u64()?, v.as_str()?.to_string())))
        .collect();
      entries.sort_by_key(|(k, _)| *k);
      Some(entries.into_iter().map(|(_, v)| v).collect())
    }
    _ => None,
  }
}
