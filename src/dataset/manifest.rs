// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/dataset/manifest.rs - 合并数据集清单
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
  fs,
  io::Write,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Split, SplitDirs};

#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("YAML 错误: {0}")]
  Yaml(#[from] serde_yaml::Error),
  #[error("类别编号不连续: 期望 {expected}, 实际 {found}")]
  NonContiguousNames { expected: usize, found: usize },
  #[error("类别数量不一致: nc = {nc}, names 中有 {names} 项")]
  ClassCountMismatch { nc: usize, names: usize },
  #[error("类别 `{0}` 重复出现")]
  DuplicateClass(String),
}

/// 全局类别表，编号即首次出现的位置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalClassTable {
  names: Vec<String>,
}

impl GlobalClassTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// 按顺序建表，重复的类别视为错误
  pub fn from_categories<I, S>(categories: I) -> Result<Self, ManifestError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut table = Self::new();
    for category in categories {
      let category = category.as_ref();
      if table.index_of(category).is_some() {
        return Err(ManifestError::DuplicateClass(category.to_string()));
      }
      table.insert(category);
    }
    Ok(table)
  }

  /// 插入类别并返回其编号；已存在时返回原编号
  pub fn insert(&mut self, name: &str) -> usize {
    match self.index_of(name) {
      Some(index) => index,
      None => {
        self.names.push(name.to_string());
        self.names.len() - 1
      }
    }
  }

  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.names.iter().position(|n| n == name)
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn to_names_map(&self) -> BTreeMap<usize, String> {
    self.names.iter().cloned().enumerate().collect()
  }
}

/// 交给训练任务的 data.yaml 文档，字段顺序即落盘顺序
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
  pub path: PathBuf,
  pub train: PathBuf,
  pub val: PathBuf,
  pub test: PathBuf,
  pub names: BTreeMap<usize, String>,
  pub nc: usize,
}

impl ManifestDocument {
  pub fn read(path: &Path) -> Result<Self, ManifestError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
  }

  /// 校验 names 从 0 开始连续且与 nc 一致
  pub fn class_table(&self) -> Result<GlobalClassTable, ManifestError> {
    if self.nc != self.names.len() {
      return Err(ManifestError::ClassCountMismatch {
        nc: self.nc,
        names: self.names.len(),
      });
    }
    let mut table = GlobalClassTable::new();
    for (expected, (index, name)) in self.names.iter().enumerate() {
      if *index != expected {
        return Err(ManifestError::NonContiguousNames {
          expected,
          found: *index,
        });
      }
      if table.index_of(name).is_some() {
        return Err(ManifestError::DuplicateClass(name.clone()));
      }
      table.insert(name);
    }
    Ok(table)
  }
}

/// 合并后的数据集描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedManifest {
  pub root: PathBuf,
  pub splits: BTreeMap<Split, SplitDirs>,
  pub class_table: GlobalClassTable,
}

impl UnifiedManifest {
  pub const FILE_NAME: &'static str = "data.yaml";

  pub fn new(root: impl Into<PathBuf>, class_table: GlobalClassTable) -> Self {
    let root = root.into();
    let splits = Split::ALL
      .into_iter()
      .map(|split| (split, SplitDirs::unified_layout(&root, split)))
      .collect();
    Self {
      root,
      splits,
      class_table,
    }
  }

  pub fn num_classes(&self) -> usize {
    self.class_table.len()
  }

  pub fn split(&self, split: Split) -> &SplitDirs {
    // new() 总是填满三个划分
    &self.splits[&split]
  }

  pub fn path_in(root: &Path) -> PathBuf {
    root.join(Self::FILE_NAME)
  }

  pub fn manifest_path(&self) -> PathBuf {
    Self::path_in(&self.root)
  }

  pub fn to_document(&self) -> ManifestDocument {
    ManifestDocument {
      path: self.root.clone(),
      train: self.split(Split::Train).images.clone(),
      val: self.split(Split::Valid).images.clone(),
      test: self.split(Split::Test).images.clone(),
      names: self.class_table.to_names_map(),
      nc: self.num_classes(),
    }
  }

  pub fn to_yaml(&self) -> Result<String, ManifestError> {
    Ok(serde_yaml::to_string(&self.to_document())?)
  }

  /// 先写临时文件再原子改名；只有改名完成后清单才算存在
  pub fn write_atomic(&self) -> Result<PathBuf, ManifestError> {
    let target = self.manifest_path();
    let staging = self.root.join(format!(".{}.tmp", Self::FILE_NAME));
    fs::create_dir_all(&self.root)?;

    let yaml = self.to_yaml()?;
    {
      let mut file = fs::File::create(&staging)?;
      file.write_all(yaml.as_bytes())?;
      file.sync_all()?;
    }
    fs::rename(&staging, &target)?;
    debug!("清单已写入: {}", target.display());
    Ok(target)
  }

  /// 读取 `root` 下已有的清单；文件不存在时返回 `Ok(None)`
  pub fn load(root: &Path) -> Result<Option<Self>, ManifestError> {
    let path = Self::path_in(root);
    if !path.is_file() {
      return Ok(None);
    }
    let document = ManifestDocument::read(&path)?;
    let class_table = document.class_table()?;
    Ok(Some(Self::new(document.path, class_table)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn class_table_preserves_order() {
    let table = GlobalClassTable::from_categories(["Pothole", "Litter", "Flood", "Light"]).unwrap();
    assert_eq!(table.get(0), Some("Pothole"));
    assert_eq!(table.get(3), Some("Light"));
    assert_eq!(table.index_of("Flood"), Some(2));
  }

  #[test]
  fn duplicate_categories_are_rejected() {
    let err = GlobalClassTable::from_categories(["Flood", "Flood"]).unwrap_err();
    assert!(matches!(err, ManifestError::DuplicateClass(ref name) if name == "Flood"));
  }

  #[test]
  fn insert_returns_first_occurrence() {
    let mut table = GlobalClassTable::new();
    assert_eq!(table.insert("a"), 0);
    assert_eq!(table.insert("b"), 1);
    assert_eq!(table.insert("a"), 0);
    assert_eq!(table.len(), 2);
  }

  #[test]
  fn document_layout() {
    let table = GlobalClassTable::from_categories(["Pothole", "Litter"]).unwrap();
    let manifest = UnifiedManifest::new("/data/unified_dataset", table);
    let yaml = manifest.to_yaml().unwrap();
    let expected = "path: /data/unified_dataset\n\
                    train: /data/unified_dataset/images/train\n\
                    val: /data/unified_dataset/images/valid\n\
                    test: /data/unified_dataset/images/test\n\
                    names:\n  0: Pothole\n  1: Litter\n\
                    nc: 2\n";
    assert_eq!(yaml, expected);
  }

  #[test]
  fn load_round_trips_written_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let table = GlobalClassTable::from_categories(["Flood"]).unwrap();
    let manifest = UnifiedManifest::new(dir.path(), table);
    manifest.write_atomic().unwrap();
    let loaded = UnifiedManifest::load(dir.path()).unwrap().unwrap();
    assert_eq!(loaded, manifest);
    assert!(!dir.path().join(".data.yaml.tmp").exists());
  }

  #[test]
  fn gaps_in_names_are_rejected() {
    let mut names = BTreeMap::new();
    names.insert(0, "a".to_string());
    names.insert(2, "b".to_string());
    let document = ManifestDocument {
      path: PathBuf::from("/x"),
      train: PathBuf::from("/x/images/train"),
      val: PathBuf::from("/x/images/valid"),
      test: PathBuf::from("/x/images/test"),
      names,
      nc: 2,
    };
    assert!(matches!(
      document.class_table(),
      Err(ManifestError::NonContiguousNames { expected: 1, found: 2 })
    ));
  }
}
