// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/dataset/unify.rs - 多类别数据集合并
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
  ffi::OsString,
  fs,
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
  CategoryShard, LABEL_EXTENSION, Split, SplitDirs, is_image_file,
  label::{LabelRewrite, label_file_name, namespaced_name, remap_label},
  manifest::{GlobalClassTable, ManifestError, UnifiedManifest},
  shard::{ShardError, ShardLocator},
};

const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Error, Debug)]
pub enum UnifyError {
  #[error("没有指定任何类别")]
  NoCategories,
  #[error("类别 `{0}` 重复出现")]
  DuplicateCategory(String),
  #[error("类别名 `{0}` 不合法，不能为空或包含路径")]
  InvalidCategory(String),
  #[error("合并中止: {0}")]
  Shard(#[from] ShardError),
  #[error("清单错误: {0}")]
  Manifest(#[from] ManifestError),
  #[error("I/O 错误 ({}): {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

trait IoContext<T> {
  fn at(self, path: &Path) -> Result<T, UnifyError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
  fn at(self, path: &Path) -> Result<T, UnifyError> {
    self.map_err(|source| UnifyError::Io {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// 复制过程中的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
  pub images_copied: usize,
  pub labels_written: usize,
  pub labels_missing: usize,
  pub labels_empty: usize,
}

impl CopyStats {
  fn absorb(&mut self, other: CopyStats) {
    self.images_copied += other.images_copied;
    self.labels_written += other.labels_written;
    self.labels_missing += other.labels_missing;
    self.labels_empty += other.labels_empty;
  }
}

/// 合并结果中每个划分的文件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitTally {
  pub images: usize,
  pub labels: usize,
}

#[derive(Debug, Clone)]
pub struct UnifyReport {
  pub manifest: UnifiedManifest,
  pub manifest_path: PathBuf,
  /// 已有清单被直接复用，未复制任何文件
  pub reused: bool,
  pub stats: CopyStats,
  pub tally: BTreeMap<Split, SplitTally>,
}

/// 把多个单类别分片合并为一个多类别数据集
#[derive(Debug, Clone)]
pub struct DatasetUnifier {
  locator: ShardLocator,
  output_root: PathBuf,
  batch_size: usize,
}

impl DatasetUnifier {
  /// 输出目录会被转换为绝对路径，清单中的路径因此不依赖训练任务的工作目录
  pub fn new(locator: ShardLocator, output_root: impl Into<PathBuf>) -> Self {
    let output_root = output_root.into();
    let output_root = std::path::absolute(&output_root).unwrap_or(output_root);
    Self {
      locator,
      output_root,
      batch_size: DEFAULT_BATCH_SIZE,
    }
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  pub fn output_root(&self) -> &Path {
    &self.output_root
  }

  pub fn unify<S: AsRef<str>>(&self, categories: &[S]) -> Result<UnifiedManifest, UnifyError> {
    self.unify_with_report(categories).map(|report| report.manifest)
  }

  pub fn unify_with_report<S: AsRef<str>>(
    &self,
    categories: &[S],
  ) -> Result<UnifyReport, UnifyError> {
    if categories.is_empty() {
      return Err(UnifyError::NoCategories);
    }
    if let Some(category) = categories
      .iter()
      .map(|category| category.as_ref())
      .find(|category| !is_valid_category(category))
    {
      return Err(UnifyError::InvalidCategory(category.to_string()));
    }
    let class_table =
      GlobalClassTable::from_categories(categories).map_err(|e| match e {
        ManifestError::DuplicateClass(name) => UnifyError::DuplicateCategory(name),
        other => UnifyError::Manifest(other),
      })?;
    info!("开始合并数据集，类别: {:?}", class_table.names());

    let expected = UnifiedManifest::new(&self.output_root, class_table);
    let manifest_path = expected.manifest_path();

    match UnifiedManifest::load(&self.output_root) {
      Ok(Some(existing)) if existing.class_table == expected.class_table => {
        info!("合并数据集已存在，跳过重建: {}", manifest_path.display());
        let tally = tally_splits(&existing)?;
        return Ok(UnifyReport {
          manifest: existing,
          manifest_path,
          reused: true,
          stats: CopyStats::default(),
          tally,
        });
      }
      Ok(Some(existing)) => {
        warn!(
          "已有清单的类别表 {:?} 与本次 {:?} 不同，重新合并",
          existing.class_table.names(),
          expected.class_table.names()
        );
      }
      Ok(None) => {}
      Err(e) => warn!("已有清单无法读取 ({})，重新合并", e),
    }

    // 先确认所有分片都存在，再动输出目录
    let shards = categories
      .iter()
      .map(|category| self.locator.locate(category.as_ref()))
      .collect::<Result<Vec<CategoryShard>, ShardError>>()?;

    self.reset_output(&expected)?;

    let mut stats = CopyStats::default();
    for (class_index, shard) in shards.iter().enumerate() {
      info!("处理类别 {} (编号 {}): {}", shard.category, class_index, shard.root.display());
      for split in Split::ALL {
        let Some(source) = shard.split(split) else {
          warn!("类别 {} 没有 {} 划分，跳过", shard.category, split);
          continue;
        };
        let split_stats =
          self.copy_split(&shard.category, class_index, source, expected.split(split))?;
        info!(
          "类别 {} 的 {} 划分: 复制 {} 张图像, {} 个标注",
          shard.category, split, split_stats.images_copied, split_stats.labels_written
        );
        stats.absorb(split_stats);
      }
    }

    let manifest_path = expected.write_atomic()?;
    let tally = tally_splits(&expected)?;
    for (split, counts) in &tally {
      info!("最终 {}: {} 张图像, {} 个标注", split, counts.images, counts.labels);
    }
    info!(
      "合并完成，共 {} 个类别: {}",
      expected.num_classes(),
      expected.class_table.names().join(", ")
    );
    info!("清单文件: {}", manifest_path.display());

    Ok(UnifyReport {
      manifest: expected,
      manifest_path,
      reused: false,
      stats,
      tally,
    })
  }

  /// 没有有效清单时，上一次运行留下的内容不可信，整体清空
  fn reset_output(&self, manifest: &UnifiedManifest) -> Result<(), UnifyError> {
    let stale_manifest = manifest.manifest_path();
    if stale_manifest.exists() {
      fs::remove_file(&stale_manifest).at(&stale_manifest)?;
    }
    for tree in ["images", "labels"] {
      let dir = manifest.root.join(tree);
      if dir.exists() {
        debug!("清理旧的输出目录: {}", dir.display());
        fs::remove_dir_all(&dir).at(&dir)?;
      }
    }
    for dirs in manifest.splits.values() {
      fs::create_dir_all(&dirs.images).at(&dirs.images)?;
      fs::create_dir_all(&dirs.labels).at(&dirs.labels)?;
    }
    Ok(())
  }

  fn copy_split(
    &self,
    category: &str,
    class_index: usize,
    source: &SplitDirs,
    target: &SplitDirs,
  ) -> Result<CopyStats, UnifyError> {
    if !source.labels.is_dir() {
      warn!(
        "标注目录不存在，{} 的图像将全部作为背景样本: {}",
        category,
        source.labels.display()
      );
    }

    let mut stats = CopyStats::default();
    let mut batch: Vec<OsString> = Vec::with_capacity(self.batch_size);
    let entries = fs::read_dir(&source.images).at(&source.images)?;
    for entry in entries {
      let entry = entry.at(&source.images)?;
      batch.push(entry.file_name());
      if batch.len() >= self.batch_size {
        self.copy_batch(category, class_index, source, target, &batch, &mut stats)?;
        batch.clear();
      }
    }
    if !batch.is_empty() {
      self.copy_batch(category, class_index, source, target, &batch, &mut stats)?;
    }
    Ok(stats)
  }

  fn copy_batch(
    &self,
    category: &str,
    class_index: usize,
    source: &SplitDirs,
    target: &SplitDirs,
    batch: &[OsString],
    stats: &mut CopyStats,
  ) -> Result<(), UnifyError> {
    for file_name in batch {
      let src_image = source.images.join(file_name);
      if !src_image.is_file() || !is_image_file(&src_image) {
        continue;
      }

      let new_name = namespaced_name(category, file_name);
      let dst_image = target.images.join(&new_name);
      fs::copy(&src_image, &dst_image).at(&dst_image)?;
      stats.images_copied += 1;

      let src_label = source.labels.join(label_file_name(file_name));
      if !src_label.is_file() {
        warn!("缺少标注: {} (期望位于 {})", src_image.display(), src_label.display());
        stats.labels_missing += 1;
        continue;
      }

      let content = fs::read_to_string(&src_label).at(&src_label)?;
      match remap_label(&content, class_index, &src_label) {
        LabelRewrite::Rewritten { content, .. } => {
          let dst_label = target.labels.join(label_file_name(&new_name));
          if dst_label.exists() {
            warn!(
              "标注 {} 已存在，将被 {} 覆盖（同名不同扩展名的图像）",
              dst_label.display(),
              src_label.display()
            );
          }
          fs::write(&dst_label, content).at(&dst_label)?;
          stats.labels_written += 1;
        }
        LabelRewrite::Empty => {
          warn!("空标注文件，已跳过: {}", src_label.display());
          stats.labels_empty += 1;
        }
      }
    }
    Ok(())
  }
}

/// 类别名同时是分片目录名和文件名前缀，只能是单个普通路径段
fn is_valid_category(category: &str) -> bool {
  !category.trim().is_empty()
    && category != "."
    && category != ".."
    && !category.contains(['/', '\\'])
}

fn tally_splits(manifest: &UnifiedManifest) -> Result<BTreeMap<Split, SplitTally>, UnifyError> {
  let mut tally = BTreeMap::new();
  for (split, dirs) in &manifest.splits {
    let images = count_files(&dirs.images, is_image_file)?;
    let labels = count_files(&dirs.labels, |path| {
      path.extension().is_some_and(|ext| ext == LABEL_EXTENSION)
    })?;
    tally.insert(*split, SplitTally { images, labels });
  }
  Ok(tally)
}

fn count_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<usize, UnifyError> {
  if !dir.is_dir() {
    return Ok(0);
  }
  let mut count = 0;
  for entry in fs::read_dir(dir).at(dir)? {
    let path = entry.at(dir)?.path();
    if path.is_file() && keep(&path) {
      count += 1;
    }
  }
  Ok(count)
}
