// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/model/registry.rs - 模型缓存
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

//! 权重路径到已加载模型的进程级缓存。
//!
//! 每个路径最多加载一次：同一路径的并发首次请求中，只有一个调用方真正执行加载，
//! 其余调用方阻塞等待并拿到同一个句柄。加载失败时缓存一个禁用句柄，之后的请求
//! 不再重试。

use std::{
  collections::HashMap,
  fmt,
  path::{Path, PathBuf},
  sync::{
    Arc, OnceLock, PoisonError, RwLock,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::{ClassNames, DetectResult, Model, ModelError, ModelKind};
use crate::dataset::{ManifestDocument, UnifiedManifest};

// weights/best.onnx -> unified_model -> runs
const MANIFEST_SEARCH_DEPTH: usize = 3;

/// 从权重文件构造模型，具体后端由实现决定
pub trait ModelLoader: Send + Sync {
  fn load(&self, weights_path: &Path) -> Result<Box<dyn Model>, ModelError>;
}

impl<F> ModelLoader for F
where
  F: Fn(&Path) -> Result<Box<dyn Model>, ModelError> + Send + Sync,
{
  fn load(&self, weights_path: &Path) -> Result<Box<dyn Model>, ModelError> {
    self(weights_path)
  }
}

/// 类别表的来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamesSource {
  Embedded,
  Manifest(PathBuf),
  Fallback,
}

pub struct LoadedModel {
  weights_path: PathBuf,
  kind: ModelKind,
  model: Box<dyn Model>,
  class_names: ClassNames,
  names_source: NamesSource,
}

impl LoadedModel {
  pub fn infer(&self, frame: &RgbImage) -> Result<DetectResult, ModelError> {
    self.model.infer(frame)
  }

  pub fn class_name(&self, class_id: u32) -> String {
    self.class_names.resolve(class_id, self.kind.namespace())
  }

  pub fn class_names(&self) -> &ClassNames {
    &self.class_names
  }

  pub fn names_source(&self) -> &NamesSource {
    &self.names_source
  }

  pub fn weights_path(&self) -> &Path {
    &self.weights_path
  }

  pub fn kind(&self) -> ModelKind {
    self.kind
  }
}

impl fmt::Debug for LoadedModel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadedModel")
      .field("weights_path", &self.weights_path)
      .field("kind", &self.kind)
      .field("classes", &self.class_names.len())
      .field("names_source", &self.names_source)
      .finish()
  }
}

#[derive(Debug)]
pub struct DisabledModel {
  pub weights_path: PathBuf,
  pub reason: String,
}

/// 模型句柄：可用，或已禁用（该模型不贡献任何检测结果）
#[derive(Debug, Clone)]
pub enum ModelHandle {
  Ready(Arc<LoadedModel>),
  Disabled(Arc<DisabledModel>),
}

impl ModelHandle {
  pub fn disabled(weights_path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
    ModelHandle::Disabled(Arc::new(DisabledModel {
      weights_path: weights_path.into(),
      reason: reason.into(),
    }))
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, ModelHandle::Ready(_))
  }

  pub fn as_ready(&self) -> Option<&LoadedModel> {
    match self {
      ModelHandle::Ready(model) => Some(model.as_ref()),
      ModelHandle::Disabled(_) => None,
    }
  }

  pub fn weights_path(&self) -> &Path {
    match self {
      ModelHandle::Ready(model) => &model.weights_path,
      ModelHandle::Disabled(disabled) => &disabled.weights_path,
    }
  }

  /// 两个句柄是否指向同一次加载
  pub fn same_load(&self, other: &ModelHandle) -> bool {
    match (self, other) {
      (ModelHandle::Ready(a), ModelHandle::Ready(b)) => Arc::ptr_eq(a, b),
      (ModelHandle::Disabled(a), ModelHandle::Disabled(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

type Slot = Arc<OnceLock<ModelHandle>>;

pub struct ModelRegistry {
  loader: Box<dyn ModelLoader>,
  manifest_override: Option<PathBuf>,
  slots: RwLock<HashMap<PathBuf, Slot>>,
  load_attempts: AtomicUsize,
}

impl ModelRegistry {
  pub fn new(loader: impl ModelLoader + 'static) -> Self {
    Self {
      loader: Box::new(loader),
      manifest_override: None,
      slots: RwLock::new(HashMap::new()),
      load_attempts: AtomicUsize::new(0),
    }
  }

  /// 指定优先使用的数据集清单（用于解析环境模型的类别名）
  pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
    self.manifest_override = Some(manifest.into());
    self
  }

  /// 取得路径对应的模型；首次请求时加载。`kind` 只在首次加载时用于选择兜底类别表。
  pub fn get_or_load(&self, weights_path: &Path, kind: ModelKind) -> ModelHandle {
    let key = registry_key(weights_path);
    let slot = self.slot(&key);
    slot.get_or_init(|| self.load(&key, kind)).clone()
  }

  /// 已缓存的句柄，不触发加载
  pub fn cached(&self, weights_path: &Path) -> Option<ModelHandle> {
    let key = registry_key(weights_path);
    let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
    slots.get(&key).and_then(|slot| slot.get().cloned())
  }

  /// 实际执行过的加载次数
  pub fn load_attempts(&self) -> usize {
    self.load_attempts.load(Ordering::SeqCst)
  }

  fn slot(&self, key: &Path) -> Slot {
    if let Some(slot) = self
      .slots
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
    {
      return slot.clone();
    }
    let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
    slots.entry(key.to_path_buf()).or_default().clone()
  }

  fn load(&self, weights_path: &Path, kind: ModelKind) -> ModelHandle {
    self.load_attempts.fetch_add(1, Ordering::SeqCst);
    info!("加载{}模型: {}", kind_label(kind), weights_path.display());

    let model = match self.loader.load(weights_path) {
      Ok(model) => model,
      Err(e) => {
        error!("{}模型加载失败，已禁用: {}", kind_label(kind), e);
        return ModelHandle::disabled(weights_path, e.to_string());
      }
    };

    let (class_names, names_source) = self.resolve_names(weights_path, kind, model.as_ref());
    info!(
      "{}模型加载完成，{} 个类别，类别表来源: {:?}",
      kind_label(kind),
      class_names.len(),
      names_source
    );

    ModelHandle::Ready(Arc::new(LoadedModel {
      weights_path: weights_path.to_path_buf(),
      kind,
      model,
      class_names,
      names_source,
    }))
  }

  /// 依次尝试：模型自带元数据、数据集清单（仅环境模型）、内置兜底表
  fn resolve_names(
    &self,
    weights_path: &Path,
    kind: ModelKind,
    model: &dyn Model,
  ) -> (ClassNames, NamesSource) {
    if let Some(names) = model.embedded_names()
      && !names.is_empty()
    {
      return (names, NamesSource::Embedded);
    }

    // 数据集清单只描述环境类别，通用模型直接使用 COCO 表
    let candidates = match kind {
      ModelKind::Environmental => self.manifest_candidates(weights_path),
      ModelKind::General => Vec::new(),
    };
    for candidate in candidates {
      if !candidate.is_file() {
        continue;
      }
      match ManifestDocument::read(&candidate).and_then(|doc| doc.class_table()) {
        Ok(table) if !table.is_empty() => {
          return (
            ClassNames::from_list(table.names().iter().cloned()),
            NamesSource::Manifest(candidate),
          );
        }
        Ok(_) => debug!("清单中没有类别: {}", candidate.display()),
        Err(e) => warn!("无法从清单读取类别名 {}: {}", candidate.display(), e),
      }
    }

    (kind.fallback_names(), NamesSource::Fallback)
  }

  fn manifest_candidates(&self, weights_path: &Path) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = self.manifest_override.iter().cloned().collect();
    candidates.extend(
      weights_path
        .ancestors()
        .skip(1)
        .take(MANIFEST_SEARCH_DEPTH)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(UnifiedManifest::path_in),
    );
    candidates
  }
}

impl fmt::Debug for ModelRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
    f.debug_struct("ModelRegistry")
      .field("models", &slots.keys().collect::<Vec<_>>())
      .field("manifest_override", &self.manifest_override)
      .field("load_attempts", &self.load_attempts())
      .finish()
  }
}

fn registry_key(weights_path: &Path) -> PathBuf {
  std::fs::canonicalize(weights_path).unwrap_or_else(|_| weights_path.to_path_buf())
}

fn kind_label(kind: ModelKind) -> &'static str {
  match kind {
    ModelKind::Environmental => "环境",
    ModelKind::General => "通用",
  }
}
