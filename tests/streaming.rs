// 该文件是 Jiejing （街景巡检） 项目的一部分。
// tests/streaming.rs - 流式计数测试
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

mod common;

use std::{
  path::{Path, PathBuf},
  sync::{Arc, atomic::Ordering},
};

use jiejing::{
  CountEvent, DualDetector, StreamingCounter,
  model::{Model, ModelError, ModelKind, registry::ModelRegistry},
};

use common::{PixelModel, write_encoded_frame};

fn pixel_detector() -> (DualDetector, Arc<std::sync::atomic::AtomicUsize>) {
  let model = PixelModel::new(2);
  let calls = model.calls.clone();
  let slot = std::sync::Mutex::new(Some(model));
  let registry = ModelRegistry::new(move |path: &Path| -> Result<Box<dyn Model>, ModelError> {
    let taken = slot.lock().unwrap().take();
    taken
      .map(|m| Box::new(m) as Box<dyn Model>)
      .ok_or_else(|| ModelError::NotFound(path.to_path_buf()))
  });
  // 只有通用模型可用
  let general = registry.get_or_load(Path::new("/models/pixel.onnx"), ModelKind::General);
  let environmental = registry.get_or_load(Path::new("/models/other.onnx"), ModelKind::Environmental);
  (DualDetector::new(environmental, general), calls)
}

fn bits(events: impl Iterator<Item = CountEvent>) -> Vec<u8> {
  events.map(u8::from).collect()
}

#[test]
fn raw_counts_per_frame() {
  let dir = tempfile::tempdir().unwrap();
  let counts = [2usize, 0, 3, 1];
  for (i, count) in counts.iter().enumerate() {
    write_encoded_frame(dir.path(), &format!("{:02}.png", i), &vec![0.1; *count]);
  }
  let (detector, _) = pixel_detector();
  let counter = StreamingCounter::new(detector);
  let sequence = bits(counter.count_dir(dir.path()).unwrap());

  assert_eq!(sequence, [1, 1, 0, 0, 1, 1, 1, 0, 1, 0]);
  assert_eq!(sequence.iter().filter(|b| **b == 0).count(), counts.len());
}

#[test]
fn threshold_filters_low_scores() {
  let dir = tempfile::tempdir().unwrap();
  write_encoded_frame(dir.path(), "a.png", &[0.9, 0.2, 0.5]);
  write_encoded_frame(dir.path(), "b.png", &[0.1]);
  let (detector, _) = pixel_detector();
  let counter = StreamingCounter::new(detector).with_threshold(Some(0.5));
  assert_eq!(bits(counter.count_dir(dir.path()).unwrap()), [1, 1, 0, 0]);
}

#[test]
fn corrupt_frames_are_skipped() {
  let dir = tempfile::tempdir().unwrap();
  write_encoded_frame(dir.path(), "a.png", &[0.9]);
  std::fs::write(dir.path().join("b.jpg"), b"not an image").unwrap();
  write_encoded_frame(dir.path(), "c.png", &[0.9, 0.9]);

  let (detector, calls) = pixel_detector();
  let counter = StreamingCounter::new(detector);
  let mut stream = counter.count_dir(dir.path()).unwrap();
  let sequence: Vec<u8> = stream.by_ref().map(u8::from).collect();

  assert_eq!(sequence, [1, 0, 1, 1, 0]);
  assert_eq!(stream.frames_skipped(), 1);
  assert_eq!(stream.frames_dispatched(), 2);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn order_preserved_with_many_workers() {
  let dir = tempfile::tempdir().unwrap();
  let paths: Vec<PathBuf> = (0..40)
    .map(|i| write_encoded_frame(dir.path(), &format!("{:03}.png", i), &vec![0.5; i % 4]))
    .collect();
  let (detector, _) = pixel_detector();
  let counter = StreamingCounter::new(detector).with_workers(4).with_prefetch(8);
  let sequence = bits(counter.count(paths));

  let mut expected = Vec::new();
  for i in 0..40 {
    expected.extend(std::iter::repeat_n(1u8, i % 4));
    expected.push(0);
  }
  assert_eq!(sequence, expected);
}

#[test]
fn stopping_early_bounds_dispatch() {
  let dir = tempfile::tempdir().unwrap();
  let paths: Vec<PathBuf> = (0..100)
    .map(|i| write_encoded_frame(dir.path(), &format!("{:03}.png", i), &[]))
    .collect();
  let (detector, calls) = pixel_detector();
  let counter = StreamingCounter::new(detector).with_workers(4);

  let mut stream = counter.count(paths);
  let pulled: Vec<u8> = stream.by_ref().take(3).map(u8::from).collect();
  assert_eq!(pulled, [0, 0, 0]);
  assert!(stream.frames_dispatched() <= 3);
  drop(stream);
  assert!(calls.load(Ordering::SeqCst) <= 3);
}

#[test]
fn throughput_available_after_drain() {
  let dir = tempfile::tempdir().unwrap();
  for i in 0..5 {
    write_encoded_frame(dir.path(), &format!("{}.png", i), &[0.4]);
  }
  let (detector, _) = pixel_detector();
  let counter = StreamingCounter::new(detector);
  let mut stream = counter.count_dir(dir.path()).unwrap();
  assert!(stream.throughput().is_none());

  let total = stream.by_ref().count();
  assert_eq!(total, 10);
  assert!(stream.is_finished());
  assert!(stream.next().is_none());

  let sample = stream.throughput().unwrap();
  assert_eq!(sample.images_completed, 5);
  assert!(sample.per_second() >= 0.0);
}

#[test]
fn empty_input_yields_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let (detector, calls) = pixel_detector();
  let counter = StreamingCounter::new(detector);
  let mut stream = counter.count_dir(dir.path()).unwrap();
  assert!(stream.next().is_none());
  assert!(stream.throughput().is_none());
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}
