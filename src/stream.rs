// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/stream.rs - 流式计数
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

//! 对一组图像逐帧检测，产生惰性的 `1…1 0` 计数序列。
//!
//! 每帧先输出若干个 [`CountEvent::Detected`]（每个达到阈值的检测一个），
//! 再输出一个 [`CountEvent::FrameDone`]。图像由多个线程并行解码，但推理严格按
//! 提交顺序逐帧进行；消费者停止拉取时不会再发起新的推理。

use std::{
  iter::FusedIterator,
  path::{Path, PathBuf},
  sync::Arc,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::{
  detector::DualDetector,
  input::{FrameError, OrderedFrameLoader, list_frames},
  model::registry::ModelHandle,
};

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountEvent {
  Detected,
  FrameDone,
}

impl CountEvent {
  pub fn bit(self) -> u8 {
    match self {
      CountEvent::Detected => 1,
      CountEvent::FrameDone => 0,
    }
  }
}

impl From<CountEvent> for u8 {
  fn from(event: CountEvent) -> u8 {
    event.bit()
  }
}

/// 从第一帧开始推理到最后一帧推理完成的吞吐统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
  pub images_completed: usize,
  pub elapsed: Duration,
}

impl ThroughputSample {
  /// 每秒推理次数；耗时为零时返回 0
  pub fn per_second(&self) -> f64 {
    let secs = self.elapsed.as_secs_f64();
    if secs > 0.0 {
      self.images_completed as f64 / secs
    } else {
      0.0
    }
  }
}

/// 对一帧给出所有检测的置信度，不做阈值过滤
pub trait FrameDetector {
  fn frame_scores(&self, frame: &RgbImage) -> Vec<f32>;
}

impl FrameDetector for DualDetector {
  fn frame_scores(&self, frame: &RgbImage) -> Vec<f32> {
    self.detect_raw(frame).iter().map(|d| d.confidence).collect()
  }
}

impl FrameDetector for ModelHandle {
  fn frame_scores(&self, frame: &RgbImage) -> Vec<f32> {
    let Some(model) = self.as_ready() else {
      return Vec::new();
    };
    match model.infer(frame) {
      Ok(result) => result.iter().map(|item| item.score).collect(),
      Err(e) => {
        warn!("{} 模型推理失败，本帧结果为空: {}", model.kind(), e);
        Vec::new()
      }
    }
  }
}

impl<T: FrameDetector + ?Sized> FrameDetector for &T {
  fn frame_scores(&self, frame: &RgbImage) -> Vec<f32> {
    (**self).frame_scores(frame)
  }
}

impl<T: FrameDetector + ?Sized> FrameDetector for Arc<T> {
  fn frame_scores(&self, frame: &RgbImage) -> Vec<f32> {
    (**self).frame_scores(frame)
  }
}

#[derive(Debug, Clone)]
pub struct StreamingCounter<D> {
  detector: D,
  threshold: Option<f32>,
  workers: usize,
  prefetch: Option<usize>,
}

impl<D: FrameDetector> StreamingCounter<D> {
  pub fn new(detector: D) -> Self {
    Self {
      detector,
      threshold: None,
      workers: DEFAULT_WORKERS,
      prefetch: None,
    }
  }

  /// 为 `None` 时每个检测都计数
  pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  /// 解码窗口，默认与线程数相同
  pub fn with_prefetch(mut self, prefetch: usize) -> Self {
    self.prefetch = Some(prefetch.max(1));
    self
  }

  pub fn detector(&self) -> &D {
    &self.detector
  }

  pub fn count<I, P>(&self, paths: I) -> CountStream<'_, D>
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
    debug!("开始流式计数，共 {} 张图像", paths.len());
    let prefetch = self.prefetch.unwrap_or(self.workers);
    CountStream {
      detector: &self.detector,
      threshold: self.threshold,
      loader: OrderedFrameLoader::new(paths, self.workers, prefetch),
      pending_detections: 0,
      pending_frame_done: false,
      started: None,
      last_completed: None,
      frames_dispatched: 0,
      frames_completed: 0,
      frames_skipped: 0,
      finished: false,
    }
  }

  /// 目录下所有图像，按文件名顺序
  pub fn count_dir(&self, dir: &Path) -> Result<CountStream<'_, D>, FrameError> {
    Ok(self.count(list_frames(dir)?))
  }
}

/// 计数序列。只能遍历一次；耗尽时记录一次吞吐。
pub struct CountStream<'a, D> {
  detector: &'a D,
  threshold: Option<f32>,
  loader: OrderedFrameLoader,
  pending_detections: usize,
  pending_frame_done: bool,
  started: Option<Instant>,
  last_completed: Option<Instant>,
  frames_dispatched: usize,
  frames_completed: usize,
  frames_skipped: usize,
  finished: bool,
}

impl<D: FrameDetector> CountStream<'_, D> {
  /// 已送入推理的帧数
  pub fn frames_dispatched(&self) -> usize {
    self.frames_dispatched
  }

  /// 因读取或解码失败跳过的帧数
  pub fn frames_skipped(&self) -> usize {
    self.frames_skipped
  }

  pub fn is_finished(&self) -> bool {
    self.finished
  }

  /// 至少完成一帧后才有吞吐数据
  pub fn throughput(&self) -> Option<ThroughputSample> {
    let (started, last) = (self.started?, self.last_completed?);
    Some(ThroughputSample {
      images_completed: self.frames_completed,
      elapsed: last.duration_since(started),
    })
  }

  fn process(&mut self, frame: &RgbImage) {
    let now = Instant::now();
    self.started.get_or_insert(now);
    self.frames_dispatched += 1;

    let scores = self.detector.frame_scores(frame);
    let qualifying = match self.threshold {
      Some(threshold) => scores.iter().filter(|score| **score >= threshold).count(),
      None => scores.len(),
    };

    self.frames_completed += 1;
    self.last_completed = Some(Instant::now());
    self.pending_detections = qualifying;
    self.pending_frame_done = true;
  }

  fn finish(&mut self) {
    self.finished = true;
    match self.throughput() {
      Some(sample) => info!(
        "共推理 {} 张图像，耗时 {:.2?}，每秒推理次数: {:.2}",
        sample.images_completed,
        sample.elapsed,
        sample.per_second()
      ),
      None => info!("没有完成推理的图像"),
    }
    if self.frames_skipped > 0 {
      warn!("共跳过 {} 张无法读取的图像", self.frames_skipped);
    }
  }
}

impl<D: FrameDetector> Iterator for CountStream<'_, D> {
  type Item = CountEvent;

  fn next(&mut self) -> Option<CountEvent> {
    loop {
      if self.pending_detections > 0 {
        self.pending_detections -= 1;
        return Some(CountEvent::Detected);
      }
      if self.pending_frame_done {
        self.pending_frame_done = false;
        return Some(CountEvent::FrameDone);
      }
      if self.finished {
        return None;
      }

      match self.loader.next() {
        Some(loaded) => match loaded.image {
          Ok(frame) => self.process(&frame),
          Err(e) => {
            warn!("跳过无法读取的图像 {}: {}", loaded.path.display(), e);
            self.frames_skipped += 1;
          }
        },
        None => {
          self.finish();
          return None;
        }
      }
    }
  }
}

impl<D: FrameDetector> FusedIterator for CountStream<'_, D> {}
