// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/task.rs - 命令行任务
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
  io::Write,
  path::{Path, PathBuf},
  sync::mpsc::{self, Receiver},
  thread,
  time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{
  detector::{DualDetection, DualDetector, Thresholds},
  input::decode_frame,
  model::registry::ModelRegistry,
  output::Render,
  stream::{CountEvent, FrameDetector, StreamingCounter, ThroughputSample},
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 当前编译的推理后端对应的模型缓存
#[cfg(feature = "onnx")]
pub fn default_registry() -> ModelRegistry {
  ModelRegistry::new(crate::model::yolov8::OnnxLoader)
}

#[cfg(not(feature = "onnx"))]
pub fn default_registry() -> ModelRegistry {
  use crate::model::{Model, ModelError};

  ModelRegistry::new(|path: &Path| -> Result<Box<dyn Model>, ModelError> {
    Err(ModelError::Load(format!(
      "未启用任何推理后端（需要 onnx 特性），无法加载 {}",
      path.display()
    )))
  })
}

/// Ctrl-C 时发送一次停止信号；30 秒内未退出则强制结束进程
pub fn install_interrupt_handler() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

/// 单张图像双模型检测
#[derive(Debug, Default)]
pub struct DetectTask {
  thresholds: Thresholds,
}

impl DetectTask {
  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }
}

impl<'a, 'b, O> Task<&'a Path, &'b DualDetector, O> for DetectTask
where
  O: Render,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = DualDetection;
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: &'a Path,
    model: &'b DualDetector,
    output: O,
  ) -> Result<DualDetection, Self::Error> {
    info!("开始任务...");
    let frame = decode_frame(input)?;
    info!("输入帧获取成功 ({}x{})，开始推理...", frame.width(), frame.height());
    let now = Instant::now();
    let result = model.detect(&frame, self.thresholds);
    info!(
      "推理完成，耗时: {:.2?}，环境 {} 个，通用 {} 个",
      now.elapsed(),
      result.environmental.len(),
      result.general.len()
    );
    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());
    Ok(result)
  }
}

/// 计数任务的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct CountSummary {
  pub frames: usize,
  pub detections: usize,
  pub skipped: usize,
  /// 因 `--limit` 或中断提前结束
  pub stopped_early: bool,
  pub throughput: Option<ThroughputSample>,
}

/// 逐帧计数。`output` 收到 0/1 序列（每个值一行），为 `None` 时只汇总。
#[derive(Debug, Default)]
pub struct CountTask {
  threshold: Option<f32>,
  workers: Option<usize>,
  prefetch: Option<usize>,
  limit: Option<usize>,
  stop: Option<Receiver<()>>,
}

impl CountTask {
  pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_workers(mut self, workers: usize, prefetch: usize) -> Self {
    self.workers = Some(workers);
    self.prefetch = Some(prefetch);
    self
  }

  /// 最多拉取的帧数
  pub fn with_limit(mut self, limit: Option<usize>) -> Self {
    self.limit = limit;
    self
  }

  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn should_stop(&self) -> bool {
    self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
  }
}

impl<D, W> Task<Vec<PathBuf>, D, Option<W>> for CountTask
where
  D: FrameDetector,
  W: Write,
{
  type Output = CountSummary;
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: Vec<PathBuf>,
    model: D,
    mut output: Option<W>,
  ) -> Result<CountSummary, Self::Error> {
    info!("开始计数任务，共 {} 张图像", input.len());
    let mut counter = StreamingCounter::new(model).with_threshold(self.threshold);
    if let Some(workers) = self.workers {
      counter = counter.with_workers(workers);
    }
    if let Some(prefetch) = self.prefetch {
      counter = counter.with_prefetch(prefetch);
    }

    let mut stream = counter.count(input);
    let mut frames = 0;
    let mut detections = 0;
    let mut stopped_early = false;

    for event in stream.by_ref() {
      if let Some(writer) = output.as_mut() {
        writeln!(writer, "{}", event.bit())?;
      }
      match event {
        CountEvent::Detected => detections += 1,
        CountEvent::FrameDone => {
          frames += 1;
          if self.limit.is_some_and(|n| frames >= n) {
            info!("达到指定帧数 {}, 停止拉取", frames);
            stopped_early = true;
            break;
          }
          if self.should_stop() {
            warn!("中断信号接收，停止拉取");
            stopped_early = true;
            break;
          }
        }
      }
    }

    if let Some(writer) = output.as_mut() {
      writer.flush()?;
    }

    let summary = CountSummary {
      frames,
      detections,
      skipped: stream.frames_skipped(),
      stopped_early,
      throughput: stream.throughput(),
    };
    info!(
      "任务完成: {} 帧, {} 个检测, 跳过 {} 张",
      summary.frames, summary.detections, summary.skipped
    );
    Ok(summary)
  }
}
