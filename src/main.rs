// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jiejing::{
  DatasetUnifier, DualDetector, PipelineConfig, Thresholds,
  detector::validate_threshold,
  input::list_frames,
  output::DirectoryRecordOutput,
  task::{CountTask, DetectTask, Task, default_registry, install_interrupt_handler},
};

use args::{Args, Command};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("配置文件: {}", args.config.display());
  let config = PipelineConfig::load(&args.config)?;

  match args.command {
    Command::Unify { batch_size } => unify(&config, batch_size),
    Command::Detect {
      input,
      output,
      env_confidence,
      general_confidence,
    } => detect(&config, &input, &output, env_confidence, general_confidence),
    Command::Count {
      input,
      confidence,
      workers,
      limit,
      bits,
    } => count(&config, &input, confidence, workers, limit, bits),
  }
}

fn unify(config: &PipelineConfig, batch_size: Option<usize>) -> Result<()> {
  for dataset in &config.datasets {
    info!("数据集 {} -> 类别 {}", dataset.id(), dataset.target_class);
  }
  let mut unifier = DatasetUnifier::new(config.shard_locator(), config.unified_dir());
  if let Some(batch_size) = batch_size {
    unifier = unifier.with_batch_size(batch_size);
  }
  let report = unifier.unify_with_report(&config.categories())?;
  println!("{}", report.manifest_path.display());
  Ok(())
}

fn dual_detector(config: &PipelineConfig) -> DualDetector {
  let registry = default_registry().with_manifest(config.manifest_path());
  let environmental = config.environmental_weights();
  let general = config.general_weights();
  DualDetector::from_registry(
    &registry,
    Some(environmental.as_path()),
    Some(general.as_path()),
  )
}

fn detect(
  config: &PipelineConfig,
  input: &Path,
  output: &Path,
  env_confidence: Option<f32>,
  general_confidence: Option<f32>,
) -> Result<()> {
  let thresholds = Thresholds::new(
    env_confidence.unwrap_or(config.thresholds.environmental),
    general_confidence.unwrap_or(config.thresholds.general),
  )?;
  let detector = dual_detector(config);

  let record = DirectoryRecordOutput::new(output);
  #[cfg(feature = "draw")]
  let record = record.with_draw(jiejing::output::draw::Draw::from_optional_font(
    config.render.font.as_deref(),
  )?);

  let result = DetectTask::default()
    .with_thresholds(thresholds)
    .run_task(input, &detector, record)?;
  println!("{}", serde_json::to_string_pretty(&result.to_json())?);
  Ok(())
}

fn count(
  config: &PipelineConfig,
  input: &Path,
  confidence: Option<f32>,
  workers: Option<usize>,
  limit: Option<usize>,
  bits: bool,
) -> Result<()> {
  let threshold = confidence.map(validate_threshold).transpose()?;
  let workers = workers.unwrap_or(config.stream.workers).max(1);
  let prefetch = config.stream.prefetch_for(workers);
  let detector = dual_detector(config);
  let frames = list_frames(input)?;

  let task = CountTask::default()
    .with_threshold(threshold)
    .with_workers(workers, prefetch)
    .with_limit(limit)
    .with_stop_signal(install_interrupt_handler()?);

  let stdout = std::io::stdout();
  let output = bits.then(|| stdout.lock());
  let summary = task.run_task(frames, &detector, output)?;

  println!(
    "帧数: {}, 检测数: {}, 跳过: {}",
    summary.frames, summary.detections, summary.skipped
  );
  if let Some(throughput) = summary.throughput {
    println!("每秒推理次数: {:.2}", throughput.per_second());
  }
  Ok(())
}
