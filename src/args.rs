// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Jiejing 街景巡检：数据集合并与双模型检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 流水线配置文件（YAML）
  #[arg(long, short, value_name = "FILE", default_value = "jiejing.yaml")]
  pub config: PathBuf,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 把 dataset_parts 下的单类别分片合并为多类别数据集
  Unify {
    /// 每批处理的文件数
    #[arg(long, value_name = "COUNT")]
    batch_size: Option<usize>,
  },
  /// 对单张图像做双模型检测，输出 JSON 并保存标注图
  Detect {
    /// 输入图像
    #[arg(long, value_name = "IMAGE")]
    input: PathBuf,

    /// 结果目录，按日期分子目录保存
    #[arg(long, value_name = "DIR", default_value = "results")]
    output: PathBuf,

    /// 环境模型置信度阈值 (0.0 - 1.0)
    #[arg(long, value_name = "THRESHOLD")]
    env_confidence: Option<f32>,

    /// 通用模型置信度阈值 (0.0 - 1.0)
    #[arg(long, value_name = "THRESHOLD")]
    general_confidence: Option<f32>,
  },
  /// 对目录下的图像逐帧计数
  Count {
    /// 图像目录
    #[arg(long, value_name = "DIR")]
    input: PathBuf,

    /// 置信度阈值；不指定时计入所有检测
    #[arg(long, value_name = "THRESHOLD")]
    confidence: Option<f32>,

    /// 解码线程数
    #[arg(long, value_name = "COUNT")]
    workers: Option<usize>,

    /// 最多处理的帧数
    #[arg(long, value_name = "COUNT")]
    limit: Option<usize>,

    /// 逐行输出 0/1 序列，而不只是汇总
    #[arg(long)]
    bits: bool,
  },
}
