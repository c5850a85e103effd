// 该文件是 Beifeng （北风） 项目的一部分。
// src/bin/simple_preprocess.rs - 采集视频并保存预处理结果
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

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use beifeng::{
  FromUrl,
  accel::{
    AcceleratorSession,
    cpu::{CPU_PROC_DEVICE, CpuDriver},
  },
  output::SnapshotRender,
  pipeline::{PreprocessSpec, PreprocessStage, Resolution, RgbFormat},
  stream::{StreamConfig, StreamManager, StreamOptions, V4lCapture},
  task::{ContinuousTask, Task},
};

/// Beifeng 预处理示例参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，例如 v4l:///dev/video0?width=640&height=480&format=nv12
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 snapshot:///tmp/beifeng?every=30
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 预处理输出宽度
  #[arg(long, default_value = "320")]
  pub width: u32,
  /// 预处理输出高度
  #[arg(long, default_value = "320")]
  pub height: u32,
  /// 输出 RGB 平面排列
  #[arg(long)]
  pub planar: bool,
  /// 不做居中裁剪，直接缩放
  #[arg(long)]
  pub no_crop: bool,
  /// 重启前的等待秒数
  #[arg(long, default_value = "2")]
  pub cooldown: u64,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = StreamConfig::from_url(&args.input)?;
  let format = if args.planar {
    RgbFormat::Planar
  } else {
    RgbFormat::Interleaved
  };

  let mut session = AcceleratorSession::new(CpuDriver::new());
  session.connect()?;
  let spec = PreprocessSpec::new(
    CPU_PROC_DEVICE,
    Resolution::new(config.width, config.height),
    Resolution::new(args.width, args.height),
  )
  .format(format)
  .crop(!args.no_crop);
  let stage = PreprocessStage::new(session, &spec)?;

  let output = SnapshotRender::from_url(&args.output)?
    .size(args.width, args.height)
    .format(format);

  let options = StreamOptions::default().restart_cooldown(Duration::from_secs(args.cooldown));
  let mut manager = StreamManager::new(V4lCapture::new(), config, options);
  manager.start()?;

  let task = ContinuousTask::new().with_frame_number(args.frame_number);
  task.install_ctrlc_handler()?;
  let result = task
    .run_task(manager.frames(), stage, output)
    .with_context(|| format!("视频流状态: {:?}", manager.state()));

  info!("视频流统计: {}", manager.stats().to_json());
  manager.stop()?;
  result
}
