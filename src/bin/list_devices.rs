// 该文件是 Beifeng （北风） 项目的一部分。
// src/bin/list_devices.rs - 列出加速器设备
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use beifeng::accel::{AcceleratorSession, cpu::CpuDriver};

/// 连接加速器并列出可用设备
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 以 JSON 输出
  #[arg(long)]
  pub json: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let mut session = AcceleratorSession::new(CpuDriver::new());
  session.connect()?;
  let devices = session.list_devices()?;
  info!("发现 {} 个设备", devices.len());

  let chips: Vec<Option<String>> = devices
    .iter()
    .map(|device| session.device_chip(device).map(|chip| chip.to_string()))
    .collect();

  if args.json {
    let list: Vec<_> = devices
      .iter()
      .zip(&chips)
      .map(|(device, chip)| serde_json::json!({ "name": device, "chip": chip }))
      .collect();
    println!("{}", serde_json::json!({ "devices": list }));
  } else {
    for (device, chip) in devices.iter().zip(&chips) {
      println!("{}\t{}", device, chip.as_deref().unwrap_or("-"));
    }
  }

  session.disconnect()?;
  Ok(())
}
