// 该文件是 Beifeng （北风） 项目的一部分。
// src/output/snapshot.rs - 保存预处理结果快照
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
  path::PathBuf,
  sync::atomic::{AtomicU64, Ordering},
};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, output::Render, pipeline::RgbFormat};

#[derive(Error, Debug)]
pub enum SnapshotRenderError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数 {key} 取值无效: {value}")]
  InvalidQuery { key: String, value: String },
  #[error("RGB 数据长度 {actual} 与 {width}x{height} 不符")]
  SizeMismatch {
    width: u32,
    height: u32,
    actual: usize,
  },
}

/// 每隔若干帧把 RGB 结果保存为 PNG，文件名为帧序号。
///
/// 地址形如 `snapshot:///tmp/beifeng?width=320&height=320&every=30&planar`。
#[derive(Debug)]
pub struct SnapshotRender {
  directory: PathBuf,
  width: u32,
  height: u32,
  format: RgbFormat,
  every: u64,
  counter: AtomicU64,
}

impl SnapshotRender {
  pub fn new(directory: impl Into<PathBuf>, width: u32, height: u32) -> Self {
    Self {
      directory: directory.into(),
      width,
      height,
      format: RgbFormat::Interleaved,
      every: 1,
      counter: AtomicU64::new(0),
    }
  }

  pub fn size(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  pub fn format(mut self, format: RgbFormat) -> Self {
    self.format = format;
    self
  }

  pub fn every(mut self, every: u64) -> Self {
    self.every = every.max(1);
    self
  }

  fn to_image(&self, data: &[u8]) -> Result<RgbImage, SnapshotRenderError> {
    let mismatch = || SnapshotRenderError::SizeMismatch {
      width: self.width,
      height: self.height,
      actual: data.len(),
    };
    let pixels = self.width as usize * self.height as usize;
    if data.len() != pixels * 3 {
      return Err(mismatch());
    }
    let interleaved = match self.format {
      RgbFormat::Interleaved => data.to_vec(),
      RgbFormat::Planar => (0..pixels)
        .flat_map(|i| [data[i], data[pixels + i], data[2 * pixels + i]])
        .collect(),
    };
    RgbImage::from_raw(self.width, self.height, interleaved).ok_or_else(mismatch)
  }
}

impl FromUrlWithScheme for SnapshotRender {
  const SCHEME: &'static str = "snapshot";
}

impl FromUrl for SnapshotRender {
  type Error = SnapshotRenderError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SnapshotRenderError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut render = SnapshotRender::new(url.path(), 0, 0);
    for (key, value) in url.query_pairs() {
      let invalid = || SnapshotRenderError::InvalidQuery {
        key: key.to_string(),
        value: value.to_string(),
      };
      match key.as_ref() {
        "width" => render.width = value.parse().map_err(|_| invalid())?,
        "height" => render.height = value.parse().map_err(|_| invalid())?,
        "every" => render = render.every(value.parse().map_err(|_| invalid())?),
        "planar" => render.format = RgbFormat::Planar,
        _ => {}
      }
    }
    Ok(render)
  }
}

impl<T> Render<Frame<T>, Vec<u8>> for SnapshotRender {
  type Error = SnapshotRenderError;

  fn render_result(&self, frame: &Frame<T>, result: &Vec<u8>) -> Result<(), Self::Error> {
    let index = self.counter.fetch_add(1, Ordering::AcqRel);
    if index % self.every != 0 {
      return Ok(());
    }

    let image = self.to_image(result)?;
    std::fs::create_dir_all(&self.directory)?;
    let path = self.directory.join(format!("{:08}.png", frame.sequence));
    image.save(&path)?;
    info!("保存快照: {}", path.display());
    Ok(())
  }
}
