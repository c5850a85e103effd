// 该文件是 Beifeng （北风） 项目的一部分。
// src/frame.rs - 视频帧定义
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

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{BoxError, stream::CaptureError};

/// 帧数据的像素格式或编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
  #[default]
  None,
  H264,
  H265,
  Jpeg,
  Yuv,
  Nv12,
  Rgb,
  PlanarRgb,
  Raw,
}

impl FrameType {
  pub fn as_str(&self) -> &'static str {
    match self {
      FrameType::None => "none",
      FrameType::H264 => "h264",
      FrameType::H265 => "h265",
      FrameType::Jpeg => "jpeg",
      FrameType::Yuv => "yuv",
      FrameType::Nv12 => "nv12",
      FrameType::Rgb => "rgb",
      FrameType::PlanarRgb => "planar-rgb",
      FrameType::Raw => "raw",
    }
  }
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的帧格式: {0}")]
pub struct UnknownFrameType(pub String);

impl FromStr for FrameType {
  type Err = UnknownFrameType;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.to_ascii_lowercase().as_str() {
      "none" => FrameType::None,
      "h264" => FrameType::H264,
      "h265" => FrameType::H265,
      "jpeg" | "jpg" | "mjpeg" => FrameType::Jpeg,
      "yuv" | "yuyv" => FrameType::Yuv,
      "nv12" => FrameType::Nv12,
      "rgb" => FrameType::Rgb,
      "planar-rgb" => FrameType::PlanarRgb,
      "raw" => FrameType::Raw,
      _ => return Err(UnknownFrameType(s.to_string())),
    })
  }
}

/// 采集驱动读出的一帧原始数据
#[derive(Debug, Clone)]
pub struct RawFrame {
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  pub frame_type: FrameType,
  pub data: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("采集失败: {0}")]
  Capture(#[from] CaptureError),
  #[error("后处理失败: {0}")]
  Process(#[source] BoxError),
}

impl FrameError {
  /// 是否为服务维护导致的预期错误
  pub fn is_expected(&self) -> bool {
    matches!(self, FrameError::Capture(e) if e.is_expected())
  }
}

/// 投递给消费者的帧。
///
/// 错误帧没有对应的驱动帧，序号为 0，时间戳为出错时刻。
#[derive(Debug)]
pub struct Frame<T = Vec<u8>> {
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  pub frame_type: FrameType,
  pub payload: Result<T, FrameError>,
}

impl<T> Frame<T> {
  pub fn error(err: impl Into<FrameError>) -> Self {
    Self {
      sequence: 0,
      timestamp: Utc::now(),
      frame_type: FrameType::None,
      payload: Err(err.into()),
    }
  }

  pub fn is_error(&self) -> bool {
    self.payload.is_err()
  }

  pub fn data(&self) -> Option<&T> {
    self.payload.as_ref().ok()
  }

  pub fn err(&self) -> Option<&FrameError> {
    self.payload.as_ref().err()
  }
}
