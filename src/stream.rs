// 该文件是 Beifeng （北风） 项目的一部分。
// src/stream.rs - 视频流定义
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

use std::{fmt, time::Duration};

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  BoxError, FromUrl,
  frame::{FrameType, RawFrame},
};

mod manager;
pub use self::manager::{StreamError, StreamManager, StreamState, StreamStats};

#[cfg(feature = "v4l_capture")]
mod v4l_capture;
#[cfg(feature = "v4l_capture")]
pub use self::v4l_capture::{V4lCapture, V4lStream};

/// 采集错误的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureErrorKind {
  /// 服务进入维护或重启，需要重建视频流
  Expected,
  /// 单次取帧失败，可原地重试
  Transient,
  /// 其他错误，随帧上报后继续
  Fatal,
}

impl fmt::Display for CaptureErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CaptureErrorKind::Expected => "预期中断",
      CaptureErrorKind::Transient => "暂时失败",
      CaptureErrorKind::Fatal => "错误",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct CaptureError {
  kind: CaptureErrorKind,
  message: String,
  #[source]
  source: Option<BoxError>,
}

impl CaptureError {
  pub fn new(kind: CaptureErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      source: None,
    }
  }

  pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
    self.source = Some(source.into());
    self
  }

  pub fn kind(&self) -> CaptureErrorKind {
    self.kind
  }

  pub fn is_expected(&self) -> bool {
    self.kind == CaptureErrorKind::Expected
  }
}

/// 视频采集驱动
pub trait CaptureDriver: Send {
  type Stream: CaptureStream;

  fn open(&mut self, config: &StreamConfig) -> Result<Self::Stream, CaptureError>;
}

/// 已打开的视频流
pub trait CaptureStream: Send {
  fn start(&mut self) -> Result<(), CaptureError>;
  fn stop(&mut self) -> Result<(), CaptureError>;
  /// 阻塞读取一帧
  fn read_frame(&mut self) -> Result<RawFrame, CaptureError>;
}

/// 在采集线程内对每一帧执行的后处理
pub trait FrameProcessor: Send {
  type Output: Send + 'static;

  fn process(&mut self, data: Vec<u8>) -> Result<Self::Output, BoxError>;

  /// 处理后帧数据的格式
  fn output_type(&self, input: FrameType) -> FrameType {
    input
  }
}

/// 原样投递
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl FrameProcessor for Passthrough {
  type Output = Vec<u8>;

  fn process(&mut self, data: Vec<u8>) -> Result<Self::Output, BoxError> {
    Ok(data)
  }
}

#[derive(Error, Debug)]
pub enum StreamConfigError {
  #[error("参数 {key} 取值无效: {value}")]
  InvalidQuery { key: String, value: String },
  #[error("缺少设备")]
  MissingDevice,
}

/// 视频流参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
  pub device: String,
  pub width: u32,
  pub height: u32,
  pub framerate: u32,
  pub format: FrameType,
  pub buffers: u32,
  /// 单次取帧的最长等待，超时按暂时失败处理；`None` 时一直阻塞
  pub read_timeout: Option<Duration>,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      device: "/dev/video0".to_string(),
      width: 640,
      height: 480,
      framerate: 15,
      format: FrameType::Nv12,
      buffers: 4,
      read_timeout: Some(Duration::from_secs(2)),
    }
  }
}

impl StreamConfig {
  /// NV12 单帧字节数
  pub fn nv12_frame_size(&self) -> usize {
    self.width as usize * self.height as usize * 3 / 2
  }
}

fn parse_query<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, StreamConfigError> {
  value.parse().map_err(|_| StreamConfigError::InvalidQuery {
    key: key.to_string(),
    value: value.to_string(),
  })
}

/// 解析形如 `v4l:///dev/video0?width=640&height=480&fps=15&format=nv12&timeout=2000` 的地址，
/// `timeout` 以毫秒计，0 表示不设超时；
/// 路径为空时以主机名作为设备，例如 `vdo://1`
impl FromUrl for StreamConfig {
  type Error = StreamConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let device = match (url.path(), url.host_str()) {
      (path, _) if !path.is_empty() && path != "/" => path.to_string(),
      (_, Some(host)) if !host.is_empty() => host.to_string(),
      _ => return Err(StreamConfigError::MissingDevice),
    };

    let mut config = StreamConfig {
      device,
      ..Default::default()
    };
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "width" => config.width = parse_query(&key, &value)?,
        "height" => config.height = parse_query(&key, &value)?,
        "fps" | "framerate" => config.framerate = parse_query(&key, &value)?,
        "format" => config.format = parse_query(&key, &value)?,
        "buffers" => config.buffers = parse_query(&key, &value)?,
        "timeout" => {
          let millis: u64 = parse_query(&key, &value)?;
          config.read_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        other => warn!("忽略未知的视频流参数: {}={}", other, value),
      }
    }
    Ok(config)
  }
}

/// 视频流管理参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
  /// 投递队列容量
  pub queue_capacity: usize,
  /// 重启次数上限，达到后进入错误状态
  pub max_restart_retries: u32,
  /// 每次重启前的等待时间
  pub restart_cooldown: Duration,
  /// 单帧暂时失败的重试次数
  pub fetch_retries: u32,
  /// 首次重试前的等待时间，之后逐次翻倍
  pub fetch_backoff: Duration,
}

impl Default for StreamOptions {
  fn default() -> Self {
    Self {
      queue_capacity: 30,
      max_restart_retries: 4,
      restart_cooldown: Duration::from_secs(2),
      fetch_retries: 3,
      fetch_backoff: Duration::from_millis(50),
    }
  }
}

impl StreamOptions {
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  pub fn max_restart_retries(mut self, retries: u32) -> Self {
    self.max_restart_retries = retries;
    self
  }

  pub fn restart_cooldown(mut self, cooldown: Duration) -> Self {
    self.restart_cooldown = cooldown;
    self
  }

  pub fn fetch_retries(mut self, retries: u32) -> Self {
    self.fetch_retries = retries;
    self
  }

  pub fn fetch_backoff(mut self, backoff: Duration) -> Self {
    self.fetch_backoff = backoff;
    self
  }
}
