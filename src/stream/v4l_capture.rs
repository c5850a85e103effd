// 该文件是 Beifeng （北风） 项目的一部分。
// src/stream/v4l_capture.rs - V4L2 视频采集
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  io,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use chrono::Utc;
use tracing::{debug, info};
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream as MmapStream, traits::CaptureStream as _, traits::Stream as _},
  video::Capture,
};

use crate::{
  frame::{FrameType, RawFrame},
  stream::{CaptureDriver, CaptureError, CaptureErrorKind, CaptureStream, StreamConfig},
};

fn fourcc(format: FrameType) -> Result<FourCC, CaptureError> {
  let code = match format {
    FrameType::Nv12 => b"NV12",
    FrameType::Yuv => b"YUYV",
    FrameType::Rgb => b"RGB3",
    FrameType::Jpeg => b"MJPG",
    FrameType::H264 => b"H264",
    FrameType::H265 => b"HEVC",
    other => {
      return Err(CaptureError::new(
        CaptureErrorKind::Fatal,
        format!("V4L 不支持帧格式 {}", other),
      ));
    }
  };
  Ok(FourCC::new(code))
}

/// 设备消失视为服务重启，需要重建视频流；被打断或超时可原地重试
fn classify(err: io::Error, context: &str) -> CaptureError {
  let kind = match (err.raw_os_error(), err.kind()) {
    (Some(libc::ENODEV), _) | (Some(libc::ENXIO), _) => CaptureErrorKind::Expected,
    (Some(libc::EAGAIN), _) | (Some(libc::EINTR), _) => CaptureErrorKind::Transient,
    (_, io::ErrorKind::TimedOut) | (_, io::ErrorKind::Interrupted) => CaptureErrorKind::Transient,
    _ => CaptureErrorKind::Fatal,
  };
  CaptureError::new(kind, context.to_string()).with_source(err)
}

/// V4L2 采集驱动
///
/// 驱动的帧序号每次开流都从 0 开始，这里在重建视频流之间累加，保证序号单调递增。
#[derive(Debug, Default, Clone)]
pub struct V4lCapture {
  last_sequence: Arc<AtomicU64>,
}

impl V4lCapture {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CaptureDriver for V4lCapture {
  type Stream = V4lStream;

  fn open(&mut self, config: &StreamConfig) -> Result<Self::Stream, CaptureError> {
    let device = Device::with_path(&config.device).map_err(|e| classify(e, "打开设备失败"))?;

    let mut format = device.format().map_err(|e| classify(e, "读取格式失败"))?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = fourcc(config.format)?;
    let format = device
      .set_format(&format)
      .map_err(|e| classify(e, "设置格式失败"))?;
    info!(
      "V4L 设备 {} 已打开: {}x{} {}",
      config.device, format.width, format.height, format.fourcc
    );

    Ok(V4lStream {
      device,
      stream: None,
      buffers: config.buffers,
      read_timeout: config.read_timeout,
      frame_type: config.format,
      base_sequence: self.last_sequence.load(Ordering::Acquire),
      last_sequence: self.last_sequence.clone(),
    })
  }
}

/// 基于 mmap 缓冲区的 V4L2 视频流
pub struct V4lStream {
  device: Device,
  stream: Option<MmapStream<'static>>,
  buffers: u32,
  read_timeout: Option<Duration>,
  frame_type: FrameType,
  base_sequence: u64,
  last_sequence: Arc<AtomicU64>,
}

impl CaptureStream for V4lStream {
  fn start(&mut self) -> Result<(), CaptureError> {
    let mut stream = MmapStream::with_buffers(&mut self.device, Type::VideoCapture, self.buffers)
      .map_err(|e| classify(e, "创建缓冲区失败"))?;
    // 无超时时停止采集要等到下一帧到达
    if let Some(timeout) = self.read_timeout {
      stream.set_timeout(timeout);
    }
    stream.start().map_err(|e| classify(e, "启动采集失败"))?;
    self.stream = Some(stream);
    Ok(())
  }

  fn stop(&mut self) -> Result<(), CaptureError> {
    if let Some(mut stream) = self.stream.take() {
      stream.stop().map_err(|e| classify(e, "停止采集失败"))?;
    }
    Ok(())
  }

  fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| CaptureError::new(CaptureErrorKind::Fatal, "视频流未启动"))?;
    let (buf, meta) = stream.next().map_err(|e| classify(e, "读取帧失败"))?;
    let used = (meta.bytesused as usize).min(buf.len());
    let used = if used == 0 { buf.len() } else { used };
    let sequence = self.base_sequence + meta.sequence as u64 + 1;
    self.last_sequence.store(sequence, Ordering::Release);
    debug!("V4L 帧 {}: {} 字节", sequence, used);

    Ok(RawFrame {
      sequence,
      timestamp: Utc::now(),
      frame_type: self.frame_type,
      data: buf[..used].to_vec(),
    })
  }
}
