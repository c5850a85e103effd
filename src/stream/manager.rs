// 该文件是 Beifeng （北风） 项目的一部分。
// src/stream/manager.rs - 视频流生命周期管理
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

//! # 视频流管理
//!
//! 状态转换：`Init → Started ⇄ Restarting → Started`，
//! 终止状态为 `Error`（重启次数耗尽）与 `Stopped`（主动停止）。
//!
//! 采集线程是状态、重试计数与重启计数的唯一写入方，
//! 公开的查询方法只读取原子变量，不需要加锁。
//! 停止是协作式的：采集线程只在当前阻塞读取返回后才会察觉并退出。

use std::{
  io,
  sync::{
    Arc,
    atomic::{AtomicU8, AtomicU32, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{Frame, FrameError, RawFrame},
  stream::{
    CaptureDriver, CaptureError, CaptureErrorKind, CaptureStream, FrameProcessor, Passthrough,
    StreamConfig, StreamOptions,
  },
};

/// 队列已满时检查停止标志的间隔
const PUSH_POLL: Duration = Duration::from_millis(100);
/// 等待期间检查停止标志的间隔
const PAUSE_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
  Init = 0,
  Started = 1,
  Restarting = 2,
  Error = 3,
  Stopped = 4,
}

impl StreamState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => StreamState::Init,
      1 => StreamState::Started,
      2 => StreamState::Restarting,
      3 => StreamState::Error,
      _ => StreamState::Stopped,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, StreamState::Error | StreamState::Stopped)
  }
}

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("启动视频流失败: {0}")]
  Start(#[source] CaptureError),
  #[error("视频流已启动")]
  AlreadyStarted,
  #[error("视频流已处于终止状态 {0:?}")]
  Terminated(StreamState),
  #[error("创建采集线程失败: {0}")]
  Spawn(#[source] io::Error),
  #[error("采集线程异常退出")]
  FetchPanicked,
}

/// 视频流运行统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
  pub state: StreamState,
  /// 队列中尚未取走的帧数
  pub queued: usize,
  pub capacity: usize,
  /// 自上一次成功取帧以来的重启次数
  pub restart_retries: u32,
  /// 累计重启次数
  pub restarts: u32,
}

impl StreamStats {
  pub fn to_json(&self) -> serde_json::Value {
    json!({
      "state": format!("{:?}", self.state),
      "queued": self.queued,
      "capacity": self.capacity,
      "restart_retries": self.restart_retries,
      "restarts": self.restarts,
    })
  }
}

#[derive(Debug)]
struct SharedState {
  state: AtomicU8,
  retries: AtomicU32,
  restarts: AtomicU32,
}

impl SharedState {
  fn new() -> Self {
    Self {
      state: AtomicU8::new(StreamState::Init as u8),
      retries: AtomicU32::new(0),
      restarts: AtomicU32::new(0),
    }
  }

  fn state(&self) -> StreamState {
    StreamState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn is_stopped(&self) -> bool {
    self.state() == StreamState::Stopped
  }

  /// 切换状态；已停止时不再改变，返回 `false`
  fn transition(&self, to: StreamState) -> bool {
    let result = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current != StreamState::Stopped as u8).then_some(to as u8)
      });
    match result {
      Ok(from) => {
        let from = StreamState::from_u8(from);
        if from != to {
          info!("视频流状态: {:?} -> {:?}", from, to);
        }
        true
      }
      Err(_) => false,
    }
  }

  fn stop(&self) -> StreamState {
    let from = StreamState::from_u8(self.state.swap(StreamState::Stopped as u8, Ordering::AcqRel));
    if from != StreamState::Stopped {
      info!("视频流状态: {:?} -> {:?}", from, StreamState::Stopped);
    }
    from
  }
}

/// 采集线程持有的全部资源
struct FetchLoop<C: CaptureDriver, P: FrameProcessor> {
  driver: C,
  stream: Option<C::Stream>,
  config: StreamConfig,
  options: StreamOptions,
  processor: P,
  shared: Arc<SharedState>,
  tx: Sender<Frame<P::Output>>,
}

impl<C: CaptureDriver, P: FrameProcessor> FetchLoop<C, P> {
  fn run(mut self) {
    debug!("采集线程启动: {}", self.config.device);
    while !self.shared.is_stopped() {
      match self.read_with_retry() {
        Ok(raw) => {
          self.shared.retries.store(0, Ordering::Release);
          if self.shared.is_stopped() {
            break;
          }
          let frame = self.process(raw);
          if !self.push(frame) {
            break;
          }
        }
        Err(err) if err.is_expected() => {
          warn!("视频流中断: {}", err);
          if !self.recover() {
            break;
          }
        }
        Err(err) => {
          warn!("取帧失败: {}", err);
          if !self.push(Frame::error(err)) {
            break;
          }
        }
      }
    }
    self.shutdown();
    info!("采集线程退出, 状态: {:?}", self.shared.state());
  }

  /// 暂时失败时原地重试，等待时间逐次翻倍
  fn read_with_retry(&mut self) -> Result<RawFrame, CaptureError> {
    let mut backoff = self.options.fetch_backoff;
    let mut attempt = 0;
    loop {
      let stream = self
        .stream
        .as_mut()
        .ok_or_else(|| CaptureError::new(CaptureErrorKind::Fatal, "视频流未打开"))?;
      match stream.read_frame() {
        Err(err)
          if err.kind() == CaptureErrorKind::Transient
            && attempt < self.options.fetch_retries
            && !self.shared.is_stopped() =>
        {
          attempt += 1;
          debug!(
            "取帧暂时失败 ({}/{}), {:?} 后重试: {}",
            attempt, self.options.fetch_retries, backoff, err
          );
          thread::sleep(backoff);
          backoff = backoff.saturating_mul(2);
        }
        result => return result,
      }
    }
  }

  fn process(&mut self, raw: RawFrame) -> Frame<P::Output> {
    let RawFrame {
      sequence,
      timestamp,
      frame_type,
      data,
    } = raw;
    let payload = self.processor.process(data).map_err(|e| {
      warn!("第 {} 帧后处理失败: {}", sequence, e);
      FrameError::Process(e)
    });
    Frame {
      sequence,
      timestamp,
      frame_type: self.processor.output_type(frame_type),
      payload,
    }
  }

  /// 队列满时阻塞，期间定期检查停止标志
  fn push(&self, mut frame: Frame<P::Output>) -> bool {
    loop {
      match self.tx.send_timeout(frame, PUSH_POLL) {
        Ok(()) => return true,
        Err(SendTimeoutError::Timeout(returned)) => {
          if self.shared.is_stopped() {
            return false;
          }
          frame = returned;
        }
        Err(SendTimeoutError::Disconnected(_)) => {
          warn!("帧队列已关闭");
          return false;
        }
      }
    }
  }

  /// 重建视频流，成功返回 `true`；重试次数耗尽或已停止返回 `false`
  fn recover(&mut self) -> bool {
    let max = self.options.max_restart_retries;
    loop {
      if !self.shared.transition(StreamState::Restarting) {
        return false;
      }
      let retries = self.shared.retries.fetch_add(1, Ordering::AcqRel) + 1;
      self.shared.restarts.fetch_add(1, Ordering::AcqRel);
      warn!(
        "{:?} 后重启视频流 ({}/{})",
        self.options.restart_cooldown, retries, max
      );

      if !self.pause(self.options.restart_cooldown) {
        return false;
      }
      let reopened = self.reopen();

      if retries >= max {
        error!("视频流重启次数达到上限 {}, 停止采集", max);
        self.shared.transition(StreamState::Error);
        return false;
      }
      match reopened {
        Ok(()) => return self.shared.transition(StreamState::Started),
        Err(err) => warn!("重启视频流失败: {}", err),
      }
    }
  }

  /// 可被停止打断的等待
  fn pause(&self, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
      if self.shared.is_stopped() {
        return false;
      }
      let now = Instant::now();
      if now >= deadline {
        return true;
      }
      thread::sleep(PAUSE_STEP.min(deadline - now));
    }
  }

  fn reopen(&mut self) -> Result<(), CaptureError> {
    self.shutdown();
    let mut stream = self.driver.open(&self.config)?;
    stream.start()?;
    self.stream = Some(stream);
    Ok(())
  }

  fn shutdown(&mut self) {
    if let Some(mut stream) = self.stream.take()
      && let Err(e) = stream.stop()
    {
      warn!("停止视频流失败: {}", e);
    }
  }
}

/// 视频流管理器
///
/// 启动后由独立线程循环取帧，经可选的后处理后投递到有界队列。
pub struct StreamManager<C: CaptureDriver + 'static, P: FrameProcessor + 'static = Passthrough> {
  shared: Arc<SharedState>,
  fetch: Option<FetchLoop<C, P>>,
  handle: Option<JoinHandle<()>>,
  frames: Receiver<Frame<P::Output>>,
  capacity: usize,
}

impl<C: CaptureDriver + 'static> StreamManager<C, Passthrough> {
  pub fn new(driver: C, config: StreamConfig, options: StreamOptions) -> Self {
    Self::with_processor(driver, config, options, Passthrough)
  }
}

impl<C: CaptureDriver + 'static, P: FrameProcessor + 'static> StreamManager<C, P> {
  /// 每帧取到后先在采集线程内经过 `processor` 处理，再投递给消费者
  pub fn with_processor(driver: C, config: StreamConfig, options: StreamOptions, processor: P) -> Self {
    let capacity = options.queue_capacity;
    let (tx, frames) = bounded(capacity);
    let shared = Arc::new(SharedState::new());
    let fetch = FetchLoop {
      driver,
      stream: None,
      config,
      options,
      processor,
      shared: shared.clone(),
      tx,
    };
    Self {
      shared,
      fetch: Some(fetch),
      handle: None,
      frames,
      capacity,
    }
  }

  /// 打开并启动视频流，随后启动采集线程
  pub fn start(&mut self) -> Result<(), StreamError> {
    let state = self.shared.state();
    if state.is_terminal() {
      return Err(StreamError::Terminated(state));
    }
    let mut fetch = self.fetch.take().ok_or(StreamError::AlreadyStarted)?;

    if let Err(err) = fetch.reopen() {
      error!("启动视频流失败: {}", err);
      self.fetch = Some(fetch);
      return Err(StreamError::Start(err));
    }
    self.shared.transition(StreamState::Started);

    let handle = thread::Builder::new()
      .name("beifeng-fetch".to_string())
      .spawn(move || fetch.run())
      .map_err(|e| {
        error!("创建采集线程失败: {}", e);
        self.shared.transition(StreamState::Error);
        StreamError::Spawn(e)
      })?;
    self.handle = Some(handle);
    Ok(())
  }

  /// 停止视频流并等待采集线程结束
  pub fn stop(&mut self) -> Result<(), StreamError> {
    self.shared.stop();
    if let Some(mut fetch) = self.fetch.take() {
      fetch.shutdown();
    }
    if let Some(handle) = self.handle.take() {
      handle.join().map_err(|_| StreamError::FetchPanicked)?;
    }
    Ok(())
  }

  pub fn state(&self) -> StreamState {
    self.shared.state()
  }

  pub fn is_running(&self) -> bool {
    matches!(self.state(), StreamState::Started | StreamState::Restarting)
  }

  pub fn restart_retries(&self) -> u32 {
    self.shared.retries.load(Ordering::Acquire)
  }

  pub fn restarts(&self) -> u32 {
    self.shared.restarts.load(Ordering::Acquire)
  }

  /// 帧队列；采集线程退出后队列会在取空后断开
  pub fn frames(&self) -> Receiver<Frame<P::Output>> {
    self.frames.clone()
  }

  pub fn stats(&self) -> StreamStats {
    StreamStats {
      state: self.state(),
      queued: self.frames.len(),
      capacity: self.capacity,
      restart_retries: self.restart_retries(),
      restarts: self.restarts(),
    }
  }
}

impl<C: CaptureDriver + 'static, P: FrameProcessor + 'static> Drop for StreamManager<C, P> {
  fn drop(&mut self) {
    if self.fetch.is_none() && self.handle.is_none() {
      return;
    }
    if let Err(e) = self.stop() {
      warn!("停止视频流失败: {}", e);
    }
  }
}
