// 该文件是 Beifeng （北风） 项目的一部分。
// src/task.rs - 推理任务
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{frame::Frame, model::Model, output::Render};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 任务统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSummary {
  pub processed: usize,
  pub skipped: usize,
  /// 推理失败而被丢弃的帧
  pub failed: usize,
}

/// 持续从帧队列取帧推理，直到达到帧数上限或收到停止信号
#[derive(Debug, Default, Clone)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: Arc<AtomicBool>,
}

impl ContinuousTask {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 置位后任务在处理完当前帧时退出
  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  /// 收到 Ctrl-C 时置位停止标志；30 秒内未退出则强制结束进程
  pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
    let stop = self.stop.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::Release);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
  }

  fn stopped(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  /// 与 [`Task::run_task`] 相同，并返回统计
  pub fn run<T, I, M, O>(&self, input: I, mut model: M, output: O) -> anyhow::Result<TaskSummary>
  where
    I: IntoIterator<Item = Frame<T>>,
    T: AsRef<M::Input>,
    M: Model,
    M::Error: std::error::Error + Send + Sync + 'static,
    O: Render<Frame<T>, M::Output>,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始任务...");
    let mut summary = TaskSummary::default();
    let mut now = Instant::now();

    for frame in input {
      if self.stopped() {
        warn!("中断信号接收，退出任务循环");
        return Ok(summary);
      }

      let data = match &frame.payload {
        Ok(data) => data,
        Err(err) => {
          warn!("跳过错误帧: {}", err);
          summary.skipped += 1;
          continue;
        }
      };

      info!("处理第 {} 帧图像 (序号 {})", summary.processed + 1, frame.sequence);
      let result = match model.infer(data.as_ref()) {
        Ok(result) => result,
        Err(err) => {
          warn!("推理失败，丢弃帧 {}: {}", frame.sequence, err);
          summary.failed += 1;
          now = Instant::now();
          continue;
        }
      };
      summary.processed += 1;
      let elapsed_a = now.elapsed();
      output.render_result(&frame, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();
      info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);

      if self
        .frame_number
        .is_some_and(|n| summary.processed >= n)
      {
        info!("达到指定帧数 {}, 退出任务循环", summary.processed);
        return Ok(summary);
      }
    }

    if self.stopped() {
      info!("任务完成，退出");
      return Ok(summary);
    }
    Err(anyhow::anyhow!(
      "视频源提前结束: 已处理 {} 帧, 跳过 {} 帧, 失败 {} 帧",
      summary.processed,
      summary.skipped,
      summary.failed
    ))
  }
}

impl<T, I, M, O> Task<I, M, O> for ContinuousTask
where
  I: IntoIterator<Item = Frame<T>>,
  T: AsRef<M::Input>,
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
  O: Render<Frame<T>, M::Output>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    self.run(input, model, output).map(|summary| {
      info!(
        "任务结束: 处理 {} 帧, 跳过 {} 帧, 失败 {} 帧",
        summary.processed, summary.skipped, summary.failed
      );
    })
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::RefCell, convert::Infallible};

  use chrono::Utc;

  use super::*;
  use crate::{
    frame::{FrameError, FrameType},
    stream::{CaptureError, CaptureErrorKind},
  };

  struct Length;

  impl Model for Length {
    type Input = [u8];
    type Output = usize;
    type Error = Infallible;

    fn infer(&mut self, input: &[u8]) -> Result<usize, Infallible> {
      Ok(input.len())
    }
  }

  #[derive(Default)]
  struct Collect(RefCell<Vec<(u64, usize)>>);

  impl Render<Frame, usize> for &Collect {
    type Error = Infallible;

    fn render_result(&self, frame: &Frame, result: &usize) -> Result<(), Infallible> {
      self.0.borrow_mut().push((frame.sequence, *result));
      Ok(())
    }
  }

  fn frame(sequence: u64, len: usize) -> Frame {
    Frame {
      sequence,
      timestamp: Utc::now(),
      frame_type: FrameType::Nv12,
      payload: Ok(vec![0; len]),
    }
  }

  #[test]
  fn test_skips_error_frames_until_limit() {
    let frames = vec![
      frame(1, 3),
      Frame::error(FrameError::Capture(CaptureError::new(
        CaptureErrorKind::Fatal,
        "坏帧",
      ))),
      frame(2, 5),
      frame(3, 7),
    ];
    let collect = Collect::default();
    let summary = ContinuousTask::new()
      .with_frame_number(Some(2))
      .run(frames, Length, &collect)
      .unwrap();
    assert_eq!(
      summary,
      TaskSummary {
        processed: 2,
        skipped: 1,
        failed: 0
      }
    );
    assert_eq!(*collect.0.borrow(), vec![(1, 3), (2, 5)]);
  }

  /// 第 n 次调用失败，其余返回输入长度
  struct FailOn {
    call: usize,
    fail_at: usize,
  }

  impl Model for FailOn {
    type Input = [u8];
    type Output = usize;
    type Error = std::io::Error;

    fn infer(&mut self, input: &[u8]) -> Result<usize, std::io::Error> {
      self.call += 1;
      if self.call == self.fail_at {
        return Err(std::io::Error::other("检测阶段失败"));
      }
      Ok(input.len())
    }
  }

  #[test]
  fn test_failed_inference_drops_frame() {
    let frames = vec![frame(1, 1), frame(2, 2), frame(3, 3), frame(4, 4)];
    let collect = Collect::default();
    let model = FailOn { call: 0, fail_at: 2 };
    let summary = ContinuousTask::new()
      .with_frame_number(Some(3))
      .run(frames, model, &collect)
      .unwrap();
    assert_eq!(
      summary,
      TaskSummary {
        processed: 3,
        skipped: 0,
        failed: 1
      }
    );
    assert_eq!(*collect.0.borrow(), vec![(1, 1), (3, 3), (4, 4)]);
  }

  #[test]
  fn test_source_end_is_error() {
    let collect = Collect::default();
    let result = ContinuousTask::new().run(vec![frame(1, 1)], Length, &collect);
    assert!(result.is_err());
  }

  #[test]
  fn test_stop_flag() {
    let task = ContinuousTask::new();
    task.stop_flag().store(true, Ordering::Release);
    let collect = Collect::default();
    let summary = task.run(vec![frame(1, 1)], Length, &collect).unwrap();
    assert_eq!(summary.processed, 0);
    assert!(collect.0.borrow().is_empty());
  }
}
