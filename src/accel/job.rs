// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel/job.rs - 同步任务执行
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
  fmt,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::debug;

use crate::{
  BoxError,
  accel::{AcceleratorDriver, AcceleratorSession, ModelHandle},
  arena::TensorArena,
};

/// 任务执行的三个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
  SetInput,
  Execute,
  GetOutput,
}

impl fmt::Display for JobStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      JobStep::SetInput => "设置输入",
      JobStep::Execute => "执行任务",
      JobStep::GetOutput => "读取输出",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
#[error("模型 {model} {step}失败: {source}")]
pub struct JobError {
  pub step: JobStep,
  pub model: String,
  #[source]
  pub source: BoxError,
}

impl JobError {
  fn new(step: JobStep, model: &str, source: impl Into<BoxError>) -> Self {
    Self {
      step,
      model: model.to_string(),
      source: source.into(),
    }
  }
}

/// 单次任务的耗时与调用方解码的输出
#[derive(Debug, Clone)]
pub struct JobResult<T> {
  pub execution_time: Duration,
  pub output: T,
}

impl<D: AcceleratorDriver> AcceleratorSession<D> {
  /// 执行一次完整的任务：设置输入、提交任务并阻塞等待、读取输出。
  ///
  /// 任一步骤失败都会立即返回，后续步骤不会执行；本函数不做重试。
  pub fn execute<T, SE, GE>(
    &mut self,
    model: &ModelHandle,
    set_input: impl FnOnce(&mut TensorArena) -> Result<(), SE>,
    get_output: impl FnOnce(&mut TensorArena) -> Result<T, GE>,
  ) -> Result<JobResult<T>, JobError>
  where
    SE: Into<BoxError>,
    GE: Into<BoxError>,
  {
    let start = Instant::now();

    set_input(&mut self.arena).map_err(|e| JobError::new(JobStep::SetInput, &model.name, e))?;

    let job = model.job.ok_or_else(|| {
      JobError::new(
        JobStep::Execute,
        &model.name,
        format!("模型 {} 未创建任务请求", model.name),
      )
    })?;
    self
      .driver
      .run_job(job)
      .map_err(|e| JobError::new(JobStep::Execute, &model.name, e))?;

    let output =
      get_output(&mut self.arena).map_err(|e| JobError::new(JobStep::GetOutput, &model.name, e))?;

    let execution_time = start.elapsed();
    debug!("模型 {} 任务完成, 耗时: {:.2?}", model.name, execution_time);
    Ok(JobResult {
      execution_time,
      output,
    })
  }
}
