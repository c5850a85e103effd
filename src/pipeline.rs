// 该文件是 Beifeng （北风） 项目的一部分。
// src/pipeline.rs - 预处理与检测流水线
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

//! # 流水线
//!
//! 预处理模型的 0 号输出缓冲区直接作为检测模型的 0 号输入缓冲区，中间不做拷贝。
//! 两个阶段在同一线程上严格先后执行：预处理任务完成写入之后，检测任务才会开始读取。
//! 缓冲区只有一份，因此下一帧的预处理必须等上一帧的检测结束。

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  BoxError,
  accel::{
    Access, AcceleratorDriver, AcceleratorSession, JobError, JobResult, MemMapConfiguration,
    ModelHandle, ModelSource, ParamMap, ParamValue, SessionError,
    cpu::{KEY_INPUT_CROP, KEY_INPUT_FORMAT, KEY_INPUT_SIZE, KEY_OUTPUT_FORMAT, KEY_OUTPUT_SIZE},
  },
  arena::{ArenaError, BufferId, SlotSize},
  frame::FrameType,
  model::{DecodeError, Detection, DetectionDecoder, Model},
  stream::FrameProcessor,
};

pub const PREPROCESS_MODEL_NAME: &str = "preprocess";

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("加速器会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("预处理阶段失败: {0}")]
  Preprocess(#[source] JobError),
  #[error("检测阶段失败: {0}")]
  Detect(#[source] JobError),
  #[error("解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("模型 {model} 的张量槽位 {slot} 没有绑定缓冲区")]
  MissingBuffer { model: String, slot: usize },
  #[error("预处理输出 pitch 为 {actual:?}, 期望 {expected}")]
  PitchMismatch {
    expected: usize,
    actual: Option<usize>,
  },
  #[error("检测输出张量 {slot} 容量 {capacity} 小于解码所需 {expected}")]
  OutputTooSmall {
    slot: usize,
    capacity: usize,
    expected: usize,
  },
  #[error("流水线已销毁")]
  Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

impl Resolution {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn rgb_size(&self) -> usize {
    self.width as usize * self.height as usize * 3
  }

  pub fn nv12_size(&self) -> usize {
    self.width as usize * self.height as usize * 3 / 2
  }

  fn to_param(self) -> [i64; 2] {
    [self.width as i64, self.height as i64]
  }
}

/// 裁剪框
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropArea {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl CropArea {
  /// 按目标宽高比在视频帧中取居中的最大裁剪框；任一尺寸为零时取整帧
  pub fn centered(target: Resolution, stream: Resolution) -> Self {
    let full = Self {
      x: 0,
      y: 0,
      width: stream.width,
      height: stream.height,
    };
    if [target.width, target.height, stream.width, stream.height].contains(&0) {
      return full;
    }

    let ratio = target.width as f64 / target.height as f64;
    let mut width = stream.width as f64;
    let mut height = width / ratio;
    if height > stream.height as f64 {
      height = stream.height as f64;
      width = height * ratio;
    }
    let width = (width as u32).min(stream.width);
    let height = (height as u32).min(stream.height);
    Self {
      x: (stream.width - width) / 2,
      y: (stream.height - height) / 2,
      width,
      height,
    }
  }

  pub fn is_full_frame(&self, stream: Resolution) -> bool {
    self.x == 0 && self.y == 0 && self.width == stream.width && self.height == stream.height
  }

  pub fn to_param(&self) -> ParamValue {
    ParamValue::IntArr4([
      self.x as i64,
      self.y as i64,
      self.width as i64,
      self.height as i64,
    ])
  }
}

/// 预处理输出的 RGB 排列方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RgbFormat {
  #[default]
  Interleaved,
  Planar,
}

impl RgbFormat {
  pub fn as_str(&self) -> &'static str {
    match self {
      RgbFormat::Interleaved => "rgb-interleaved",
      RgbFormat::Planar => "rgb-planar",
    }
  }

  pub fn frame_type(&self) -> FrameType {
    match self {
      RgbFormat::Interleaved => FrameType::Rgb,
      RgbFormat::Planar => FrameType::PlanarRgb,
    }
  }
}

/// NV12 到 RGB 的预处理模型参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessSpec {
  pub device: String,
  pub input: Resolution,
  pub output: Resolution,
  pub format: RgbFormat,
  /// 宽高比不同时是否居中裁剪
  pub crop: bool,
}

impl PreprocessSpec {
  pub fn new(device: impl Into<String>, input: Resolution, output: Resolution) -> Self {
    Self {
      device: device.into(),
      input,
      output,
      format: RgbFormat::default(),
      crop: true,
    }
  }

  pub fn format(mut self, format: RgbFormat) -> Self {
    self.format = format;
    self
  }

  pub fn crop(mut self, crop: bool) -> Self {
    self.crop = crop;
    self
  }

  pub fn load_params(&self) -> ParamMap {
    ParamMap::new()
      .with(KEY_INPUT_FORMAT, "nv12")
      .with(KEY_INPUT_SIZE, self.input.to_param())
      .with(KEY_OUTPUT_FORMAT, self.format.as_str())
      .with(KEY_OUTPUT_SIZE, self.output.to_param())
  }

  /// 需要裁剪时返回任务参数
  pub fn job_params(&self) -> Option<ParamMap> {
    if !self.crop {
      return None;
    }
    let area = CropArea::centered(self.output, self.input);
    if area.is_full_frame(self.input) {
      return None;
    }
    debug!("预处理裁剪框: {:?}", area);
    Some(ParamMap::new().with(KEY_INPUT_CROP, area.to_param()))
  }

  /// 加载预处理模型、创建张量并校验输出大小
  pub fn build<D: AcceleratorDriver>(
    &self,
    session: &mut AcceleratorSession<D>,
  ) -> Result<ModelHandle, PipelineError> {
    let mut model = session.load_model(
      &ModelSource::Builtin,
      &self.device,
      Access::Private,
      PREPROCESS_MODEL_NAME,
      Some(&self.load_params()),
    )?;

    let expected = self.output.rgb_size();
    let config = MemMapConfiguration::new()
      .input(0, SlotSize::FromPitch)
      .output(0, SlotSize::Fixed(expected));
    let prepared = session
      .realize_tensors(&mut model, &config)
      .map_err(PipelineError::from)
      .and_then(|_| match model.output_pitch(0) {
        Some(pitch) if pitch == expected => Ok(()),
        actual => Err(PipelineError::PitchMismatch { expected, actual }),
      })
      .and_then(|_| {
        session
          .create_job_request(&mut model, self.job_params().as_ref())
          .map_err(PipelineError::from)
      });

    match prepared {
      Ok(()) => Ok(model),
      Err(err) => {
        if let Err(e) = session.destroy_model(model) {
          warn!("销毁预处理模型失败: {}", e);
        }
        Err(err)
      }
    }
  }
}

fn buffer(model: &ModelHandle, slot: usize, output: bool) -> Result<BufferId, PipelineError> {
  let id = if output {
    model.output_buffer(slot)
  } else {
    model.input_buffer(slot)
  };
  id.ok_or_else(|| PipelineError::MissingBuffer {
    model: model.name().to_string(),
    slot,
  })
}

/// 仅做预处理的阶段，输出 RGB 数据
pub struct PreprocessStage<D: AcceleratorDriver> {
  session: AcceleratorSession<D>,
  model: Option<ModelHandle>,
  format: RgbFormat,
  output_size: usize,
}

impl<D: AcceleratorDriver> PreprocessStage<D> {
  pub fn new(mut session: AcceleratorSession<D>, spec: &PreprocessSpec) -> Result<Self, PipelineError> {
    let model = spec.build(&mut session)?;
    Ok(Self {
      session,
      model: Some(model),
      format: spec.format,
      output_size: spec.output.rgb_size(),
    })
  }

  pub fn run(&mut self, frame: &[u8]) -> Result<JobResult<Vec<u8>>, PipelineError> {
    let model = self.model.as_ref().ok_or(PipelineError::Destroyed)?;
    let input = buffer(model, 0, false)?;
    let output = buffer(model, 0, true)?;
    let size = self.output_size;

    self
      .session
      .execute(
        model,
        |arena| {
          arena.rewind(input)?;
          arena.copy_in(input, frame)?;
          arena.rewind(output)
        },
        |arena| arena.copy_out(output, size),
      )
      .map_err(PipelineError::Preprocess)
  }

  pub fn session(&self) -> &AcceleratorSession<D> {
    &self.session
  }

  pub fn destroy(mut self) -> Result<(), PipelineError> {
    match self.model.take() {
      Some(model) => Ok(self.session.destroy_model(model)?),
      None => Ok(()),
    }
  }
}

impl<D: AcceleratorDriver> Drop for PreprocessStage<D> {
  fn drop(&mut self) {
    if let Some(model) = self.model.take()
      && let Err(e) = self.session.destroy_model(model)
    {
      warn!("销毁预处理模型失败: {}", e);
    }
  }
}

impl<D: AcceleratorDriver + Send> FrameProcessor for PreprocessStage<D> {
  type Output = Vec<u8>;

  fn process(&mut self, data: Vec<u8>) -> Result<Self::Output, BoxError> {
    Ok(self.run(&data)?.output)
  }

  fn output_type(&self, _input: FrameType) -> FrameType {
    self.format.frame_type()
  }
}

impl<D: AcceleratorDriver> Model for PreprocessStage<D> {
  type Input = [u8];
  type Output = Vec<u8>;
  type Error = PipelineError;

  fn infer(&mut self, input: &[u8]) -> Result<Self::Output, Self::Error> {
    Ok(self.run(input)?.output)
  }
}

/// 单帧流水线结果
#[derive(Debug, Clone)]
pub struct PipelineOutput {
  pub detections: Vec<Detection>,
  pub preprocess_time: Duration,
  pub inference_time: Duration,
}

/// 预处理与检测两个阶段组成的流水线
pub struct ModelPipeline<D: AcceleratorDriver, K: DetectionDecoder> {
  session: AcceleratorSession<D>,
  preprocess: Option<ModelHandle>,
  detect: Option<ModelHandle>,
  decoder: K,
  shared: BufferId,
  outputs: Vec<(BufferId, usize)>,
}

impl<D: AcceleratorDriver, K: DetectionDecoder> ModelPipeline<D, K> {
  /// 组合两个模型。
  ///
  /// `preprocess` 需已创建张量；`detect` 只需加载，它的 0 号输入会绑定到预处理的 0 号输出，
  /// 输出张量按 pitch 分配，容量不得小于解码器声明的大小。
  pub fn compose(
    mut session: AcceleratorSession<D>,
    preprocess: ModelHandle,
    mut detect: ModelHandle,
    decoder: K,
    job_params: Option<&ParamMap>,
  ) -> Result<Self, PipelineError> {
    let bound = Self::bind(&mut session, &preprocess, &mut detect, &decoder, job_params);
    match bound {
      Ok((shared, outputs)) => {
        info!(
          "流水线已组合: {} 的输出缓冲区 {} 作为 {} 的输入",
          preprocess.name(),
          shared,
          detect.name()
        );
        Ok(Self {
          session,
          preprocess: Some(preprocess),
          detect: Some(detect),
          decoder,
          shared,
          outputs,
        })
      }
      Err(err) => {
        for model in [detect, preprocess] {
          if let Err(e) = session.destroy_model(model) {
            warn!("销毁模型失败: {}", e);
          }
        }
        Err(err)
      }
    }
  }

  fn bind(
    session: &mut AcceleratorSession<D>,
    preprocess: &ModelHandle,
    detect: &mut ModelHandle,
    decoder: &K,
    job_params: Option<&ParamMap>,
  ) -> Result<(BufferId, Vec<(BufferId, usize)>), PipelineError> {
    let shared = buffer(preprocess, 0, true)?;
    let sizes = decoder.output_sizes();

    let config = sizes
      .iter()
      .enumerate()
      .fold(
        MemMapConfiguration::new().input(0, SlotSize::Shared(shared)),
        |config, (slot, _)| config.output(slot, SlotSize::FromPitch),
      );
    session.realize_tensors(detect, &config)?;

    let mut outputs = Vec::with_capacity(sizes.len());
    for (slot, &expected) in sizes.iter().enumerate() {
      let id = buffer(detect, slot, true)?;
      let capacity = session.arena().capacity(id).map_err(SessionError::from)?;
      if capacity < expected {
        return Err(PipelineError::OutputTooSmall {
          slot,
          capacity,
          expected,
        });
      }
      outputs.push((id, expected));
    }

    session.create_job_request(detect, job_params)?;
    Ok((shared, outputs))
  }

  /// 处理一帧：预处理、检测、解码
  pub fn run(&mut self, frame: &[u8]) -> Result<PipelineOutput, PipelineError> {
    let preprocess = self.preprocess.as_ref().ok_or(PipelineError::Destroyed)?;
    let detect = self.detect.as_ref().ok_or(PipelineError::Destroyed)?;
    let input = buffer(preprocess, 0, false)?;
    let shared = self.shared;
    let outputs = &self.outputs;

    let prepared = self
      .session
      .execute(
        preprocess,
        |arena| {
          arena.rewind(input)?;
          arena.copy_in(input, frame)?;
          arena.rewind(shared)
        },
        |_| Ok::<_, ArenaError>(()),
      )
      .map_err(PipelineError::Preprocess)?;

    let inferred = self
      .session
      .execute(
        detect,
        |arena| {
          arena.rewind(shared)?;
          outputs.iter().try_for_each(|&(id, _)| arena.rewind(id))
        },
        |arena| {
          outputs
            .iter()
            .map(|&(id, len)| arena.copy_out(id, len))
            .collect::<Result<Vec<_>, ArenaError>>()
        },
      )
      .map_err(PipelineError::Detect)?;

    let detections = self.decoder.decode(&inferred.output)?;
    debug!(
      "流水线完成: {} 个目标, 预处理 {:.2?}, 检测 {:.2?}",
      detections.len(),
      prepared.execution_time,
      inferred.execution_time
    );
    Ok(PipelineOutput {
      detections,
      preprocess_time: prepared.execution_time,
      inference_time: inferred.execution_time,
    })
  }

  /// 两个阶段共用的缓冲区
  pub fn shared_buffer(&self) -> BufferId {
    self.shared
  }

  pub fn session(&self) -> &AcceleratorSession<D> {
    &self.session
  }

  pub fn session_mut(&mut self) -> &mut AcceleratorSession<D> {
    &mut self.session
  }

  pub fn preprocess_model(&self) -> Option<&ModelHandle> {
    self.preprocess.as_ref()
  }

  pub fn detect_model(&self) -> Option<&ModelHandle> {
    self.detect.as_ref()
  }

  /// 先销毁借用共享缓冲区的检测模型，再销毁持有它的预处理模型
  pub fn destroy(mut self) -> Result<(), PipelineError> {
    self.teardown().map_err(PipelineError::from)
  }

  fn teardown(&mut self) -> Result<(), SessionError> {
    let mut first = Ok(());
    for model in [self.detect.take(), self.preprocess.take()]
      .into_iter()
      .flatten()
    {
      if let Err(e) = self.session.destroy_model(model) {
        warn!("销毁模型失败: {}", e);
        if first.is_ok() {
          first = Err(e);
        }
      }
    }
    first
  }
}

impl<D: AcceleratorDriver, K: DetectionDecoder> Drop for ModelPipeline<D, K> {
  fn drop(&mut self) {
    // 失败已在 teardown 中记录
    let _ = self.teardown();
  }
}

impl<D: AcceleratorDriver + Send, K: DetectionDecoder + Send> FrameProcessor for ModelPipeline<D, K> {
  type Output = PipelineOutput;

  fn process(&mut self, data: Vec<u8>) -> Result<Self::Output, BoxError> {
    Ok(self.run(&data)?)
  }
}

impl<D: AcceleratorDriver, K: DetectionDecoder> Model for ModelPipeline<D, K> {
  type Input = [u8];
  type Output = PipelineOutput;
  type Error = PipelineError;

  fn infer(&mut self, input: &[u8]) -> Result<Self::Output, Self::Error> {
    self.run(input)
  }
}
