// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel/cpu.rs - CPU 图像预处理驱动
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

//! # CPU 预处理驱动
//!
//! 在进程内实现的 `cpu-proc` 设备，只支持由配置表描述的图像预处理程序：
//!
//! | 配置项                | 类型      | 取值                               |
//! |-----------------------|-----------|------------------------------------|
//! | `image.input.format`  | 字符串    | `nv12` / `rgb-interleaved`         |
//! | `image.input.size`    | 二元整数  | `[宽, 高]`                         |
//! | `image.output.format` | 字符串    | `rgb-interleaved` / `rgb-planar`   |
//! | `image.output.size`   | 二元整数  | `[宽, 高]`                         |
//! | `image.input.crop`    | 四元整数  | `[x, y, 宽, 高]`，可选             |
//!
//! 裁剪框既可以在加载程序时给出，也可以在创建任务请求时给出，后者优先。
//! 任务执行时从输入描述符的当前偏移读取整帧，裁剪后按最近邻缩放并转换为 RGB，
//! 再写入输出描述符的当前偏移，因此每次执行前都需要重置缓冲区偏移。

use std::{
  collections::HashMap,
  fs::File,
  io::{self, Read, Write},
  os::fd::{BorrowedFd, OwnedFd, RawFd},
};

use thiserror::Error;
use tracing::debug;

use crate::accel::{
  AcceleratorDriver, AcceleratorErrorCode, Access, ChipId, DriverError, JobId, MapId, ParamMap,
  ProgramId, TensorDataType, TensorDirection, TensorId, TensorInfo, TensorLayout,
};

pub const CPU_PROC_DEVICE: &str = "cpu-proc";

pub const KEY_INPUT_FORMAT: &str = "image.input.format";
pub const KEY_INPUT_SIZE: &str = "image.input.size";
pub const KEY_INPUT_CROP: &str = "image.input.crop";
pub const KEY_OUTPUT_FORMAT: &str = "image.output.format";
pub const KEY_OUTPUT_SIZE: &str = "image.output.size";

#[derive(Error, Debug)]
pub enum CpuDriverError {
  #[error("尚未连接")]
  NotConnected,
  #[error("设备 {0} 不受支持")]
  UnsupportedDevice(String),
  #[error("cpu-proc 不支持加载模型文件")]
  ProgramFileUnsupported,
  #[error("缺少配置项 {0}")]
  MissingParam(&'static str),
  #[error("配置项 {key} 取值无效: {value}")]
  InvalidParam { key: &'static str, value: String },
  #[error("句柄 {0} 不存在")]
  UnknownHandle(u64),
  #[error("张量 {0} 未绑定文件描述符")]
  Unbound(u64),
  #[error("任务张量数量不符: 输入 {inputs}, 输出 {outputs}")]
  TensorCount { inputs: usize, outputs: usize },
  #[error("I/O 错误: {0}")]
  Io(#[from] io::Error),
}

impl DriverError for CpuDriverError {
  fn code(&self) -> AcceleratorErrorCode {
    match self {
      CpuDriverError::NotConnected => AcceleratorErrorCode::Connection,
      CpuDriverError::UnsupportedDevice(_) => AcceleratorErrorCode::InvalidChipId,
      CpuDriverError::ProgramFileUnsupported
      | CpuDriverError::MissingParam(_)
      | CpuDriverError::InvalidParam { .. } => AcceleratorErrorCode::LoadModel,
      CpuDriverError::UnknownHandle(_) => AcceleratorErrorCode::ModelNotFound,
      CpuDriverError::Unbound(_) => AcceleratorErrorCode::Fd,
      CpuDriverError::TensorCount { .. } => AcceleratorErrorCode::TensorMismatch,
      CpuDriverError::Io(_) => AcceleratorErrorCode::Job,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
  Nv12,
  RgbInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
  RgbInterleaved,
  RgbPlanar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crop {
  x: usize,
  y: usize,
  width: usize,
  height: usize,
}

#[derive(Debug, Clone)]
struct PreprocessProgram {
  input_format: InputFormat,
  input: (usize, usize),
  output_format: OutputFormat,
  output: (usize, usize),
  crop: Option<Crop>,
}

fn size_param(params: &ParamMap, key: &'static str) -> Result<(usize, usize), CpuDriverError> {
  let [w, h] = params
    .get_int_arr2(key)
    .ok_or(CpuDriverError::MissingParam(key))?;
  if w <= 0 || h <= 0 {
    return Err(CpuDriverError::InvalidParam {
      key,
      value: format!("{:?}", [w, h]),
    });
  }
  Ok((w as usize, h as usize))
}

fn crop_param(params: &ParamMap, input: (usize, usize)) -> Result<Option<Crop>, CpuDriverError> {
  let Some([x, y, w, h]) = params.get_int_arr4(KEY_INPUT_CROP) else {
    return Ok(None);
  };
  let invalid = || CpuDriverError::InvalidParam {
    key: KEY_INPUT_CROP,
    value: format!("{:?}", [x, y, w, h]),
  };
  if x < 0 || y < 0 || w <= 0 || h <= 0 {
    return Err(invalid());
  }
  let crop = Crop {
    x: x as usize,
    y: y as usize,
    width: w as usize,
    height: h as usize,
  };
  if crop.x + crop.width > input.0 || crop.y + crop.height > input.1 {
    return Err(invalid());
  }
  Ok(Some(crop))
}

impl PreprocessProgram {
  fn from_params(params: &ParamMap) -> Result<Self, CpuDriverError> {
    let input_format = match params.get_str(KEY_INPUT_FORMAT) {
      Some("nv12") => InputFormat::Nv12,
      Some("rgb-interleaved") => InputFormat::RgbInterleaved,
      Some(other) => {
        return Err(CpuDriverError::InvalidParam {
          key: KEY_INPUT_FORMAT,
          value: other.to_string(),
        });
      }
      None => return Err(CpuDriverError::MissingParam(KEY_INPUT_FORMAT)),
    };
    let output_format = match params.get_str(KEY_OUTPUT_FORMAT) {
      Some("rgb-interleaved") => OutputFormat::RgbInterleaved,
      Some("rgb-planar") => OutputFormat::RgbPlanar,
      Some(other) => {
        return Err(CpuDriverError::InvalidParam {
          key: KEY_OUTPUT_FORMAT,
          value: other.to_string(),
        });
      }
      None => return Err(CpuDriverError::MissingParam(KEY_OUTPUT_FORMAT)),
    };

    let input = size_param(params, KEY_INPUT_SIZE)?;
    if input_format == InputFormat::Nv12 && (input.0 % 2 != 0 || input.1 % 2 != 0) {
      return Err(CpuDriverError::InvalidParam {
        key: KEY_INPUT_SIZE,
        value: format!("{:?}", input),
      });
    }
    let output = size_param(params, KEY_OUTPUT_SIZE)?;
    let crop = crop_param(params, input)?;

    Ok(Self {
      input_format,
      input,
      output_format,
      output,
      crop,
    })
  }

  fn input_size(&self) -> usize {
    let (w, h) = self.input;
    match self.input_format {
      InputFormat::Nv12 => w * h * 3 / 2,
      InputFormat::RgbInterleaved => w * h * 3,
    }
  }

  fn output_size(&self) -> usize {
    self.output.0 * self.output.1 * 3
  }

  fn sample(&self, input: &[u8], x: usize, y: usize) -> [u8; 3] {
    let (w, h) = self.input;
    match self.input_format {
      InputFormat::RgbInterleaved => {
        let i = (y * w + x) * 3;
        [input[i], input[i + 1], input[i + 2]]
      }
      InputFormat::Nv12 => {
        let luma = input[y * w + x];
        let uv = w * h + (y / 2) * w + (x / 2) * 2;
        yuv_to_rgb(luma, input[uv], input[uv + 1])
      }
    }
  }

  /// 裁剪、最近邻缩放并转换颜色
  fn convert(&self, input: &[u8], crop: Option<Crop>, output: &mut [u8]) {
    let crop = crop.or(self.crop).unwrap_or(Crop {
      x: 0,
      y: 0,
      width: self.input.0,
      height: self.input.1,
    });
    let (ow, oh) = self.output;
    let plane = ow * oh;

    for oy in 0..oh {
      let sy = crop.y + oy * crop.height / oh;
      for ox in 0..ow {
        let sx = crop.x + ox * crop.width / ow;
        let rgb = self.sample(input, sx, sy);
        let pixel = oy * ow + ox;
        match self.output_format {
          OutputFormat::RgbInterleaved => output[pixel * 3..pixel * 3 + 3].copy_from_slice(&rgb),
          OutputFormat::RgbPlanar => {
            for (c, value) in rgb.into_iter().enumerate() {
              output[c * plane + pixel] = value;
            }
          }
        }
      }
    }
  }
}

/// BT.601 全范围 YUV 转 RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let y = y as f32;
  let u = u as f32 - 128.0;
  let v = v as f32 - 128.0;
  let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
  [
    clamp(y + 1.402 * v),
    clamp(y - 0.344_136 * u - 0.714_136 * v),
    clamp(y + 1.772 * u),
  ]
}

#[derive(Debug)]
struct CpuTensor {
  info: TensorInfo,
  fd: Option<OwnedFd>,
}

#[derive(Debug)]
struct CpuJob {
  program: ProgramId,
  inputs: Vec<TensorId>,
  outputs: Vec<TensorId>,
  crop: Option<Crop>,
}

/// 进程内的 `cpu-proc` 设备
#[derive(Debug, Default)]
pub struct CpuDriver {
  connected: bool,
  next_id: u64,
  maps: HashMap<u64, ParamMap>,
  programs: HashMap<u64, PreprocessProgram>,
  tensors: HashMap<u64, CpuTensor>,
  jobs: HashMap<u64, CpuJob>,
}

impl CpuDriver {
  pub fn new() -> Self {
    Self::default()
  }

  fn next_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  fn ensure_connected(&self) -> Result<(), CpuDriverError> {
    if self.connected {
      Ok(())
    } else {
      Err(CpuDriverError::NotConnected)
    }
  }

  /// 复制绑定的描述符，复制后的描述符与缓冲区共享文件偏移
  fn tensor_file(&self, tensor: TensorId) -> Result<File, CpuDriverError> {
    let entry = self
      .tensors
      .get(&tensor.0)
      .ok_or(CpuDriverError::UnknownHandle(tensor.0))?;
    let fd = entry.fd.as_ref().ok_or(CpuDriverError::Unbound(tensor.0))?;
    Ok(File::from(fd.try_clone()?))
  }
}

impl AcceleratorDriver for CpuDriver {
  type Error = CpuDriverError;

  fn connect(&mut self) -> Result<(), Self::Error> {
    self.connected = true;
    Ok(())
  }

  fn disconnect(&mut self) -> Result<(), Self::Error> {
    self.connected = false;
    self.jobs.clear();
    self.tensors.clear();
    self.programs.clear();
    self.maps.clear();
    Ok(())
  }

  fn list_devices(&mut self) -> Result<Vec<String>, Self::Error> {
    self.ensure_connected()?;
    Ok(vec![CPU_PROC_DEVICE.to_string()])
  }

  fn device_chip(&self, device: &str) -> Option<ChipId> {
    (device == CPU_PROC_DEVICE).then_some(ChipId::LibYuv)
  }

  fn create_map(&mut self, params: &ParamMap) -> Result<MapId, Self::Error> {
    let id = self.next_id();
    self.maps.insert(id, params.clone());
    Ok(MapId(id))
  }

  fn destroy_map(&mut self, map: MapId) -> Result<(), Self::Error> {
    self
      .maps
      .remove(&map.0)
      .map(|_| ())
      .ok_or(CpuDriverError::UnknownHandle(map.0))
  }

  fn load_model(
    &mut self,
    program: Option<&File>,
    device: &str,
    _access: Access,
    name: &str,
    params: Option<MapId>,
  ) -> Result<ProgramId, Self::Error> {
    self.ensure_connected()?;
    if device != CPU_PROC_DEVICE {
      return Err(CpuDriverError::UnsupportedDevice(device.to_string()));
    }
    if program.is_some() {
      return Err(CpuDriverError::ProgramFileUnsupported);
    }
    let params = match params {
      Some(map) => self
        .maps
        .get(&map.0)
        .ok_or(CpuDriverError::UnknownHandle(map.0))?,
      None => return Err(CpuDriverError::MissingParam(KEY_INPUT_FORMAT)),
    };
    let program = PreprocessProgram::from_params(params)?;
    debug!(
      "cpu-proc 程序 {}: {:?} {:?} -> {:?} {:?}",
      name, program.input_format, program.input, program.output_format, program.output
    );

    let id = self.next_id();
    self.programs.insert(id, program);
    Ok(ProgramId(id))
  }

  fn destroy_model(&mut self, program: ProgramId) -> Result<(), Self::Error> {
    self
      .programs
      .remove(&program.0)
      .map(|_| ())
      .ok_or(CpuDriverError::UnknownHandle(program.0))
  }

  fn create_tensors(
    &mut self,
    program: ProgramId,
    direction: TensorDirection,
  ) -> Result<Vec<TensorInfo>, Self::Error> {
    let entry = self
      .programs
      .get(&program.0)
      .ok_or(CpuDriverError::UnknownHandle(program.0))?;
    let (pitch, layout) = match direction {
      TensorDirection::Input => (
        entry.input_size(),
        match entry.input_format {
          InputFormat::Nv12 => TensorLayout::Yuv420Sp,
          InputFormat::RgbInterleaved => TensorLayout::Nhwc,
        },
      ),
      TensorDirection::Output => (
        entry.output_size(),
        match entry.output_format {
          OutputFormat::RgbInterleaved => TensorLayout::Nhwc,
          OutputFormat::RgbPlanar => TensorLayout::Nchw,
        },
      ),
    };

    let info = TensorInfo {
      id: TensorId(self.next_id()),
      pitches: vec![pitch],
      data_type: TensorDataType::Uint8,
      layout,
    };
    self.tensors.insert(
      info.id.0,
      CpuTensor {
        info: info.clone(),
        fd: None,
      },
    );
    Ok(vec![info])
  }

  fn destroy_tensors(&mut self, tensors: &[TensorId]) -> Result<(), Self::Error> {
    for tensor in tensors {
      self
        .tensors
        .remove(&tensor.0)
        .ok_or(CpuDriverError::UnknownHandle(tensor.0))?;
    }
    Ok(())
  }

  fn bind_tensor_fd(&mut self, tensor: TensorId, fd: RawFd) -> Result<(), Self::Error> {
    let entry = self
      .tensors
      .get_mut(&tensor.0)
      .ok_or(CpuDriverError::UnknownHandle(tensor.0))?;
    // SAFETY: 会话保证描述符在张量销毁前一直有效，这里立即复制一份自行持有
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    entry.fd = Some(borrowed.try_clone_to_owned()?);
    debug!(
      "cpu-proc 张量 {} 绑定 fd {} ({:?} 字节)",
      tensor.0,
      fd,
      entry.info.byte_size()
    );
    Ok(())
  }

  fn create_job(
    &mut self,
    program: ProgramId,
    inputs: &[TensorId],
    outputs: &[TensorId],
    params: Option<MapId>,
  ) -> Result<JobId, Self::Error> {
    let entry = self
      .programs
      .get(&program.0)
      .ok_or(CpuDriverError::UnknownHandle(program.0))?;
    if inputs.len() != 1 || outputs.len() != 1 {
      return Err(CpuDriverError::TensorCount {
        inputs: inputs.len(),
        outputs: outputs.len(),
      });
    }
    let crop = match params {
      Some(map) => {
        let params = self
          .maps
          .get(&map.0)
          .ok_or(CpuDriverError::UnknownHandle(map.0))?;
        crop_param(params, entry.input)?
      }
      None => None,
    };

    let id = self.next_id();
    self.jobs.insert(
      id,
      CpuJob {
        program,
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        crop,
      },
    );
    Ok(JobId(id))
  }

  fn destroy_job(&mut self, job: JobId) -> Result<(), Self::Error> {
    self
      .jobs
      .remove(&job.0)
      .map(|_| ())
      .ok_or(CpuDriverError::UnknownHandle(job.0))
  }

  fn run_job(&mut self, job: JobId) -> Result<(), Self::Error> {
    self.ensure_connected()?;
    let entry = self
      .jobs
      .get(&job.0)
      .ok_or(CpuDriverError::UnknownHandle(job.0))?;
    let program = self
      .programs
      .get(&entry.program.0)
      .ok_or(CpuDriverError::UnknownHandle(entry.program.0))?;

    let mut input = vec![0u8; program.input_size()];
    self.tensor_file(entry.inputs[0])?.read_exact(&mut input)?;

    let mut output = vec![0u8; program.output_size()];
    program.convert(&input, entry.crop, &mut output);

    self.tensor_file(entry.outputs[0])?.write_all(&output)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn program(input_format: InputFormat, input: (usize, usize), output: (usize, usize)) -> PreprocessProgram {
    PreprocessProgram {
      input_format,
      input,
      output_format: OutputFormat::RgbInterleaved,
      output,
      crop: None,
    }
  }

  #[test]
  fn test_yuv_gray() {
    for y in [0u8, 16, 128, 235, 255] {
      assert_eq!(yuv_to_rgb(y, 128, 128), [y, y, y]);
    }
  }

  #[test]
  fn test_nv12_to_rgb_downscale() {
    // 4x2 NV12，左半亮度 200，右半亮度 50，色度为中性
    let mut frame = vec![200, 200, 50, 50, 200, 200, 50, 50];
    frame.extend_from_slice(&[128, 128, 128, 128]);
    let program = program(InputFormat::Nv12, (4, 2), (2, 1));
    assert_eq!(program.input_size(), 12);

    let mut out = vec![0u8; program.output_size()];
    program.convert(&frame, None, &mut out);
    assert_eq!(out, vec![200, 200, 200, 50, 50, 50]);
  }

  #[test]
  fn test_crop_and_planar() {
    // 3x1 RGB 图像，裁剪中间像素
    let frame = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
    let mut program = program(InputFormat::RgbInterleaved, (3, 1), (1, 1));
    let crop = Crop {
      x: 1,
      y: 0,
      width: 1,
      height: 1,
    };

    let mut out = vec![0u8; 3];
    program.convert(&frame, Some(crop), &mut out);
    assert_eq!(out, vec![4, 5, 6]);

    program.output_format = OutputFormat::RgbPlanar;
    program.output = (3, 1);
    let mut planar = vec![0u8; 9];
    program.convert(&frame, None, &mut planar);
    assert_eq!(planar, vec![1, 4, 7, 2, 5, 8, 3, 6, 9]);
  }

  #[test]
  fn test_params_validation() {
    let params = ParamMap::new()
      .with(KEY_INPUT_FORMAT, "nv12")
      .with(KEY_INPUT_SIZE, [640i64, 480])
      .with(KEY_OUTPUT_FORMAT, "rgb-planar")
      .with(KEY_OUTPUT_SIZE, [320i64, 320]);
    let program = PreprocessProgram::from_params(&params).unwrap();
    assert_eq!(program.input_size(), 640 * 480 * 3 / 2);
    assert_eq!(program.output_size(), 320 * 320 * 3);

    let odd = params.clone().with(KEY_INPUT_SIZE, [641i64, 480]);
    assert!(matches!(
      PreprocessProgram::from_params(&odd),
      Err(CpuDriverError::InvalidParam { key: KEY_INPUT_SIZE, .. })
    ));

    let crop = params.clone().with(KEY_INPUT_CROP, [0i64, 0, 641, 480]);
    assert!(PreprocessProgram::from_params(&crop).is_err());

    let format = params.with(KEY_OUTPUT_FORMAT, "bgr");
    assert!(matches!(
      PreprocessProgram::from_params(&format),
      Err(CpuDriverError::InvalidParam { .. })
    ));
  }

  #[test]
  fn test_error_codes_and_chip() {
    let driver = CpuDriver::new();
    assert_eq!(driver.device_chip(CPU_PROC_DEVICE), Some(ChipId::LibYuv));
    assert_eq!(driver.device_chip("dlpu"), None);

    assert_eq!(CpuDriverError::NotConnected.code(), AcceleratorErrorCode::Connection);
    assert_eq!(
      CpuDriverError::MissingParam(KEY_INPUT_SIZE).code(),
      AcceleratorErrorCode::LoadModel
    );
    assert_eq!(CpuDriverError::Unbound(3).code(), AcceleratorErrorCode::Fd);
  }
}
