// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel.rs - 加速器会话定义
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

use std::fmt;

mod driver;
pub use self::driver::{
  AcceleratorDriver, DriverError, JobId, MapId, ProgramId, TensorDirection, TensorId, TensorInfo,
};

mod param;
pub use self::param::{ParamMap, ParamValue};

mod session;
pub use self::session::{
  AcceleratorSession, MemMapConfiguration, ModelHandle, ModelSource, SessionError, TensorSlot,
};

mod job;
pub use self::job::{JobError, JobResult, JobStep};

pub mod cpu;

/// 模型可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
  /// 仅创建该模型的会话可见
  #[default]
  Private,
  /// 所有会话可见
  Public,
}

/// 加速器服务返回的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AcceleratorErrorCode {
  None = 0,
  Job = -1,
  LoadModel = -2,
  Fd = -3,
  ModelNotFound = -4,
  Permission = -5,
  Connection = -6,
  CreateSession = -7,
  KillSession = -8,
  InvalidChipId = -9,
  InvalidAccess = -10,
  DeleteModel = -11,
  TensorMismatch = -12,
  VersionMismatch = -13,
  Alloc = -14,
}

impl AcceleratorErrorCode {
  pub fn from_code(code: i32) -> Option<Self> {
    use AcceleratorErrorCode::*;
    Some(match code {
      0 => None,
      -1 => Job,
      -2 => LoadModel,
      -3 => Fd,
      -4 => ModelNotFound,
      -5 => Permission,
      -6 => Connection,
      -7 => CreateSession,
      -8 => KillSession,
      -9 => InvalidChipId,
      -10 => InvalidAccess,
      -11 => DeleteModel,
      -12 => TensorMismatch,
      -13 => VersionMismatch,
      -14 => Alloc,
      _ => return Option::None,
    })
  }

  pub fn code(&self) -> i32 {
    *self as i32
  }
}

impl fmt::Display for AcceleratorErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      AcceleratorErrorCode::None => "无错误",
      AcceleratorErrorCode::Job => "任务执行失败",
      AcceleratorErrorCode::LoadModel => "模型加载失败",
      AcceleratorErrorCode::Fd => "文件描述符无效",
      AcceleratorErrorCode::ModelNotFound => "模型不存在",
      AcceleratorErrorCode::Permission => "权限不足",
      AcceleratorErrorCode::Connection => "连接失败",
      AcceleratorErrorCode::CreateSession => "创建会话失败",
      AcceleratorErrorCode::KillSession => "销毁会话失败",
      AcceleratorErrorCode::InvalidChipId => "芯片标识无效",
      AcceleratorErrorCode::InvalidAccess => "访问模式无效",
      AcceleratorErrorCode::DeleteModel => "删除模型失败",
      AcceleratorErrorCode::TensorMismatch => "张量不匹配",
      AcceleratorErrorCode::VersionMismatch => "版本不匹配",
      AcceleratorErrorCode::Alloc => "内存分配失败",
    };
    write!(f, "{} ({})", text, self.code())
  }
}

/// 加速器芯片标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChipId {
  Debug = 1,
  TfliteCpu = 2,
  Tpu = 4,
  CvFlowNn = 6,
  TfliteGlGpu = 8,
  CvFlowProc = 9,
  Ace = 10,
  LibYuv = 11,
  TfliteArtpec8Dlpu = 12,
  OpenCl = 13,
}

impl ChipId {
  pub fn from_id(id: u32) -> Option<Self> {
    use ChipId::*;
    Some(match id {
      1 => Debug,
      2 => TfliteCpu,
      4 => Tpu,
      6 => CvFlowNn,
      8 => TfliteGlGpu,
      9 => CvFlowProc,
      10 => Ace,
      11 => LibYuv,
      12 => TfliteArtpec8Dlpu,
      13 => OpenCl,
      _ => return None,
    })
  }

  pub fn id(&self) -> u32 {
    *self as u32
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ChipId::Debug => "debug",
      ChipId::TfliteCpu => "tflite-cpu",
      ChipId::Tpu => "tpu",
      ChipId::CvFlowNn => "cvflow-nn",
      ChipId::TfliteGlGpu => "tflite-glgpu",
      ChipId::CvFlowProc => "cvflow-proc",
      ChipId::Ace => "ace",
      ChipId::LibYuv => "libyuv",
      ChipId::TfliteArtpec8Dlpu => "tflite-artpec8-dlpu",
      ChipId::OpenCl => "opencl",
    }
  }
}

impl fmt::Display for ChipId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorDataType {
  #[default]
  Unspecified,
  Bool,
  Uint8,
  Int8,
  Uint16,
  Int16,
  Uint32,
  Int32,
  Uint64,
  Int64,
  Float16,
  Float32,
  Float64,
}

impl TensorDataType {
  /// 单个元素的字节数，未指定类型返回 `None`
  pub fn size(&self) -> Option<usize> {
    use TensorDataType::*;
    match self {
      Unspecified => None,
      Bool | Uint8 | Int8 => Some(1),
      Uint16 | Int16 | Float16 => Some(2),
      Uint32 | Int32 | Float32 => Some(4),
      Uint64 | Int64 | Float64 => Some(8),
    }
  }
}

/// 张量内存布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
  #[default]
  Unspecified,
  Nhwc,
  Nchw,
  Yuv420Sp,
}
