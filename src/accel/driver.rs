// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel/driver.rs - 加速器驱动接口
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

use std::{fs::File, os::fd::RawFd};

use crate::accel::{AcceleratorErrorCode, Access, ChipId, ParamMap, TensorDataType, TensorLayout};

/// 驱动侧程序句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// 驱动侧张量句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub u64);

/// 驱动侧任务请求句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

/// 驱动侧配置表句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDirection {
  Input,
  Output,
}

/// 驱动报告的张量元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
  pub id: TensorId,
  /// 各维度的字节跨度，`pitches[0]` 即整个张量的字节数
  pub pitches: Vec<usize>,
  pub data_type: TensorDataType,
  pub layout: TensorLayout,
}

impl TensorInfo {
  pub fn byte_size(&self) -> Option<usize> {
    self.pitches.first().copied()
  }
}

/// 驱动错误，附带加速器服务的错误码
pub trait DriverError: std::error::Error + Send + Sync + 'static {
  fn code(&self) -> AcceleratorErrorCode;
}

/// 加速器驱动
///
/// 所有方法都以 `&mut self` 调用，同一会话同一时刻只会有一个任务在执行。
/// 张量数据通过文件描述符交换：驱动从绑定的描述符的当前偏移读取输入，
/// 并向输出描述符的当前偏移写入结果。
pub trait AcceleratorDriver {
  type Error: DriverError;

  fn connect(&mut self) -> Result<(), Self::Error>;
  fn disconnect(&mut self) -> Result<(), Self::Error>;
  fn list_devices(&mut self) -> Result<Vec<String>, Self::Error>;

  /// 设备所在的芯片，未知时返回 `None`
  fn device_chip(&self, _device: &str) -> Option<ChipId> {
    None
  }

  fn create_map(&mut self, params: &ParamMap) -> Result<MapId, Self::Error>;
  fn destroy_map(&mut self, map: MapId) -> Result<(), Self::Error>;

  /// 加载程序；`program` 为 `None` 时表示仅由配置表描述的内置程序
  fn load_model(
    &mut self,
    program: Option<&File>,
    device: &str,
    access: Access,
    name: &str,
    params: Option<MapId>,
  ) -> Result<ProgramId, Self::Error>;
  fn destroy_model(&mut self, program: ProgramId) -> Result<(), Self::Error>;

  fn create_tensors(
    &mut self,
    program: ProgramId,
    direction: TensorDirection,
  ) -> Result<Vec<TensorInfo>, Self::Error>;
  fn destroy_tensors(&mut self, tensors: &[TensorId]) -> Result<(), Self::Error>;
  fn bind_tensor_fd(&mut self, tensor: TensorId, fd: RawFd) -> Result<(), Self::Error>;

  fn create_job(
    &mut self,
    program: ProgramId,
    inputs: &[TensorId],
    outputs: &[TensorId],
    params: Option<MapId>,
  ) -> Result<JobId, Self::Error>;
  fn destroy_job(&mut self, job: JobId) -> Result<(), Self::Error>;

  /// 提交任务并阻塞直到完成
  fn run_job(&mut self, job: JobId) -> Result<(), Self::Error>;
}
