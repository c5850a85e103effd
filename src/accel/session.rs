// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel/session.rs - 加速器会话
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

use std::{collections::BTreeMap, fs::File, io, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  BoxError,
  accel::{
    AcceleratorErrorCode, Access, AcceleratorDriver, ChipId, DriverError, JobId, MapId, ParamMap,
    ProgramId, TensorDirection, TensorId, TensorInfo,
  },
  arena::{ArenaError, BufferId, SlotSize, TensorArena},
};

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("加速器驱动错误 ({step}, {code}): {source}")]
  Driver {
    step: &'static str,
    code: AcceleratorErrorCode,
    #[source]
    source: BoxError,
  },
  #[error("尚未连接加速器")]
  NotConnected,
  #[error("设备不存在: {0}")]
  DeviceNotFound(String),
  #[error("无法打开模型文件 {path:?}: {source}")]
  ModelFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("张量缓冲区错误: {0}")]
  Arena(#[from] ArenaError),
  #[error("模型 {0} 的张量已创建，需先销毁模型")]
  AlreadyRealized(String),
  #[error("模型 {0} 的张量尚未创建")]
  NotRealized(String),
  #[error("模型 {model} 的{direction:?}张量槽位 {slot} 超出范围 (共 {count} 个)")]
  SlotOutOfRange {
    model: String,
    direction: TensorDirection,
    slot: usize,
    count: usize,
  },
  #[error("模型 {model} 的张量槽位 {slot} 未报告 pitch")]
  MissingPitch { model: String, slot: usize },
  #[error("共享缓冲区容量 {capacity} 小于张量槽位 {slot} 的 pitch {pitch}")]
  SharedBufferTooSmall {
    slot: usize,
    capacity: usize,
    pitch: usize,
  },
}

impl SessionError {
  /// 对应的加速器服务错误码
  pub fn code(&self) -> AcceleratorErrorCode {
    match self {
      SessionError::Driver { code, .. } => *code,
      SessionError::NotConnected => AcceleratorErrorCode::Connection,
      SessionError::DeviceNotFound(_) => AcceleratorErrorCode::InvalidChipId,
      SessionError::ModelFile { .. } => AcceleratorErrorCode::LoadModel,
      SessionError::Arena(_) => AcceleratorErrorCode::Alloc,
      SessionError::AlreadyRealized(_) | SessionError::NotRealized(_) => AcceleratorErrorCode::Job,
      SessionError::SlotOutOfRange { .. }
      | SessionError::MissingPitch { .. }
      | SessionError::SharedBufferTooSmall { .. } => AcceleratorErrorCode::TensorMismatch,
    }
  }
}

fn driver_error<E: DriverError>(step: &'static str) -> impl FnOnce(E) -> SessionError {
  move |err| SessionError::Driver {
    step,
    code: err.code(),
    source: Box::new(err),
  }
}

/// 程序来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
  /// 仅由配置表描述的内置程序，例如图像预处理
  Builtin,
  /// 模型文件
  Path(PathBuf),
}

/// 各张量槽位的缓冲区分配方式，未列出的槽位不绑定缓冲区
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemMapConfiguration {
  inputs: BTreeMap<usize, SlotSize>,
  outputs: BTreeMap<usize, SlotSize>,
}

impl MemMapConfiguration {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn input(mut self, slot: usize, size: SlotSize) -> Self {
    self.inputs.insert(slot, size);
    self
  }

  pub fn output(mut self, slot: usize, size: SlotSize) -> Self {
    self.outputs.insert(slot, size);
    self
  }

  fn slots(&self, direction: TensorDirection) -> &BTreeMap<usize, SlotSize> {
    match direction {
      TensorDirection::Input => &self.inputs,
      TensorDirection::Output => &self.outputs,
    }
  }
}

/// 已创建的张量槽位
#[derive(Debug, Clone)]
pub struct TensorSlot {
  info: TensorInfo,
  buffer: Option<BufferId>,
  owned: bool,
}

impl TensorSlot {
  pub fn info(&self) -> &TensorInfo {
    &self.info
  }

  pub fn buffer(&self) -> Option<BufferId> {
    self.buffer
  }

  /// 缓冲区是否由本模型创建
  pub fn is_owned(&self) -> bool {
    self.owned
  }
}

/// 已加载的模型及其张量与任务请求
#[derive(Debug)]
pub struct ModelHandle {
  pub(super) name: String,
  pub(super) device: String,
  pub(super) access: Access,
  pub(super) program: ProgramId,
  pub(super) maps: Vec<MapId>,
  /// 当前任务请求的配置表，随任务请求一同替换
  pub(super) job_map: Option<MapId>,
  pub(super) inputs: Vec<TensorSlot>,
  pub(super) outputs: Vec<TensorSlot>,
  pub(super) realized: bool,
  pub(super) job: Option<JobId>,
}

impl ModelHandle {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn device(&self) -> &str {
    &self.device
  }

  pub fn access(&self) -> Access {
    self.access
  }

  pub fn is_realized(&self) -> bool {
    self.realized
  }

  pub fn has_job_request(&self) -> bool {
    self.job.is_some()
  }

  pub fn inputs(&self) -> &[TensorSlot] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[TensorSlot] {
    &self.outputs
  }

  pub fn input_buffer(&self, slot: usize) -> Option<BufferId> {
    self.inputs.get(slot).and_then(TensorSlot::buffer)
  }

  pub fn output_buffer(&self, slot: usize) -> Option<BufferId> {
    self.outputs.get(slot).and_then(TensorSlot::buffer)
  }

  pub fn input_pitch(&self, slot: usize) -> Option<usize> {
    self.inputs.get(slot).and_then(|s| s.info.byte_size())
  }

  pub fn output_pitch(&self, slot: usize) -> Option<usize> {
    self.outputs.get(slot).and_then(|s| s.info.byte_size())
  }
}

/// 加速器会话，持有驱动连接与全部张量缓冲区
pub struct AcceleratorSession<D: AcceleratorDriver> {
  pub(super) driver: D,
  pub(super) arena: TensorArena,
  devices: Vec<String>,
  connected: bool,
}

impl<D: AcceleratorDriver> AcceleratorSession<D> {
  pub fn new(driver: D) -> Self {
    Self::with_arena(driver, TensorArena::new())
  }

  pub fn with_arena(driver: D, arena: TensorArena) -> Self {
    Self {
      driver,
      arena,
      devices: Vec::new(),
      connected: false,
    }
  }

  pub fn connect(&mut self) -> Result<(), SessionError> {
    if self.connected {
      return Ok(());
    }
    self.driver.connect().map_err(driver_error("connect"))?;
    self.connected = true;
    let devices = self.list_devices()?;
    info!("已连接加速器, 可用设备: {:?}", devices);
    Ok(())
  }

  pub fn disconnect(&mut self) -> Result<(), SessionError> {
    if !self.connected {
      return Ok(());
    }
    self.connected = false;
    self.devices.clear();
    self.driver.disconnect().map_err(driver_error("disconnect"))?;
    info!("已断开加速器连接");
    Ok(())
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  /// 重新向驱动查询设备列表
  pub fn list_devices(&mut self) -> Result<Vec<String>, SessionError> {
    self.ensure_connected()?;
    self.devices = self
      .driver
      .list_devices()
      .map_err(driver_error("list devices"))?;
    Ok(self.devices.clone())
  }

  pub fn devices(&self) -> &[String] {
    &self.devices
  }

  /// 设备所在的芯片
  pub fn device_chip(&self, device: &str) -> Option<ChipId> {
    self.driver.device_chip(device)
  }

  pub fn arena(&self) -> &TensorArena {
    &self.arena
  }

  pub fn arena_mut(&mut self) -> &mut TensorArena {
    &mut self.arena
  }

  pub fn driver(&self) -> &D {
    &self.driver
  }

  pub fn driver_mut(&mut self) -> &mut D {
    &mut self.driver
  }

  pub fn load_model(
    &mut self,
    source: &ModelSource,
    device: &str,
    access: Access,
    name: &str,
    params: Option<&ParamMap>,
  ) -> Result<ModelHandle, SessionError> {
    self.ensure_connected()?;
    if !self.devices.iter().any(|d| d == device) {
      return Err(SessionError::DeviceNotFound(device.to_string()));
    }

    let file = match source {
      ModelSource::Builtin => None,
      ModelSource::Path(path) => Some(File::open(path).map_err(|source| {
        SessionError::ModelFile {
          path: path.clone(),
          source,
        }
      })?),
    };

    let map = match params {
      Some(params) => Some(
        self
          .driver
          .create_map(params)
          .map_err(driver_error("create model map"))?,
      ),
      None => None,
    };

    let loaded = self
      .driver
      .load_model(file.as_ref(), device, access, name, map)
      .map_err(driver_error("load model"));
    let program = match loaded {
      Ok(program) => program,
      Err(err) => {
        if let Some(map) = map
          && let Err(e) = self.driver.destroy_map(map)
        {
          warn!("释放模型配置表失败: {}", e);
        }
        return Err(err);
      }
    };

    info!("模型 {} 已加载到设备 {} ({:?})", name, device, access);
    Ok(ModelHandle {
      name: name.to_string(),
      device: device.to_string(),
      access,
      program,
      maps: map.into_iter().collect(),
      job_map: None,
      inputs: Vec::new(),
      outputs: Vec::new(),
      realized: false,
      job: None,
    })
  }

  /// 创建模型的输入输出张量，并按配置为每个槽位分配或绑定缓冲区
  pub fn realize_tensors(
    &mut self,
    model: &mut ModelHandle,
    config: &MemMapConfiguration,
  ) -> Result<(), SessionError> {
    if model.realized {
      return Err(SessionError::AlreadyRealized(model.name.clone()));
    }

    let input_infos = self
      .driver
      .create_tensors(model.program, TensorDirection::Input)
      .map_err(driver_error("create input tensors"))?;
    let output_infos = match self
      .driver
      .create_tensors(model.program, TensorDirection::Output)
      .map_err(driver_error("create output tensors"))
    {
      Ok(infos) => infos,
      Err(err) => {
        self.discard_tensors(&input_infos);
        return Err(err);
      }
    };

    let inputs = match self.bind_slots(&model.name, TensorDirection::Input, &input_infos, config) {
      Ok(slots) => slots,
      Err(err) => {
        self.discard_tensors(&input_infos);
        self.discard_tensors(&output_infos);
        return Err(err);
      }
    };
    let outputs = match self.bind_slots(&model.name, TensorDirection::Output, &output_infos, config)
    {
      Ok(slots) => slots,
      Err(err) => {
        self.release_owned(&inputs);
        self.discard_tensors(&input_infos);
        self.discard_tensors(&output_infos);
        return Err(err);
      }
    };

    debug!(
      "模型 {} 张量已创建: 输入 {:?}, 输出 {:?}",
      model.name,
      inputs.iter().map(|s| s.info.byte_size()).collect::<Vec<_>>(),
      outputs.iter().map(|s| s.info.byte_size()).collect::<Vec<_>>()
    );
    model.inputs = inputs;
    model.outputs = outputs;
    model.realized = true;
    Ok(())
  }

  /// 为模型创建任务请求；已有的请求会被销毁并替换
  pub fn create_job_request(
    &mut self,
    model: &mut ModelHandle,
    params: Option<&ParamMap>,
  ) -> Result<(), SessionError> {
    if !model.realized {
      return Err(SessionError::NotRealized(model.name.clone()));
    }

    if let Some(old) = model.job.take() {
      self
        .driver
        .destroy_job(old)
        .map_err(driver_error("destroy job request"))?;
    }
    if let Some(old) = model.job_map.take() {
      self
        .driver
        .destroy_map(old)
        .map_err(driver_error("destroy map"))?;
    }

    let map = match params {
      Some(params) => {
        let map = self
          .driver
          .create_map(params)
          .map_err(driver_error("create job map"))?;
        model.job_map = Some(map);
        Some(map)
      }
      None => None,
    };

    let inputs: Vec<TensorId> = model.inputs.iter().map(|s| s.info.id).collect();
    let outputs: Vec<TensorId> = model.outputs.iter().map(|s| s.info.id).collect();
    let job = self
      .driver
      .create_job(model.program, &inputs, &outputs, map)
      .map_err(driver_error("create job request"))?;
    model.job = Some(job);
    debug!("模型 {} 任务请求已创建", model.name);
    Ok(())
  }

  /// 销毁模型：配置表、任务请求、张量句柄、自有缓冲区，最后是程序本身。
  /// 借用自其他模型的缓冲区不会被释放。某一步失败时其余步骤仍会执行，返回第一个错误。
  pub fn destroy_model(&mut self, mut model: ModelHandle) -> Result<(), SessionError> {
    let mut first = None;

    for map in model.maps.drain(..).chain(model.job_map.take()) {
      keep_first(
        &mut first,
        self
          .driver
          .destroy_map(map)
          .map_err(driver_error("destroy map")),
      );
    }

    if let Some(job) = model.job.take() {
      keep_first(
        &mut first,
        self
          .driver
          .destroy_job(job)
          .map_err(driver_error("destroy job request")),
      );
    }

    for (step, slots) in [
      ("destroy input tensors", &model.inputs),
      ("destroy output tensors", &model.outputs),
    ] {
      if slots.is_empty() {
        continue;
      }
      let ids: Vec<TensorId> = slots.iter().map(|s| s.info.id).collect();
      keep_first(
        &mut first,
        self.driver.destroy_tensors(&ids).map_err(driver_error(step)),
      );
    }

    for slot in model.inputs.iter().chain(model.outputs.iter()) {
      if let (Some(id), true) = (slot.buffer, slot.owned) {
        keep_first(&mut first, self.arena.release(id).map_err(SessionError::from));
      }
    }

    keep_first(
      &mut first,
      self
        .driver
        .destroy_model(model.program)
        .map_err(driver_error("destroy model")),
    );

    info!("模型 {} 已销毁", model.name);
    match first {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  /// 所有输入缓冲区的文件偏移归零
  pub fn rewind_inputs(&mut self, model: &ModelHandle) -> Result<(), SessionError> {
    for id in model.inputs.iter().filter_map(TensorSlot::buffer) {
      self.arena.rewind(id)?;
    }
    Ok(())
  }

  /// 所有输出缓冲区的文件偏移归零
  pub fn rewind_outputs(&mut self, model: &ModelHandle) -> Result<(), SessionError> {
    for id in model.outputs.iter().filter_map(TensorSlot::buffer) {
      self.arena.rewind(id)?;
    }
    Ok(())
  }

  fn ensure_connected(&self) -> Result<(), SessionError> {
    if self.connected {
      Ok(())
    } else {
      Err(SessionError::NotConnected)
    }
  }

  fn bind_slots(
    &mut self,
    model: &str,
    direction: TensorDirection,
    infos: &[TensorInfo],
    config: &MemMapConfiguration,
  ) -> Result<Vec<TensorSlot>, SessionError> {
    let wanted = config.slots(direction);
    if let Some((&slot, _)) = wanted.range(infos.len()..).next() {
      return Err(SessionError::SlotOutOfRange {
        model: model.to_string(),
        direction,
        slot,
        count: infos.len(),
      });
    }

    let mut slots = Vec::with_capacity(infos.len());
    for (index, info) in infos.iter().enumerate() {
      let bound = match wanted.get(&index) {
        Some(size) => self.bind_slot(model, index, info, *size),
        None => Ok(TensorSlot {
          info: info.clone(),
          buffer: None,
          owned: false,
        }),
      };
      match bound {
        Ok(slot) => slots.push(slot),
        Err(err) => {
          self.release_owned(&slots);
          return Err(err);
        }
      }
    }
    Ok(slots)
  }

  fn bind_slot(
    &mut self,
    model: &str,
    index: usize,
    info: &TensorInfo,
    size: SlotSize,
  ) -> Result<TensorSlot, SessionError> {
    let (id, owned) = match size {
      SlotSize::Shared(id) => {
        let capacity = self.arena.capacity(id)?;
        if let Some(pitch) = info.byte_size()
          && capacity < pitch
        {
          return Err(SessionError::SharedBufferTooSmall {
            slot: index,
            capacity,
            pitch,
          });
        }
        (id, false)
      }
      other => {
        let pitch = info.byte_size();
        let bytes = match (other, pitch) {
          (SlotSize::FromPitch, None) => {
            return Err(SessionError::MissingPitch {
              model: model.to_string(),
              slot: index,
            });
          }
          (other, pitch) => other.resolve(pitch.unwrap_or_default()).unwrap_or_default(),
        };
        (self.arena.allocate(bytes)?, true)
      }
    };

    let fd = self.arena.raw_fd(id)?;
    if let Err(err) = self
      .driver
      .bind_tensor_fd(info.id, fd)
      .map_err(driver_error("bind tensor fd"))
    {
      if owned && let Err(e) = self.arena.release(id) {
        warn!("释放缓冲区 {} 失败: {}", id, e);
      }
      return Err(err);
    }

    Ok(TensorSlot {
      info: info.clone(),
      buffer: Some(id),
      owned,
    })
  }

  fn release_owned(&mut self, slots: &[TensorSlot]) {
    for slot in slots {
      if let (Some(id), true) = (slot.buffer, slot.owned)
        && let Err(e) = self.arena.release(id)
      {
        warn!("释放缓冲区 {} 失败: {}", id, e);
      }
    }
  }

  fn discard_tensors(&mut self, infos: &[TensorInfo]) {
    if infos.is_empty() {
      return;
    }
    let ids: Vec<TensorId> = infos.iter().map(|i| i.id).collect();
    if let Err(e) = self.driver.destroy_tensors(&ids) {
      warn!("销毁张量失败: {}", e);
    }
  }
}

fn keep_first(first: &mut Option<SessionError>, result: Result<(), SessionError>) {
  if let Err(err) = result {
    warn!("模型销毁步骤失败: {}", err);
    first.get_or_insert(err);
  }
}

impl<D: AcceleratorDriver> Drop for AcceleratorSession<D> {
  fn drop(&mut self) {
    if let Err(e) = self.disconnect() {
      warn!("断开加速器连接失败: {}", e);
    }
  }
}
