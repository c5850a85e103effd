// 该文件是 Beifeng （北风） 项目的一部分。
// src/arena.rs - 共享内存张量缓冲区
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

//! # 张量缓冲区
//!
//! 每个缓冲区都由一个匿名临时文件支撑：文件创建后立即从文件系统中移除，
//! 只能通过打开的文件描述符访问，随后被截断到所需大小并以读写、共享方式映射到进程中。
//! 加速器通过文件描述符读写数据，本进程则直接通过映射地址访问同一块物理内存。
//!
//! 缓冲区统一由 [`TensorArena`] 持有，调用方只持有 [`BufferId`]。
//! 同一缓冲区可被两个模型引用（流水线别名），但任意时刻只有一个写入方，
//! 这一点由 `&mut TensorArena` 的借用规则保证，而非运行时锁。

use std::{
  fmt,
  fs::File,
  io::{self, Seek, SeekFrom},
  os::fd::{AsRawFd, RawFd},
  path::{Path, PathBuf},
};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ArenaError {
  #[error("创建临时文件失败: {0}")]
  CreateFile(#[source] io::Error),
  #[error("设置文件大小失败 ({size} 字节): {source}")]
  Truncate {
    size: usize,
    #[source]
    source: io::Error,
  },
  #[error("内存映射失败 ({size} 字节): {source}")]
  Map {
    size: usize,
    #[source]
    source: io::Error,
  },
  #[error("缓冲区大小无效: {0}")]
  InvalidSize(usize),
  #[error("缓冲区 {0} 不存在")]
  UnknownBuffer(BufferId),
  #[error("数据长度 {len} 超出缓冲区容量 {capacity}")]
  OutOfBounds { len: usize, capacity: usize },
  #[error("重置文件偏移失败: {0}")]
  Seek(#[source] io::Error),
}

/// 张量缓冲区句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
  pub fn index(&self) -> usize {
    self.0
  }
}

impl fmt::Display for BufferId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// 张量槽位的大小来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSize {
  /// 显式指定字节数
  Fixed(usize),
  /// 等待加速器报告张量 pitch 后再分配
  FromPitch,
  /// 绑定另一个模型已经映射好的缓冲区，不持有所有权
  Shared(BufferId),
}

impl SlotSize {
  /// 根据加速器报告的 pitch 求出实际需要分配的大小；共享缓冲区返回 `None`
  pub fn resolve(&self, pitch: usize) -> Option<usize> {
    match self {
      SlotSize::Fixed(size) => Some(*size),
      SlotSize::FromPitch => Some(pitch),
      SlotSize::Shared(_) => None,
    }
  }
}

/// 单个共享内存缓冲区
pub struct TensorBuffer {
  file: File,
  map: MmapMut,
}

impl TensorBuffer {
  /// 在默认临时目录中分配缓冲区
  pub fn allocate(size: usize) -> Result<Self, ArenaError> {
    Self::allocate_in(&std::env::temp_dir(), size)
  }

  /// 在指定目录中分配缓冲区，任意一步失败都不会留下半成品
  pub fn allocate_in(dir: &Path, size: usize) -> Result<Self, ArenaError> {
    if size == 0 {
      return Err(ArenaError::InvalidSize(size));
    }

    let file = tempfile::tempfile_in(dir).map_err(ArenaError::CreateFile)?;
    file
      .set_len(size as u64)
      .map_err(|source| ArenaError::Truncate { size, source })?;

    // SAFETY: 文件已脱离文件系统命名空间，只有本结构体持有其描述符与映射
    let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
      .map_err(|source| ArenaError::Map { size, source })?;

    debug!("分配共享内存缓冲区: {} 字节, fd = {}", size, file.as_raw_fd());
    Ok(Self { file, map })
  }

  pub fn capacity(&self) -> usize {
    self.map.len()
  }

  /// 文件偏移归零，供下一次任务复用
  pub fn rewind(&mut self) -> Result<(), ArenaError> {
    self
      .file
      .seek(SeekFrom::Start(0))
      .map(|_| ())
      .map_err(ArenaError::Seek)
  }

  pub fn copy_in(&mut self, data: &[u8]) -> Result<(), ArenaError> {
    self.check_len(data.len())?;
    self.map[..data.len()].copy_from_slice(data);
    Ok(())
  }

  pub fn copy_out(&self, len: usize) -> Result<Vec<u8>, ArenaError> {
    self.check_len(len)?;
    Ok(self.map[..len].to_vec())
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.map
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.map
  }

  fn check_len(&self, len: usize) -> Result<(), ArenaError> {
    if len > self.capacity() {
      return Err(ArenaError::OutOfBounds {
        len,
        capacity: self.capacity(),
      });
    }
    Ok(())
  }
}

impl AsRawFd for TensorBuffer {
  fn as_raw_fd(&self) -> RawFd {
    self.file.as_raw_fd()
  }
}

impl fmt::Debug for TensorBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TensorBuffer")
      .field("fd", &self.file.as_raw_fd())
      .field("capacity", &self.capacity())
      .finish()
  }
}

/// 张量缓冲区的持有者
///
/// 释放后的槽位不会被复用，旧句柄因此不会误指向新缓冲区。
#[derive(Debug, Default)]
pub struct TensorArena {
  dir: Option<PathBuf>,
  slots: Vec<Option<TensorBuffer>>,
}

impl TensorArena {
  pub fn new() -> Self {
    Self::default()
  }

  /// 在指定目录中创建后备文件
  pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: Some(dir.into()),
      slots: Vec::new(),
    }
  }

  pub fn allocate(&mut self, size: usize) -> Result<BufferId, ArenaError> {
    let buffer = match &self.dir {
      Some(dir) => TensorBuffer::allocate_in(dir, size)?,
      None => TensorBuffer::allocate(size)?,
    };
    self.slots.push(Some(buffer));
    Ok(BufferId(self.slots.len() - 1))
  }

  /// 解除映射并关闭文件
  pub fn release(&mut self, id: BufferId) -> Result<(), ArenaError> {
    match self.slots.get_mut(id.0).and_then(Option::take) {
      Some(buffer) => {
        debug!("释放共享内存缓冲区 {}: {} 字节", id, buffer.capacity());
        Ok(())
      }
      None => Err(ArenaError::UnknownBuffer(id)),
    }
  }

  pub fn get(&self, id: BufferId) -> Result<&TensorBuffer, ArenaError> {
    self
      .slots
      .get(id.0)
      .and_then(Option::as_ref)
      .ok_or(ArenaError::UnknownBuffer(id))
  }

  pub fn get_mut(&mut self, id: BufferId) -> Result<&mut TensorBuffer, ArenaError> {
    self
      .slots
      .get_mut(id.0)
      .and_then(Option::as_mut)
      .ok_or(ArenaError::UnknownBuffer(id))
  }

  pub fn contains(&self, id: BufferId) -> bool {
    self.get(id).is_ok()
  }

  pub fn copy_in(&mut self, id: BufferId, data: &[u8]) -> Result<(), ArenaError> {
    self.get_mut(id)?.copy_in(data)
  }

  pub fn copy_out(&self, id: BufferId, len: usize) -> Result<Vec<u8>, ArenaError> {
    self.get(id)?.copy_out(len)
  }

  pub fn rewind(&mut self, id: BufferId) -> Result<(), ArenaError> {
    self.get_mut(id)?.rewind()
  }

  pub fn raw_fd(&self, id: BufferId) -> Result<RawFd, ArenaError> {
    Ok(self.get(id)?.as_raw_fd())
  }

  pub fn capacity(&self, id: BufferId) -> Result<usize, ArenaError> {
    Ok(self.get(id)?.capacity())
  }

  /// 当前仍处于映射状态的缓冲区数量
  pub fn live_buffers(&self) -> usize {
    self.slots.iter().filter(|slot| slot.is_some()).count()
  }
}
