// 该文件是 Beifeng （北风） 项目的一部分。
// tests/common/mod.rs - 测试用驱动
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

#![allow(dead_code)]

use std::{
  collections::{HashMap, HashSet, VecDeque},
  fs::File,
  io::{Read, Write},
  os::fd::{BorrowedFd, OwnedFd, RawFd},
  sync::{Arc, Mutex, MutexGuard},
  thread,
  time::Duration,
};

use chrono::Utc;
use thiserror::Error;

use beifeng::{
  accel::{
    AcceleratorDriver, AcceleratorErrorCode, Access, DriverError, JobId, MapId, ParamMap,
    ProgramId, TensorDataType, TensorDirection, TensorId, TensorInfo, TensorLayout,
  },
  frame::{FrameType, RawFrame},
  stream::{CaptureDriver, CaptureError, CaptureErrorKind, CaptureStream, StreamConfig},
};

pub const FAKE_DEVICE: &str = "fake-npu";

#[derive(Error, Debug)]
#[error("fake: {1}")]
pub struct FakeError(pub AcceleratorErrorCode, pub String);

impl DriverError for FakeError {
  fn code(&self) -> AcceleratorErrorCode {
    self.0
  }
}

/// 注入失败时按调用类型给出错误码
fn injected_code(op: &str) -> AcceleratorErrorCode {
  match op {
    "connect" | "disconnect" => AcceleratorErrorCode::Connection,
    "load_model" => AcceleratorErrorCode::LoadModel,
    "destroy_model" => AcceleratorErrorCode::DeleteModel,
    "create_tensors" | "destroy_tensors" => AcceleratorErrorCode::TensorMismatch,
    "bind" => AcceleratorErrorCode::Fd,
    _ => AcceleratorErrorCode::Job,
  }
}

/// 任务执行时程序的行为
#[derive(Debug, Clone)]
pub enum Behavior {
  /// 读取 0 号输入，每个字节加一后写入 0 号输出
  Increment,
  /// 读取 0 号输入，按顺序写入固定的输出
  Canned(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct FakeProgram {
  pub inputs: Vec<usize>,
  pub outputs: Vec<usize>,
  pub behavior: Behavior,
}

#[derive(Debug, Default)]
pub struct FakeLog {
  /// 形如 `run_job:detector` 的调用记录
  pub calls: Vec<String>,
  /// 每次任务读到的 0 号输入
  pub seen: Vec<(String, Vec<u8>)>,
  /// 命中即失败的调用
  pub fail: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CallRecorder(Arc<Mutex<FakeLog>>);

impl CallRecorder {
  fn lock(&self) -> MutexGuard<'_, FakeLog> {
    self.0.lock().unwrap()
  }

  pub fn calls(&self) -> Vec<String> {
    self.lock().calls.clone()
  }

  pub fn position(&self, call: &str) -> Option<usize> {
    self.lock().calls.iter().position(|c| c == call)
  }

  pub fn count(&self, call: &str) -> usize {
    self.lock().calls.iter().filter(|c| *c == call).count()
  }

  pub fn seen(&self, program: &str) -> Vec<Vec<u8>> {
    self
      .lock()
      .seen
      .iter()
      .filter(|(name, _)| name == program)
      .map(|(_, data)| data.clone())
      .collect()
  }

  pub fn fail_on(&self, call: &str) {
    self.lock().fail.insert(call.to_string());
  }

  pub fn clear_failures(&self) {
    self.lock().fail.clear();
  }
}

struct Tensor {
  program: String,
  pitch: usize,
  fd: Option<OwnedFd>,
}

struct Job {
  program: String,
  inputs: Vec<TensorId>,
  outputs: Vec<TensorId>,
}

/// 以内存表模拟的加速器服务，程序按名字注册
#[derive(Default)]
pub struct FakeAccelerator {
  recorder: CallRecorder,
  catalog: HashMap<String, FakeProgram>,
  next: u64,
  maps: HashSet<u64>,
  programs: HashMap<u64, String>,
  tensors: HashMap<u64, Tensor>,
  jobs: HashMap<u64, Job>,
}

impl FakeAccelerator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_program(mut self, name: &str, program: FakeProgram) -> Self {
    self.catalog.insert(name.to_string(), program);
    self
  }

  pub fn recorder(&self) -> CallRecorder {
    self.recorder.clone()
  }

  pub fn live_handles(&self) -> usize {
    self.maps.len() + self.programs.len() + self.tensors.len() + self.jobs.len()
  }

  fn id(&mut self) -> u64 {
    self.next += 1;
    self.next
  }

  fn record(&self, call: String) -> Result<(), FakeError> {
    let mut log = self.recorder.lock();
    let op = call.split(':').next().unwrap_or_default().to_string();
    let failed = log.fail.contains(&call) || log.fail.contains(&op);
    log.calls.push(call.clone());
    if failed {
      Err(FakeError(injected_code(&op), format!("{} 注入失败", call)))
    } else {
      Ok(())
    }
  }

  fn program_name(&self, program: ProgramId) -> Result<String, FakeError> {
    self
      .programs
      .get(&program.0)
      .cloned()
      .ok_or_else(|| {
        FakeError(
          AcceleratorErrorCode::ModelNotFound,
          format!("程序 {} 不存在", program.0),
        )
      })
  }

  fn file(&self, tensor: TensorId) -> Result<File, FakeError> {
    let fd = self
      .tensors
      .get(&tensor.0)
      .and_then(|t| t.fd.as_ref())
      .ok_or_else(|| FakeError(AcceleratorErrorCode::Fd, format!("张量 {} 未绑定", tensor.0)))?;
    let fd = fd
      .try_clone()
      .map_err(|e| FakeError(AcceleratorErrorCode::Fd, e.to_string()))?;
    Ok(File::from(fd))
  }

  fn pitch(&self, tensor: TensorId) -> usize {
    self.tensors.get(&tensor.0).map(|t| t.pitch).unwrap_or(0)
  }
}

impl AcceleratorDriver for FakeAccelerator {
  type Error = FakeError;

  fn connect(&mut self) -> Result<(), Self::Error> {
    self.record("connect".to_string())
  }

  fn disconnect(&mut self) -> Result<(), Self::Error> {
    self.record("disconnect".to_string())
  }

  fn list_devices(&mut self) -> Result<Vec<String>, Self::Error> {
    self.record("list_devices".to_string())?;
    Ok(vec![FAKE_DEVICE.to_string()])
  }

  fn create_map(&mut self, _params: &ParamMap) -> Result<MapId, Self::Error> {
    self.record("create_map".to_string())?;
    let id = self.id();
    self.maps.insert(id);
    Ok(MapId(id))
  }

  fn destroy_map(&mut self, map: MapId) -> Result<(), Self::Error> {
    self.record("destroy_map".to_string())?;
    self.maps.remove(&map.0);
    Ok(())
  }

  fn load_model(
    &mut self,
    _program: Option<&File>,
    device: &str,
    _access: Access,
    name: &str,
    _params: Option<MapId>,
  ) -> Result<ProgramId, Self::Error> {
    self.record(format!("load_model:{}", name))?;
    if device != FAKE_DEVICE || !self.catalog.contains_key(name) {
      return Err(FakeError(
        AcceleratorErrorCode::InvalidChipId,
        format!("{}@{} 不存在", name, device),
      ));
    }
    let id = self.id();
    self.programs.insert(id, name.to_string());
    Ok(ProgramId(id))
  }

  fn destroy_model(&mut self, program: ProgramId) -> Result<(), Self::Error> {
    let name = self.program_name(program)?;
    self.record(format!("destroy_model:{}", name))?;
    self.programs.remove(&program.0);
    Ok(())
  }

  fn create_tensors(
    &mut self,
    program: ProgramId,
    direction: TensorDirection,
  ) -> Result<Vec<TensorInfo>, Self::Error> {
    let name = self.program_name(program)?;
    let side = match direction {
      TensorDirection::Input => "input",
      TensorDirection::Output => "output",
    };
    self.record(format!("create_tensors:{}:{}", name, side))?;
    let entry = &self.catalog[&name];
    let pitches = match direction {
      TensorDirection::Input => entry.inputs.clone(),
      TensorDirection::Output => entry.outputs.clone(),
    };

    let mut infos = Vec::with_capacity(pitches.len());
    for pitch in pitches {
      let id = self.id();
      self.tensors.insert(
        id,
        Tensor {
          program: name.clone(),
          pitch,
          fd: None,
        },
      );
      infos.push(TensorInfo {
        id: TensorId(id),
        pitches: vec![pitch],
        data_type: TensorDataType::Uint8,
        layout: TensorLayout::Unspecified,
      });
    }
    Ok(infos)
  }

  fn destroy_tensors(&mut self, tensors: &[TensorId]) -> Result<(), Self::Error> {
    let name = tensors
      .first()
      .and_then(|t| self.tensors.get(&t.0))
      .map(|t| t.program.clone())
      .unwrap_or_default();
    self.record(format!("destroy_tensors:{}", name))?;
    for tensor in tensors {
      self.tensors.remove(&tensor.0);
    }
    Ok(())
  }

  fn bind_tensor_fd(&mut self, tensor: TensorId, fd: RawFd) -> Result<(), Self::Error> {
    let entry = self
      .tensors
      .get_mut(&tensor.0)
      .ok_or_else(|| {
        FakeError(
          AcceleratorErrorCode::TensorMismatch,
          format!("张量 {} 不存在", tensor.0),
        )
      })?;
    let call = format!("bind:{}", entry.program);
    // SAFETY: 测试中会话保证描述符有效
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }
      .try_clone_to_owned()
      .map_err(|e| FakeError(AcceleratorErrorCode::Fd, e.to_string()))?;
    entry.fd = Some(owned);
    self.record(call)
  }

  fn create_job(
    &mut self,
    program: ProgramId,
    inputs: &[TensorId],
    outputs: &[TensorId],
    _params: Option<MapId>,
  ) -> Result<JobId, Self::Error> {
    let name = self.program_name(program)?;
    self.record(format!("create_job:{}", name))?;
    let id = self.id();
    self.jobs.insert(
      id,
      Job {
        program: name,
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
      },
    );
    Ok(JobId(id))
  }

  fn destroy_job(&mut self, job: JobId) -> Result<(), Self::Error> {
    let name = self
      .jobs
      .get(&job.0)
      .map(|j| j.program.clone())
      .unwrap_or_default();
    self.record(format!("destroy_job:{}", name))?;
    self.jobs.remove(&job.0);
    Ok(())
  }

  fn run_job(&mut self, job: JobId) -> Result<(), Self::Error> {
    let job = self
      .jobs
      .get(&job.0)
      .ok_or_else(|| FakeError(AcceleratorErrorCode::Job, format!("任务 {} 不存在", job.0)))?;
    let (program, inputs, outputs) = (job.program.clone(), job.inputs.clone(), job.outputs.clone());
    self.record(format!("run_job:{}", program))?;

    let mut input = vec![0u8; self.pitch(inputs[0])];
    self
      .file(inputs[0])?
      .read_exact(&mut input)
      .map_err(|e| FakeError(AcceleratorErrorCode::Fd, e.to_string()))?;
    self.recorder.lock().seen.push((program.clone(), input.clone()));

    let written: Vec<Vec<u8>> = match &self.catalog[&program].behavior {
      Behavior::Increment => {
        let mut out: Vec<u8> = input.iter().map(|b| b.wrapping_add(1)).collect();
        out.resize(self.pitch(outputs[0]), 0);
        vec![out]
      }
      Behavior::Canned(canned) => canned.clone(),
    };
    for (tensor, data) in outputs.iter().zip(written) {
      self
        .file(*tensor)?
        .write_all(&data)
        .map_err(|e| FakeError(AcceleratorErrorCode::Fd, e.to_string()))?;
    }
    Ok(())
  }
}

/// 采集脚本中的一步
#[derive(Debug, Clone)]
pub enum Step {
  Frame(Vec<u8>),
  Fail(CaptureErrorKind),
  /// 返回预期错误，并让接下来的若干次打开失败
  Outage(usize),
  /// 不再出帧，每次读取阻塞到视频流的读取超时
  Stall,
}

#[derive(Debug, Default)]
pub struct Script {
  pub steps: VecDeque<Step>,
  pub opens: usize,
  pub starts: usize,
  pub stops: usize,
  /// 接下来若干次打开会以预期错误失败
  pub open_failures: usize,
  pub sequence: u64,
}

/// 按脚本返回帧或错误的采集驱动；脚本读完后每次取帧等待片刻并返回暂时错误
#[derive(Debug, Clone, Default)]
pub struct ScriptedCapture {
  pub script: Arc<Mutex<Script>>,
}

impl ScriptedCapture {
  pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
    let capture = Self::default();
    capture.script().steps.extend(steps);
    capture
  }

  pub fn script(&self) -> MutexGuard<'_, Script> {
    self.script.lock().unwrap()
  }
}

impl CaptureDriver for ScriptedCapture {
  type Stream = ScriptedStream;

  fn open(&mut self, config: &StreamConfig) -> Result<Self::Stream, CaptureError> {
    let mut script = self.script();
    script.opens += 1;
    if script.open_failures > 0 {
      script.open_failures -= 1;
      return Err(CaptureError::new(CaptureErrorKind::Expected, "服务维护中"));
    }
    Ok(ScriptedStream {
      script: self.script.clone(),
      read_timeout: config.read_timeout,
    })
  }
}

pub struct ScriptedStream {
  script: Arc<Mutex<Script>>,
  read_timeout: Option<Duration>,
}

impl CaptureStream for ScriptedStream {
  fn start(&mut self) -> Result<(), CaptureError> {
    self.script.lock().unwrap().starts += 1;
    Ok(())
  }

  fn stop(&mut self) -> Result<(), CaptureError> {
    self.script.lock().unwrap().stops += 1;
    Ok(())
  }

  fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
    let step = self.script.lock().unwrap().steps.pop_front();
    match step {
      Some(Step::Frame(data)) => {
        let mut script = self.script.lock().unwrap();
        script.sequence += 1;
        Ok(RawFrame {
          sequence: script.sequence,
          timestamp: Utc::now(),
          frame_type: FrameType::Nv12,
          data,
        })
      }
      Some(Step::Fail(kind)) => Err(CaptureError::new(kind, "脚本错误")),
      Some(Step::Stall) => {
        // 摄像头不再出帧，停留在此步骤，每次读取等到超时返回
        self.script.lock().unwrap().steps.push_front(Step::Stall);
        thread::sleep(self.read_timeout.unwrap_or(Duration::from_secs(3600)));
        Err(CaptureError::new(CaptureErrorKind::Transient, "读取超时"))
      }
      Some(Step::Outage(failed_opens)) => {
        self.script.lock().unwrap().open_failures = failed_opens;
        Err(CaptureError::new(CaptureErrorKind::Expected, "服务重启"))
      }
      None => {
        thread::sleep(Duration::from_millis(5));
        Err(CaptureError::new(CaptureErrorKind::Transient, "没有新帧"))
      }
    }
  }
}
