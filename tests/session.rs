// 该文件是 Beifeng （北风） 项目的一部分。
// tests/session.rs - 加速器会话测试
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

mod common;

use std::cell::Cell;

use beifeng::{
  BoxError,
  accel::{
    AcceleratorErrorCode, Access, AcceleratorSession, JobStep, MemMapConfiguration, ModelHandle, ModelSource, ParamMap,
    SessionError,
  },
  arena::{ArenaError, SlotSize},
};

use common::{Behavior, FAKE_DEVICE, FakeAccelerator, CallRecorder, FakeProgram};

fn session() -> (AcceleratorSession<FakeAccelerator>, CallRecorder) {
  let driver = FakeAccelerator::new()
    .with_program(
      "preprocess",
      FakeProgram {
        inputs: vec![16],
        outputs: vec![12],
        behavior: Behavior::Increment,
      },
    )
    .with_program(
      "detector",
      FakeProgram {
        inputs: vec![12],
        outputs: vec![4, 8],
        behavior: Behavior::Canned(vec![vec![1; 4], vec![2; 8]]),
      },
    );
  let recorder = driver.recorder();
  let mut session = AcceleratorSession::new(driver);
  session.connect().unwrap();
  (session, recorder)
}

fn load(session: &mut AcceleratorSession<FakeAccelerator>, name: &str) -> ModelHandle {
  session
    .load_model(
      &ModelSource::Builtin,
      FAKE_DEVICE,
      Access::Private,
      name,
      Some(&ParamMap::new().with("name", name)),
    )
    .unwrap()
}

fn realize_detector(session: &mut AcceleratorSession<FakeAccelerator>) -> ModelHandle {
  let mut model = load(session, "detector");
  let config = MemMapConfiguration::new()
    .input(0, SlotSize::FromPitch)
    .output(0, SlotSize::FromPitch)
    .output(1, SlotSize::FromPitch);
  session.realize_tensors(&mut model, &config).unwrap();
  session.create_job_request(&mut model, None).unwrap();
  model
}

#[test]
fn test_connect_lists_devices() {
  let (session, recorder) = session();
  assert!(session.is_connected());
  assert_eq!(session.devices(), [FAKE_DEVICE.to_string()]);
  assert_eq!(recorder.calls(), vec!["connect", "list_devices"]);
}

#[test]
fn test_unknown_device_is_rejected() {
  let (mut session, recorder) = session();
  let result = session.load_model(
    &ModelSource::Builtin,
    "gpu0",
    Access::Private,
    "detector",
    None,
  );
  let err = result.unwrap_err();
  assert_eq!(err.code(), AcceleratorErrorCode::InvalidChipId);
  assert!(matches!(err, SessionError::DeviceNotFound(d) if d == "gpu0"));
  assert_eq!(recorder.position("load_model:detector"), None);
}

#[test]
fn test_failed_load_releases_map() {
  let (mut session, recorder) = session();
  recorder.fail_on("load_model");
  let result = session.load_model(
    &ModelSource::Builtin,
    FAKE_DEVICE,
    Access::Private,
    "detector",
    Some(&ParamMap::new()),
  );
  let err = result.unwrap_err();
  assert!(matches!(err, SessionError::Driver { step: "load model", .. }));
  assert_eq!(err.code(), AcceleratorErrorCode::LoadModel);
  assert_eq!(recorder.count("destroy_map"), 1);
  assert_eq!(session.driver().live_handles(), 0);
}

#[test]
fn test_buffers_sized_from_pitch() {
  let (mut session, _recorder) = session();
  let model = realize_detector(&mut session);
  assert!(model.is_realized());
  assert!(model.has_job_request());

  let arena = session.arena();
  assert_eq!(arena.live_buffers(), 3);
  assert_eq!(arena.capacity(model.input_buffer(0).unwrap()).unwrap(), 12);
  assert_eq!(arena.capacity(model.output_buffer(0).unwrap()).unwrap(), 4);
  assert_eq!(arena.capacity(model.output_buffer(1).unwrap()).unwrap(), 8);
  assert_eq!(model.output_pitch(1), Some(8));
}

#[test]
fn test_realize_twice_is_rejected() {
  let (mut session, _recorder) = session();
  let mut model = realize_detector(&mut session);
  let again = session.realize_tensors(&mut model, &MemMapConfiguration::new());
  assert!(matches!(again, Err(SessionError::AlreadyRealized(_))));
}

#[test]
fn test_job_before_realize_is_rejected() {
  let (mut session, _recorder) = session();
  let mut model = load(&mut session, "detector");
  let result = session.create_job_request(&mut model, None);
  assert!(matches!(result, Err(SessionError::NotRealized(_))));
}

#[test]
fn test_slot_out_of_range() {
  let (mut session, recorder) = session();
  let mut model = load(&mut session, "detector");
  let config = MemMapConfiguration::new().output(5, SlotSize::FromPitch);
  let result = session.realize_tensors(&mut model, &config);
  assert!(matches!(
    result,
    Err(SessionError::SlotOutOfRange { slot: 5, count: 2, .. })
  ));
  // 失败时已创建的张量句柄被回收
  assert_eq!(recorder.count("destroy_tensors:detector"), 2);
  assert_eq!(session.arena().live_buffers(), 0);
}

#[test]
fn test_destroy_order() {
  let (mut session, recorder) = session();
  let mut model = realize_detector(&mut session);
  session
    .create_job_request(&mut model, Some(&ParamMap::new().with("priority", 1i64)))
    .unwrap();
  assert_eq!(recorder.count("destroy_job:detector"), 1);

  session.destroy_model(model).unwrap();
  let calls = recorder.calls();
  let tail: Vec<&str> = calls[calls.len() - 6..].iter().map(String::as_str).collect();
  assert_eq!(
    tail,
    vec![
      "destroy_map",
      "destroy_map",
      "destroy_job:detector",
      "destroy_tensors:detector",
      "destroy_tensors:detector",
      "destroy_model:detector",
    ]
  );
  assert_eq!(session.arena().live_buffers(), 0);
  assert_eq!(session.driver().live_handles(), 0);
}

#[test]
fn test_replacing_job_releases_its_map() {
  let (mut session, recorder) = session();
  let mut model = realize_detector(&mut session);
  let before = session.driver().live_handles();

  for priority in 0..3i64 {
    session
      .create_job_request(&mut model, Some(&ParamMap::new().with("priority", priority)))
      .unwrap();
  }
  // 第一次替换的是不带配置表的请求
  assert_eq!(recorder.count("destroy_map"), 2);
  assert_eq!(session.driver().live_handles(), before + 1);

  session.create_job_request(&mut model, None).unwrap();
  assert_eq!(recorder.count("destroy_map"), 3);
  assert_eq!(session.driver().live_handles(), before);

  session.destroy_model(model).unwrap();
  assert_eq!(recorder.count("destroy_map"), 4);
  assert_eq!(session.driver().live_handles(), 0);
}

#[test]
fn test_destroy_continues_after_failure() {
  let (mut session, recorder) = session();
  let model = realize_detector(&mut session);
  recorder.fail_on("destroy_job");

  let result = session.destroy_model(model);
  assert!(matches!(
    result,
    Err(SessionError::Driver { step, code: AcceleratorErrorCode::Job, .. })
      if step == "destroy job request"
  ));
  assert!(recorder.position("destroy_model:detector").is_some());
  assert_eq!(session.arena().live_buffers(), 0);
}

#[test]
fn test_shared_buffer_is_not_released_by_borrower() {
  let (mut session, _recorder) = session();
  let mut producer = load(&mut session, "preprocess");
  session
    .realize_tensors(
      &mut producer,
      &MemMapConfiguration::new()
        .input(0, SlotSize::FromPitch)
        .output(0, SlotSize::FromPitch),
    )
    .unwrap();
  let shared = producer.output_buffer(0).unwrap();

  let mut consumer = load(&mut session, "detector");
  session
    .realize_tensors(
      &mut consumer,
      &MemMapConfiguration::new()
        .input(0, SlotSize::Shared(shared))
        .output(0, SlotSize::Fixed(4)),
    )
    .unwrap();
  assert_eq!(consumer.input_buffer(0), Some(shared));
  assert!(!consumer.inputs()[0].is_owned());
  // 未配置的槽位不绑定缓冲区
  assert_eq!(consumer.output_buffer(1), None);
  assert_eq!(session.arena().live_buffers(), 3);

  session.destroy_model(consumer).unwrap();
  assert!(session.arena().contains(shared));
  assert_eq!(session.arena().live_buffers(), 2);

  session.destroy_model(producer).unwrap();
  assert!(!session.arena().contains(shared));
  assert_eq!(session.arena().live_buffers(), 0);
}

#[test]
fn test_shared_buffer_too_small() {
  let (mut session, _recorder) = session();
  let mut producer = load(&mut session, "preprocess");
  session
    .realize_tensors(
      &mut producer,
      &MemMapConfiguration::new().output(0, SlotSize::Fixed(6)),
    )
    .unwrap();

  let mut consumer = load(&mut session, "detector");
  let result = session.realize_tensors(
    &mut consumer,
    &MemMapConfiguration::new().input(0, SlotSize::Shared(producer.output_buffer(0).unwrap())),
  );
  assert!(matches!(
    result,
    Err(SessionError::SharedBufferTooSmall {
      slot: 0,
      capacity: 6,
      pitch: 12
    })
  ));
}

#[test]
fn test_execute_reads_outputs() {
  let (mut session, recorder) = session();
  let model = realize_detector(&mut session);
  let input = model.input_buffer(0).unwrap();
  let outputs = [model.output_buffer(0).unwrap(), model.output_buffer(1).unwrap()];

  let result = session
    .execute(
      &model,
      |arena| {
        arena.rewind(input)?;
        arena.copy_in(input, &[9; 12])?;
        outputs.iter().try_for_each(|&id| arena.rewind(id))
      },
      |arena| {
        outputs
          .iter()
          .zip([4, 8])
          .map(|(&id, len)| arena.copy_out(id, len))
          .collect::<Result<Vec<_>, ArenaError>>()
      },
    )
    .unwrap();
  assert_eq!(result.output, vec![vec![1; 4], vec![2; 8]]);
  assert_eq!(recorder.seen("detector"), vec![vec![9; 12]]);
}

#[test]
fn test_job_error_names_failed_step() {
  let (mut session, recorder) = session();
  let model = realize_detector(&mut session);
  let fetched = Cell::new(false);

  // 设置输入失败时不会提交任务
  let err = session
    .execute(
      &model,
      |_| Err::<(), BoxError>("输入无效".into()),
      |_| {
        fetched.set(true);
        Ok::<_, BoxError>(())
      },
    )
    .unwrap_err();
  assert_eq!(err.step, JobStep::SetInput);
  assert_eq!(err.model, "detector");
  assert_eq!(recorder.count("run_job:detector"), 0);
  assert!(!fetched.get());

  // 执行失败时不会读取输出
  recorder.fail_on("run_job:detector");
  let err = session
    .execute(
      &model,
      |_| Ok::<_, BoxError>(()),
      |_| {
        fetched.set(true);
        Ok::<_, BoxError>(())
      },
    )
    .unwrap_err();
  assert_eq!(err.step, JobStep::Execute);
  assert!(!fetched.get());
  recorder.clear_failures();

  let err = session
    .execute(
      &model,
      |_| Ok::<_, BoxError>(()),
      |_| Err::<(), BoxError>("输出损坏".into()),
    )
    .unwrap_err();
  assert_eq!(err.step, JobStep::GetOutput);
  assert_eq!(recorder.count("run_job:detector"), 2);
}

#[test]
fn test_execute_without_job_request() {
  let (mut session, _recorder) = session();
  let mut model = load(&mut session, "detector");
  session
    .realize_tensors(&mut model, &MemMapConfiguration::new())
    .unwrap();
  let err = session
    .execute(&model, |_| Ok::<_, BoxError>(()), |_| Ok::<_, BoxError>(()))
    .unwrap_err();
  assert_eq!(err.step, JobStep::Execute);
}
