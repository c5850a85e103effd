// 该文件是 Beifeng （北风） 项目的一部分。
// src/output.rs - 输出定义
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

use std::convert::Infallible;

use serde_json::{Value, json};
use tracing::info;

use crate::{frame::Frame, model::Detection, pipeline::PipelineOutput};

#[cfg(feature = "save_image_file")]
mod snapshot;
#[cfg(feature = "save_image_file")]
pub use self::snapshot::{SnapshotRender, SnapshotRenderError};

pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 可以写成一行 JSON 日志的推理结果
pub trait Report {
  fn report(&self, labels: &[&str]) -> Value;
}

impl Report for Vec<u8> {
  fn report(&self, _labels: &[&str]) -> Value {
    json!({ "bytes": self.len() })
  }
}

impl Report for Detection {
  fn report(&self, labels: &[&str]) -> Value {
    json!({
      "class_id": self.class_id,
      "label": self.label(labels),
      "confidence": self.confidence,
      "score": self.class_score,
      "box": [self.bbox.left, self.bbox.top, self.bbox.right, self.bbox.bottom],
    })
  }
}

impl Report for Vec<Detection> {
  fn report(&self, labels: &[&str]) -> Value {
    Value::Array(self.iter().map(|d| d.report(labels)).collect())
  }
}

impl Report for PipelineOutput {
  fn report(&self, labels: &[&str]) -> Value {
    json!({
      "detections": self.detections.report(labels),
      "preprocess_ms": self.preprocess_time.as_secs_f64() * 1000.0,
      "inference_ms": self.inference_time.as_secs_f64() * 1000.0,
    })
  }
}

/// 以 JSON 行的形式把每帧结果写入日志
#[derive(Debug, Clone, Default)]
pub struct LogRender {
  labels: Vec<&'static str>,
}

impl LogRender {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_labels(mut self, labels: &[&'static str]) -> Self {
    self.labels = labels.to_vec();
    self
  }

  pub fn line<T, R: Report>(&self, frame: &Frame<T>, result: &R) -> Value {
    json!({
      "sequence": frame.sequence,
      "timestamp": frame.timestamp.to_rfc3339(),
      "type": frame.frame_type.as_str(),
      "result": result.report(&self.labels),
    })
  }
}

impl<T, R: Report> Render<Frame<T>, R> for LogRender {
  type Error = Infallible;

  fn render_result(&self, frame: &Frame<T>, result: &R) -> Result<(), Self::Error> {
    info!("{}", self.line(frame, result));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use chrono::Utc;

  use super::*;
  use crate::{frame::FrameType, model::BoundingBox};

  #[test]
  fn test_log_line() {
    let frame = Frame {
      sequence: 7,
      timestamp: Utc::now(),
      frame_type: FrameType::Nv12,
      payload: Ok(vec![0u8; 6]),
    };
    let output = PipelineOutput {
      detections: vec![Detection {
        bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        confidence: 0.9,
        class_id: 1,
        class_score: 0.8,
      }],
      preprocess_time: Duration::from_millis(2),
      inference_time: Duration::from_millis(10),
    };

    let render = LogRender::new().with_labels(&["person", "bicycle"]);
    let line = render.line(&frame, &output);
    assert_eq!(line["sequence"], 7);
    assert_eq!(line["type"], "nv12");
    assert_eq!(line["result"]["detections"][0]["label"], "bicycle");
    assert_eq!(line["result"]["detections"][0]["box"][0], 2.0);
    assert!(render.render_result(&frame, &output).is_ok());
  }
}
