// 该文件是 Beifeng （北风） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 输出解码
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

use tracing::debug;

use crate::model::{
  BoundingBox, DecodeError, Detection, DetectionDecoder, Quantization, non_maximum_suppression,
  tensor,
};

/// YOLOv5n 的候选框数量
pub const YOLOV5N_CANDIDATES: usize = 25200;
/// YOLOv5n 输出的量化系数
pub const YOLOV5N_SCALE: f32 = 0.004190513398498297;
const BOX_FIELDS: usize = 5;

/// 单张量输出头：每行 `[cx, cy, w, h, conf, class_0, ..., class_n]`
#[derive(Debug, Clone)]
pub struct YoloDecoder {
  candidates: usize,
  classes: usize,
  quantization: Quantization,
  confidence_threshold: f32,
  iou_threshold: f32,
}

impl Default for YoloDecoder {
  fn default() -> Self {
    Self {
      candidates: YOLOV5N_CANDIDATES,
      classes: 80,
      quantization: Quantization::new(YOLOV5N_SCALE),
      confidence_threshold: 0.25,
      iou_threshold: 0.45,
    }
  }
}

impl YoloDecoder {
  pub fn new(candidates: usize, classes: usize) -> Self {
    Self {
      candidates,
      classes,
      ..Default::default()
    }
  }

  pub fn quantization(mut self, quantization: Quantization) -> Self {
    self.quantization = quantization;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  fn row_len(&self) -> usize {
    BOX_FIELDS + self.classes
  }

  /// 阈值过滤后的候选框，尚未做非极大值抑制
  fn candidates(&self, raw: &[u8]) -> Vec<Detection> {
    let q = self.quantization;
    raw
      .chunks_exact(self.row_len())
      .take(self.candidates)
      .filter_map(|row| {
        let confidence = q.dequantize(row[4]);
        if confidence <= self.confidence_threshold {
          return None;
        }

        let (class_id, class_score) = row[BOX_FIELDS..]
          .iter()
          .enumerate()
          .map(|(i, &v)| (i, q.dequantize(v)))
          .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        Some(Detection {
          bbox: BoundingBox::from_center(
            q.dequantize(row[0]),
            q.dequantize(row[1]),
            q.dequantize(row[2]),
            q.dequantize(row[3]),
          ),
          confidence,
          class_id,
          class_score: if self.classes == 0 {
            confidence
          } else {
            class_score
          },
        })
      })
      .collect()
  }
}

impl DetectionDecoder for YoloDecoder {
  fn output_sizes(&self) -> Vec<usize> {
    vec![self.candidates * self.row_len()]
  }

  fn decode(&self, outputs: &[Vec<u8>]) -> Result<Vec<Detection>, DecodeError> {
    let raw = tensor(outputs, 0, self.candidates * self.row_len())?;
    let candidates = self.candidates(raw);
    let kept = candidates.len();
    let detections = non_maximum_suppression(candidates, self.iou_threshold);
    debug!("YOLO 解码: {} 个候选框, 抑制后 {} 个", kept, detections.len());
    Ok(detections)
  }
}

/// 解码单张量输出头，候选框数量由数据长度推出
pub fn decode(
  raw: &[u8],
  scale: f32,
  confidence_threshold: f32,
  iou_threshold: f32,
  classes: usize,
) -> Result<Vec<Detection>, DecodeError> {
  let row = BOX_FIELDS + classes;
  if raw.len() < row {
    return Err(DecodeError::ShortBuffer {
      tensor: 0,
      expected: row,
      actual: raw.len(),
    });
  }
  let decoder = YoloDecoder::new(raw.len() / row, classes)
    .quantization(Quantization::new(scale))
    .confidence_threshold(confidence_threshold)
    .iou_threshold(iou_threshold);
  let candidates = decoder.candidates(raw);
  Ok(non_maximum_suppression(candidates, iou_threshold))
}
