// 该文件是 Beifeng （北风） 项目的一部分。
// src/model/ssd.rs - SSD 多张量输出解码
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

//! 带后处理的 SSD 模型输出四个张量：
//!
//! 0. 位置 `[N, 4]`，顺序为 top / left / bottom / right
//! 1. 类别 `[N]`
//! 2. 得分 `[N]`
//! 3. 有效数量 `[1]`
//!
//! 每个张量各自量化，或直接以小端 float32 输出。

use tracing::{debug, warn};

use crate::model::{
  BoundingBox, DecodeError, Detection, DetectionDecoder, Quantization, non_maximum_suppression,
  tensor,
};

/// 张量元素的编码方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TensorEncoding {
  Quantized(Quantization),
  Float32,
}

impl TensorEncoding {
  fn element_size(&self) -> usize {
    match self {
      TensorEncoding::Quantized(_) => 1,
      TensorEncoding::Float32 => 4,
    }
  }

  fn values(&self, data: &[u8]) -> Vec<f32> {
    match self {
      TensorEncoding::Quantized(q) => data.iter().map(|&b| q.dequantize(b)).collect(),
      TensorEncoding::Float32 => data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect(),
    }
  }
}

const LOCATIONS: usize = 0;
const CLASSES: usize = 1;
const SCORES: usize = 2;
const COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct SsdDecoder {
  detections: usize,
  encodings: [TensorEncoding; 4],
  confidence_threshold: f32,
  iou_threshold: f32,
}

impl Default for SsdDecoder {
  fn default() -> Self {
    Self {
      detections: 20,
      encodings: [TensorEncoding::Float32; 4],
      confidence_threshold: 0.5,
      iou_threshold: 0.5,
    }
  }
}

impl SsdDecoder {
  pub fn new(detections: usize) -> Self {
    Self {
      detections,
      ..Default::default()
    }
  }

  /// 依次为位置、类别、得分、数量四个张量指定编码
  pub fn encodings(mut self, encodings: [TensorEncoding; 4]) -> Self {
    self.encodings = encodings;
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

  fn values(&self, outputs: &[Vec<u8>], index: usize, elements: usize) -> Result<Vec<f32>, DecodeError> {
    let encoding = self.encodings[index];
    let data = tensor(outputs, index, elements * encoding.element_size())?;
    Ok(encoding.values(data))
  }
}

impl DetectionDecoder for SsdDecoder {
  fn output_sizes(&self) -> Vec<usize> {
    [self.detections * 4, self.detections, self.detections, 1]
      .iter()
      .zip(self.encodings.iter())
      .map(|(elements, encoding)| elements * encoding.element_size())
      .collect()
  }

  fn decode(&self, outputs: &[Vec<u8>]) -> Result<Vec<Detection>, DecodeError> {
    let locations = self.values(outputs, LOCATIONS, self.detections * 4)?;
    let classes = self.values(outputs, CLASSES, self.detections)?;
    let scores = self.values(outputs, SCORES, self.detections)?;
    let count = self.values(outputs, COUNT, 1)?[0];

    let reported = if count.is_finite() && count > 0.0 {
      count as usize
    } else {
      0
    };
    if reported > self.detections {
      warn!("SSD 报告 {} 个结果, 超过上限 {}", reported, self.detections);
    }
    let count = reported.min(self.detections);

    let candidates: Vec<Detection> = (0..count)
      .filter(|&i| scores[i] > self.confidence_threshold)
      .map(|i| {
        let loc = &locations[i * 4..i * 4 + 4];
        Detection {
          bbox: BoundingBox::new(loc[0], loc[1], loc[2], loc[3]),
          confidence: scores[i],
          class_id: classes[i].max(0.0) as usize,
          class_score: scores[i],
        }
      })
      .collect();

    let kept = candidates.len();
    let detections = non_maximum_suppression(candidates, self.iou_threshold);
    debug!("SSD 解码: {} 个候选框, 抑制后 {} 个", kept, detections.len());
    Ok(detections)
  }
}
