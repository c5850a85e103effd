// 该文件是 Beifeng （北风） 项目的一部分。
// src/model.rs - 模型与检测结果
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

use thiserror::Error;

pub trait Model {
  type Input: ?Sized;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("输出张量 {tensor} 长度不足: 期望 {expected} 字节, 实际 {actual} 字节")]
  ShortBuffer {
    tensor: usize,
    expected: usize,
    actual: usize,
  },
  #[error("缺少输出张量 {index} (共 {count} 个)")]
  MissingTensor { index: usize, count: usize },
}

/// 仿射量化参数，`real = scale * (raw - zero_point)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
  pub scale: f32,
  pub zero_point: i32,
}

impl Quantization {
  pub fn new(scale: f32) -> Self {
    Self {
      scale,
      zero_point: 0,
    }
  }

  pub fn with_zero_point(mut self, zero_point: i32) -> Self {
    self.zero_point = zero_point;
    self
  }

  pub fn dequantize(&self, raw: u8) -> f32 {
    self.scale * (raw as i32 - self.zero_point) as f32
  }
}

/// 边界框，坐标位于模型的归一化空间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
}

impl BoundingBox {
  pub fn new(top: f32, left: f32, bottom: f32, right: f32) -> Self {
    Self {
      top,
      left,
      bottom,
      right,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self {
      top: cy - height / 2.0,
      left: cx - width / 2.0,
      bottom: cy + height / 2.0,
      right: cx + width / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    (self.right - self.left).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.bottom - self.top).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  /// 交并比，无交集时直接返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let top = self.top.max(other.top);
    let left = self.left.max(other.left);
    let bottom = self.bottom.min(other.bottom);
    let right = self.right.min(other.right);
    if bottom <= top || right <= left {
      return 0.0;
    }

    let intersection = (bottom - top) * (right - left);
    let union = self.area() + other.area() - intersection;
    if union <= 0.0 {
      return 0.0;
    }
    intersection / union
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: BoundingBox,
  /// 候选框置信度，用于阈值过滤与排序
  pub confidence: f32,
  pub class_id: usize,
  /// 最高类别得分；单类别输出头时与置信度相同
  pub class_score: f32,
}

impl Detection {
  pub fn label<'a>(&self, labels: &[&'a str]) -> &'a str {
    labels.get(self.class_id).copied().unwrap_or("unknown")
  }
}

/// 将输出张量的原始字节解码为检测结果
pub trait DetectionDecoder {
  /// 各输出张量的字节数
  fn output_sizes(&self) -> Vec<usize>;
  fn decode(&self, outputs: &[Vec<u8>]) -> Result<Vec<Detection>, DecodeError>;
}

pub(crate) fn tensor<'a>(
  outputs: &'a [Vec<u8>],
  index: usize,
  expected: usize,
) -> Result<&'a [u8], DecodeError> {
  let data = outputs.get(index).ok_or(DecodeError::MissingTensor {
    index,
    count: outputs.len(),
  })?;
  if data.len() < expected {
    return Err(DecodeError::ShortBuffer {
      tensor: index,
      expected,
      actual: data.len(),
    });
  }
  Ok(&data[..expected])
}

mod labels;
pub use self::labels::COCO_LABELS;

mod nms;
pub use self::nms::non_maximum_suppression;

mod ssd;
pub use self::ssd::{SsdDecoder, TensorEncoding};

mod yolov5;
pub use self::yolov5::{YOLOV5N_CANDIDATES, YOLOV5N_SCALE, YoloDecoder, decode};
