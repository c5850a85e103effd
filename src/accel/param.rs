// 该文件是 Beifeng （北风） 项目的一部分。
// src/accel/param.rs - 加速器配置表
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

use std::collections::BTreeMap;

/// 配置表中的值，驱动按类型分别处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
  Int(i64),
  Str(String),
  IntArr2([i64; 2]),
  IntArr4([i64; 4]),
}

impl From<i64> for ParamValue {
  fn from(value: i64) -> Self {
    ParamValue::Int(value)
  }
}

impl From<&str> for ParamValue {
  fn from(value: &str) -> Self {
    ParamValue::Str(value.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(value: String) -> Self {
    ParamValue::Str(value)
  }
}

impl From<[i64; 2]> for ParamValue {
  fn from(value: [i64; 2]) -> Self {
    ParamValue::IntArr2(value)
  }
}

impl From<[i64; 4]> for ParamValue {
  fn from(value: [i64; 4]) -> Self {
    ParamValue::IntArr4(value)
  }
}

/// 传给加速器驱动的键值配置，键按字典序保存
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
  entries: BTreeMap<String, ParamValue>,
}

impl ParamMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
    self.set(key, value);
    self
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
    self.entries.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&ParamValue> {
    self.entries.get(key)
  }

  pub fn get_int(&self, key: &str) -> Option<i64> {
    match self.get(key)? {
      ParamValue::Int(value) => Some(*value),
      _ => None,
    }
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    match self.get(key)? {
      ParamValue::Str(value) => Some(value),
      _ => None,
    }
  }

  pub fn get_int_arr2(&self, key: &str) -> Option<[i64; 2]> {
    match self.get(key)? {
      ParamValue::IntArr2(value) => Some(*value),
      _ => None,
    }
  }

  pub fn get_int_arr4(&self, key: &str) -> Option<[i64; 4]> {
    match self.get(key)? {
      ParamValue::IntArr4(value) => Some(*value),
      _ => None,
    }
  }

  /// 合并另一张表，同名键以 `other` 为准
  pub fn merge(&mut self, other: &ParamMap) {
    for (key, value) in other.iter() {
      self.entries.insert(key.to_string(), value.clone());
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
