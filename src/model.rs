// 该文件是 coreml-detect 项目的一部分。
// src/model.rs - 模型描述与检测结果
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 AtomStorm

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decode_url_path};

pub mod decode;
pub mod nms;

/// YOLO 模型版本，决定原始输出张量的解码方式
///
/// 序号与宿主侧枚举保持一致：`V5 = 0`, `V8 = 1`, `V11 = 2`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVersion {
  V5,
  V8,
  V11,
}

impl ModelVersion {
  pub const ALL: [ModelVersion; 3] = [ModelVersion::V5, ModelVersion::V8, ModelVersion::V11];

  pub fn from_ordinal(ordinal: i32) -> Option<Self> {
    match ordinal {
      0 => Some(ModelVersion::V5),
      1 => Some(ModelVersion::V8),
      2 => Some(ModelVersion::V11),
      _ => None,
    }
  }

  pub fn ordinal(self) -> i32 {
    match self {
      ModelVersion::V5 => 0,
      ModelVersion::V8 => 1,
      ModelVersion::V11 => 2,
    }
  }

  /// 是否带有独立的目标置信度（objectness）通道
  pub fn has_objectness(self) -> bool {
    matches!(self, ModelVersion::V5)
  }
}

impl fmt::Display for ModelVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelVersion::V5 => write!(f, "v5"),
      ModelVersion::V8 => write!(f, "v8"),
      ModelVersion::V11 => write!(f, "v11"),
    }
  }
}

impl FromStr for ModelVersion {
  type Err = ModelSpecError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().trim_start_matches("yolo") {
      "v5" | "5" => Ok(ModelVersion::V5),
      "v8" | "8" => Ok(ModelVersion::V8),
      "v11" | "11" => Ok(ModelVersion::V11),
      _ => Err(ModelSpecError::UnknownVersion(s.to_string())),
    }
  }
}

/// 允许推理后端使用的计算单元
///
/// 序号与宿主侧枚举保持一致：
/// `CpuOnly = 0`, `CpuAndGpu = 1`, `All = 2`, `CpuAndNeuralEngine = 3`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreMask {
  CpuOnly,
  CpuAndGpu,
  All,
  CpuAndNeuralEngine,
}

impl CoreMask {
  pub const ALL: [CoreMask; 4] = [
    CoreMask::CpuOnly,
    CoreMask::CpuAndGpu,
    CoreMask::All,
    CoreMask::CpuAndNeuralEngine,
  ];

  pub fn from_ordinal(ordinal: i32) -> Option<Self> {
    match ordinal {
      0 => Some(CoreMask::CpuOnly),
      1 => Some(CoreMask::CpuAndGpu),
      2 => Some(CoreMask::All),
      3 => Some(CoreMask::CpuAndNeuralEngine),
      _ => None,
    }
  }

  pub fn ordinal(self) -> i32 {
    match self {
      CoreMask::CpuOnly => 0,
      CoreMask::CpuAndGpu => 1,
      CoreMask::All => 2,
      CoreMask::CpuAndNeuralEngine => 3,
    }
  }

  pub fn uses_gpu(self) -> bool {
    matches!(self, CoreMask::CpuAndGpu | CoreMask::All)
  }

  pub fn uses_neural_engine(self) -> bool {
    matches!(self, CoreMask::CpuAndNeuralEngine | CoreMask::All)
  }
}

impl fmt::Display for CoreMask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CoreMask::CpuOnly => write!(f, "cpu"),
      CoreMask::CpuAndGpu => write!(f, "gpu"),
      CoreMask::All => write!(f, "all"),
      CoreMask::CpuAndNeuralEngine => write!(f, "ane"),
    }
  }
}

impl FromStr for CoreMask {
  type Err = ModelSpecError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" | "cpu_only" => Ok(CoreMask::CpuOnly),
      "gpu" | "cpu_and_gpu" => Ok(CoreMask::CpuAndGpu),
      "all" => Ok(CoreMask::All),
      "ane" | "cpu_and_neural_engine" => Ok(CoreMask::CpuAndNeuralEngine),
      _ => Err(ModelSpecError::UnknownCoreMask(s.to_string())),
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelSpecError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch { expected: &'static str, found: String },
  #[error("缺少参数: {0}")]
  MissingParameter(&'static str),
  #[error("类别数量无效: {0}")]
  InvalidClassCount(String),
  #[error("未知的模型版本: {0}")]
  UnknownVersion(String),
  #[error("未知的计算单元: {0}")]
  UnknownCoreMask(String),
  #[error("模型路径为空")]
  EmptyPath,
}

/// 创建检测器所需的全部参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
  pub path: PathBuf,
  pub num_classes: usize,
  pub version: ModelVersion,
  pub core_mask: CoreMask,
}

impl ModelSpec {
  pub fn new(path: impl Into<PathBuf>, num_classes: usize) -> Self {
    Self {
      path: path.into(),
      num_classes,
      version: ModelVersion::V11,
      core_mask: CoreMask::All,
    }
  }

  pub fn version(mut self, version: ModelVersion) -> Self {
    self.version = version;
    self
  }

  pub fn core_mask(mut self, core_mask: CoreMask) -> Self {
    self.core_mask = core_mask;
    self
  }
}

impl FromUrlWithScheme for ModelSpec {
  const SCHEME: &'static str = "coreml";
}

// coreml:///path/to/model.onnx?classes=1&version=v11&mask=all
impl FromUrl for ModelSpec {
  type Error = ModelSpecError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelSpecError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let path = decode_url_path(url);
    if path.is_empty() {
      return Err(ModelSpecError::EmptyPath);
    }

    let mut num_classes = None;
    let mut version = ModelVersion::V11;
    let mut core_mask = CoreMask::All;

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "classes" => {
          let n = value
            .parse::<usize>()
            .map_err(|_| ModelSpecError::InvalidClassCount(value.to_string()))?;
          if n == 0 {
            return Err(ModelSpecError::InvalidClassCount(value.to_string()));
          }
          num_classes = Some(n);
        }
        "version" => version = value.parse()?,
        "mask" => core_mask = value.parse()?,
        other => debug!("忽略未知的模型参数: {}", other),
      }
    }

    Ok(ModelSpec {
      path: PathBuf::from(path),
      num_classes: num_classes.ok_or(ModelSpecError::MissingParameter("classes"))?,
      version,
      core_mask,
    })
  }
}

/// 解码阶段的候选框，坐标为 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4],
}

impl DetectItem {
  pub fn area(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
  }
}

/// 单个检测结果，坐标为原图像素
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
  pub confidence: f32,
  pub class_id: i32,
}

impl Detection {
  pub fn width(&self) -> i32 {
    self.right - self.left
  }

  pub fn height(&self) -> i32 {
    self.bottom - self.top
  }

  /// 检查框是否完整落在 `width x height` 的图像内
  pub fn is_within(&self, width: u32, height: u32) -> bool {
    self.left >= 0
      && self.top >= 0
      && self.left <= self.right
      && self.top <= self.bottom
      && self.right <= width as i32
      && self.bottom <= height as i32
  }
}

impl fmt::Display for Detection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "class {} {:.2} at ({}, {}, {}, {})",
      self.class_id, self.confidence, self.left, self.top, self.right, self.bottom
    )
  }
}
