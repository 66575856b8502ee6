// 该文件是 coreml-detect 项目的一部分。
// src/engine/onnx.rs - ONNX Runtime 推理后端（CoreML 执行提供者）
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

use std::path::{Path, PathBuf};

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use tracing::{debug, info, warn};

use crate::{
  engine::{Engine, EngineError, EngineLoader},
  frame::NchwFrame,
  model::{CoreMask, ModelSpec, decode::RawOutput},
};

const DEFAULT_INPUT_SIZE: (u32, u32) = (640, 640);
const SPLIT_COORDINATES: &str = "coordinates";
const SPLIT_CONFIDENCE: &str = "confidence";

fn ort_error<E: std::fmt::Display>(msg: &str) -> impl Fn(E) -> EngineError + '_ {
  move |e| EngineError::invalid(format!("{}: {}", msg, e))
}

#[cfg(feature = "coreml")]
fn build_session(path: &Path, core_mask: CoreMask) -> Result<Session, EngineError> {
  use ort::execution_providers::coreml::{CoreMLComputeUnits, CoreMLExecutionProvider};

  let units = match core_mask {
    CoreMask::CpuOnly => CoreMLComputeUnits::CPUOnly,
    CoreMask::CpuAndGpu => CoreMLComputeUnits::CPUAndGPU,
    CoreMask::All => CoreMLComputeUnits::All,
    CoreMask::CpuAndNeuralEngine => CoreMLComputeUnits::CPUAndNeuralEngine,
  };
  debug!("CoreML 计算单元: {:?}", units);

  Session::builder()
    .map_err(ort_error("无法创建会话"))?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(ort_error("无法设置优化级别"))?
    .with_execution_providers([CoreMLExecutionProvider::default()
      .with_compute_units(units)
      .build()])
    .map_err(ort_error("无法注册 CoreML 执行提供者"))?
    .commit_from_file(path)
    .map_err(ort_error("无法加载模型"))
}

#[cfg(not(feature = "coreml"))]
fn build_session(path: &Path, core_mask: CoreMask) -> Result<Session, EngineError> {
  if core_mask != CoreMask::CpuOnly {
    warn!("未启用 CoreML 支持, 计算单元 {} 退化为 CPU", core_mask);
  }

  Session::builder()
    .map_err(ort_error("无法创建会话"))?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(ort_error("无法设置优化级别"))?
    .commit_from_file(path)
    .map_err(ort_error("无法加载模型"))
}

/// 从 NCHW 输入形状 `[N, 3, H, W]` 读取（宽, 高）；动态维度返回 `None`
fn input_size_from_dims(dims: &[i64]) -> Option<(u32, u32)> {
  let [_, _, height, width] = dims else {
    return None;
  };
  let width = u32::try_from(*width).ok().filter(|w| *w > 0)?;
  let height = u32::try_from(*height).ok().filter(|h| *h > 0)?;
  Some((width, height))
}

pub struct OnnxEngine {
  session: Session,
  path: PathBuf,
  input_size: (u32, u32),
  core_mask: CoreMask,
}

impl OnnxEngine {
  /// 打开模型；`input_size` 为 `None` 时从模型输入形状读取，动态形状退回 640x640
  pub fn open(path: &Path, input_size: Option<(u32, u32)>, core_mask: CoreMask) -> Result<Self, EngineError> {
    if !path.is_file() {
      return Err(EngineError::ModelNotFound(path.to_path_buf()));
    }

    info!("加载模型文件: {}", path.display());
    let session = build_session(path, core_mask)?;

    if session.inputs.len() != 1 {
      return Err(EngineError::invalid(format!(
        "预期模型输入数量为 1, 实际为 {}",
        session.inputs.len()
      )));
    }
    if session.outputs.is_empty() {
      return Err(EngineError::invalid("模型没有输出"));
    }
    let model_size = session.inputs[0]
      .input_type
      .tensor_shape()
      .and_then(|shape| input_size_from_dims(shape));
    let input_size = match (input_size, model_size) {
      (Some(size), _) => size,
      (None, Some(size)) => size,
      (None, None) => {
        warn!("模型输入尺寸为动态, 使用默认 {:?}", DEFAULT_INPUT_SIZE);
        DEFAULT_INPUT_SIZE
      }
    };
    debug!("模型输入尺寸: {}x{}", input_size.0, input_size.1);
    debug!("模型输入数量: {}", session.inputs.len());
    debug!("模型输出数量: {}", session.outputs.len());
    info!("模型加载完成");

    Ok(Self {
      session,
      path: path.to_path_buf(),
      input_size,
      core_mask,
    })
  }

  pub fn core_mask(&self) -> CoreMask {
    self.core_mask
  }
}

impl Engine for OnnxEngine {
  fn input_size(&self) -> (u32, u32) {
    self.input_size
  }

  fn infer(&mut self, input: &NchwFrame) -> Result<RawOutput, EngineError> {
    let tensor = TensorRef::from_array_view(input.tensor())
      .map_err(|e| EngineError::inference(e.to_string()))?;

    debug!("执行模型推理");
    let outputs = self
      .session
      .run(ort::inputs![tensor])
      .map_err(|e| EngineError::inference(e.to_string()))?;

    // 带内置 NMS 的导出模型有两个具名输出
    if let (Some(coordinates), Some(confidence)) =
      (outputs.get(SPLIT_COORDINATES), outputs.get(SPLIT_CONFIDENCE))
    {
      let coordinates = coordinates
        .try_extract_array::<f32>()
        .map_err(|e| EngineError::inference(e.to_string()))?
        .into_owned();
      let confidence = confidence
        .try_extract_array::<f32>()
        .map_err(|e| EngineError::inference(e.to_string()))?
        .into_owned();
      return Ok(RawOutput::Split {
        coordinates,
        confidence,
      });
    }

    let output = outputs[0]
      .try_extract_array::<f32>()
      .map_err(|e| EngineError::inference(e.to_string()))?
      .into_owned();
    debug!("模型输出形状: {:?}", output.shape());

    Ok(RawOutput::Dense(output))
  }

  fn set_core_mask(&mut self, core_mask: CoreMask) -> Result<(), EngineError> {
    if core_mask == self.core_mask {
      return Ok(());
    }
    info!("切换计算单元: {} -> {}", self.core_mask, core_mask);
    self.session = build_session(&self.path, core_mask)?;
    self.core_mask = core_mask;
    Ok(())
  }
}

/// 以 ONNX Runtime 打开模型文件
///
/// 默认从模型读取输入尺寸；`input_size` 可强制指定。
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader {
  input_size: Option<(u32, u32)>,
}

impl OnnxLoader {
  pub fn input_size(mut self, width: u32, height: u32) -> Self {
    self.input_size = Some((width, height));
    self
  }
}

impl EngineLoader for OnnxLoader {
  fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
    let engine = OnnxEngine::open(&spec.path, self.input_size, spec.core_mask)?;
    Ok(Box::new(engine))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn input_size_comes_from_nchw_shape() {
    assert_eq!(input_size_from_dims(&[1, 3, 320, 480]), Some((480, 320)));
    assert_eq!(input_size_from_dims(&[1, 3, -1, -1]), None);
    assert_eq!(input_size_from_dims(&[1, 3, 640]), None);
    assert_eq!(input_size_from_dims(&[1, 3, 0, 640]), None);
  }
}
