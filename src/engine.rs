// 该文件是 coreml-detect 项目的一部分。
// src/engine.rs - 推理后端抽象
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

use std::path::PathBuf;

use thiserror::Error;

use crate::{
  frame::NchwFrame,
  model::{CoreMask, ModelSpec, decode::RawOutput},
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理错误: {0}")]
  InferenceError(String),
  #[error("不支持的计算单元: {0}")]
  UnsupportedCoreMask(CoreMask),
  #[error("没有可用的推理后端")]
  NoBackend,
}

impl EngineError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    EngineError::ModelInvalid(msg.into())
  }

  pub fn inference(msg: impl Into<String>) -> Self {
    EngineError::InferenceError(msg.into())
  }
}

/// 已加载的模型实例
///
/// 实现只需保证 `Send`；同一实例上的调用由 [`crate::Detector`] 串行化。
pub trait Engine: Send {
  /// 模型输入尺寸（宽, 高）
  fn input_size(&self) -> (u32, u32);

  fn infer(&mut self, input: &NchwFrame) -> Result<RawOutput, EngineError>;

  /// 切换计算单元；失败时实例必须保持原配置可用
  fn set_core_mask(&mut self, core_mask: CoreMask) -> Result<(), EngineError>;
}

/// 根据模型描述创建 [`Engine`]
pub trait EngineLoader: Send + Sync {
  fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError>;
}

impl<F> EngineLoader for F
where
  F: Fn(&ModelSpec) -> Result<Box<dyn Engine>, EngineError> + Send + Sync,
{
  fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
    self(spec)
  }
}

/// 未启用任何后端时使用，所有加载请求都会失败
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackendLoader;

impl EngineLoader for NoBackendLoader {
  fn load(&self, _spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
    Err(EngineError::NoBackend)
  }
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxEngine, OnnxLoader};

/// 编译时启用的默认加载器
pub fn default_loader() -> Box<dyn EngineLoader> {
  #[cfg(feature = "onnx")]
  {
    Box::new(OnnxLoader::default())
  }
  #[cfg(not(feature = "onnx"))]
  {
    Box::new(NoBackendLoader)
  }
}
