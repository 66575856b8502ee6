// 该文件是 coreml-detect 项目的一部分。
// src/detector.rs - 目标检测器
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

use std::sync::{Mutex, MutexGuard, PoisonError};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  engine::{Engine, EngineError, EngineLoader},
  frame::{FrameError, NchwFrame},
  model::{
    CoreMask, Detection, ModelSpec,
    decode::{DecodeError, Decoder},
    nms::non_max_suppression,
  },
};

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("阈值无效: {name} = {value}")]
  InvalidThreshold { name: &'static str, value: f64 },
  #[error("类别数量无效: {0}")]
  InvalidClassCount(usize),
  #[error("预处理错误: {0}")]
  Frame(#[from] FrameError),
  #[error("推理后端错误: {0}")]
  Engine(#[from] EngineError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
}

/// 阈值必须是 [0, 1] 内的有限值
fn validate_threshold(name: &'static str, value: f64) -> Result<f32, DetectError> {
  if value.is_finite() && (0.0..=1.0).contains(&value) {
    Ok(value as f32)
  } else {
    Err(DetectError::InvalidThreshold { name, value })
  }
}

struct EngineSlot {
  engine: Box<dyn Engine>,
  core_mask: CoreMask,
}

/// 一个已加载的模型及其配置
///
/// 推理调用在内部互斥锁下串行执行，预处理和后处理在锁外进行，
/// 因此同一个检测器可以被多个线程共享。
pub struct Detector {
  spec: ModelSpec,
  decoder: Decoder,
  input_size: (u32, u32),
  slot: Mutex<EngineSlot>,
}

impl Detector {
  pub fn new(spec: ModelSpec, engine: Box<dyn Engine>) -> Result<Self, DetectError> {
    if spec.num_classes == 0 {
      return Err(DetectError::InvalidClassCount(spec.num_classes));
    }

    let input_size = engine.input_size();
    if input_size.0 == 0 || input_size.1 == 0 {
      return Err(FrameError::InvalidInputSize(input_size.0, input_size.1).into());
    }

    let decoder = Decoder::new(spec.version, spec.num_classes, input_size);
    info!(
      "检测器就绪: {} 类, 模型版本 {}, 输入 {}x{}, 计算单元 {}",
      spec.num_classes, spec.version, input_size.0, input_size.1, spec.core_mask
    );

    Ok(Self {
      slot: Mutex::new(EngineSlot {
        engine,
        core_mask: spec.core_mask,
      }),
      spec,
      decoder,
      input_size,
    })
  }

  pub fn load(spec: ModelSpec, loader: &dyn EngineLoader) -> Result<Self, DetectError> {
    if spec.num_classes == 0 {
      return Err(DetectError::InvalidClassCount(spec.num_classes));
    }
    let engine = loader.load(&spec)?;
    Self::new(spec, engine)
  }

  pub fn spec(&self) -> &ModelSpec {
    &self.spec
  }

  pub fn input_size(&self) -> (u32, u32) {
    self.input_size
  }

  pub fn core_mask(&self) -> CoreMask {
    self.lock().core_mask
  }

  fn lock(&self) -> MutexGuard<'_, EngineSlot> {
    self.slot.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
      warn!("推理锁已中毒, 继续使用原推理实例");
      poisoned.into_inner()
    })
  }

  /// 切换计算单元，失败时保持原配置
  pub fn set_core_mask(&self, core_mask: CoreMask) -> Result<(), EngineError> {
    let mut slot = self.lock();
    slot.engine.set_core_mask(core_mask)?;
    slot.core_mask = core_mask;
    Ok(())
  }

  /// 运行一次完整检测，返回原图像素坐标下的结果
  pub fn detect(
    &self,
    image: &RgbImage,
    nms_threshold: f64,
    box_threshold: f64,
  ) -> Result<Vec<Detection>, DetectError> {
    let nms_threshold = validate_threshold("nms_threshold", nms_threshold)?;
    let box_threshold = validate_threshold("box_threshold", box_threshold)?;

    let frame = NchwFrame::from_image(image, self.input_size)?;

    let output = {
      let mut slot = self.lock();
      slot.engine.infer(&frame)?
    };

    let candidates = self.decoder.decode(&output, box_threshold)?;
    let kept = non_max_suppression(candidates, nms_threshold);

    let letterbox = frame.letterbox();
    let detections: Vec<Detection> = kept
      .into_iter()
      .filter_map(|item| {
        let [x_min, y_min, x_max, y_max] = letterbox.to_source(item.bbox);
        let det = Detection {
          left: x_min.round() as i32,
          top: y_min.round() as i32,
          right: x_max.round() as i32,
          bottom: y_max.round() as i32,
          confidence: item.score,
          class_id: item.class_id as i32,
        };
        (det.width() > 0 && det.height() > 0).then_some(det)
      })
      .collect();

    debug!("检测到 {} 个物体", detections.len());
    Ok(detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn thresholds_must_be_unit_interval() {
    assert_eq!(validate_threshold("t", 0.0).unwrap(), 0.0);
    assert_eq!(validate_threshold("t", 1.0).unwrap(), 1.0);
    for bad in [-1.0, -0.0001, 1.5, f64::NAN, f64::INFINITY] {
      assert!(matches!(
        validate_threshold("t", bad),
        Err(DetectError::InvalidThreshold { name: "t", .. })
      ));
    }
  }
}
