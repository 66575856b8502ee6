// 该文件是 coreml-detect 项目的一部分。
// src/model/decode.rs - YOLO 原始输出解码
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

use ndarray::{ArrayD, ArrayView2, Axis, Ix2};
use thiserror::Error;
use tracing::{debug, error};

use crate::model::{DetectItem, ModelVersion};

/// 推理后端返回的原始张量
#[derive(Debug, Clone)]
pub enum RawOutput {
  /// 单输出头：`[1, N, F]` 或 `[1, F, N]`
  Dense(ArrayD<f32>),
  /// 已拆分的输出：`coordinates [N, 4]`（相对输入尺寸归一化的 cx, cy, w, h）
  /// 与 `confidence [N, C]`
  Split {
    coordinates: ArrayD<f32>,
    confidence: ArrayD<f32>,
  },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
  #[error("输出形状不匹配: 期望特征维度 {expected}, 实际形状 {shape:?}")]
  ShapeMismatch { expected: usize, shape: Vec<usize> },
  #[error("坐标与置信度数量不一致: {coordinates} != {confidence}")]
  CountMismatch { coordinates: usize, confidence: usize },
}

/// 按模型版本解码原始输出，得到模型输入坐标系下的候选框
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
  version: ModelVersion,
  num_classes: usize,
  input_width: f32,
  input_height: f32,
}

impl Decoder {
  pub fn new(version: ModelVersion, num_classes: usize, input_size: (u32, u32)) -> Self {
    Self {
      version,
      num_classes,
      input_width: input_size.0 as f32,
      input_height: input_size.1 as f32,
    }
  }

  /// 每个候选框的特征数量
  pub fn features(&self) -> usize {
    if self.version.has_objectness() {
      5 + self.num_classes
    } else {
      4 + self.num_classes
    }
  }

  pub fn decode(&self, output: &RawOutput, box_threshold: f32) -> Result<Vec<DetectItem>, DecodeError> {
    let items = match output {
      RawOutput::Dense(tensor) => self.decode_dense(tensor, box_threshold)?,
      RawOutput::Split {
        coordinates,
        confidence,
      } => self.decode_split(coordinates, confidence, box_threshold)?,
    };
    debug!("解码得到 {} 个候选框", items.len());
    Ok(items)
  }

  fn decode_dense(&self, tensor: &ArrayD<f32>, box_threshold: f32) -> Result<Vec<DetectItem>, DecodeError> {
    let features = self.features();
    let view = squeeze_batch(tensor, features)?;
    let (rows, cols) = view.dim();

    // 行为候选框（[N, F]）还是行为特征（[F, N]）
    let anchor_major = match (rows == features, cols == features) {
      (true, true) => self.version.has_objectness(),
      (false, true) => true,
      (true, false) => false,
      (false, false) => {
        error!("输出形状 {:?} 与类别数量 {} 不匹配", tensor.shape(), self.num_classes);
        return Err(DecodeError::ShapeMismatch {
          expected: features,
          shape: tensor.shape().to_vec(),
        });
      }
    };
    let view = if anchor_major { view } else { view.reversed_axes() };
    debug!(
      "解码 {} 输出: {} 个候选, 每个 {} 个特征",
      self.version,
      view.nrows(),
      features
    );

    let class_offset = if self.version.has_objectness() { 5 } else { 4 };
    let mut items = Vec::new();

    for row in view.rows() {
      let Some((class_id, class_score)) = best_class(row.iter().skip(class_offset).copied()) else {
        continue;
      };

      let score = if self.version.has_objectness() {
        row[4] * class_score
      } else {
        class_score
      };
      let Some(score) = accept_score(score, box_threshold) else {
        continue;
      };

      if let Some(bbox) = center_to_corners(row[0], row[1], row[2], row[3]) {
        items.push(DetectItem {
          class_id,
          score,
          bbox,
        });
      }
    }

    Ok(items)
  }

  fn decode_split(
    &self,
    coordinates: &ArrayD<f32>,
    confidence: &ArrayD<f32>,
    box_threshold: f32,
  ) -> Result<Vec<DetectItem>, DecodeError> {
    let coordinates = squeeze_batch(coordinates, 4)?;
    let confidence = squeeze_batch(confidence, self.num_classes)?;

    if coordinates.ncols() != 4 {
      return Err(DecodeError::ShapeMismatch {
        expected: 4,
        shape: coordinates.shape().to_vec(),
      });
    }
    if confidence.ncols() != self.num_classes {
      error!(
        "置信度输出有 {} 个类别, 模型声明 {} 个",
        confidence.ncols(),
        self.num_classes
      );
      return Err(DecodeError::ShapeMismatch {
        expected: self.num_classes,
        shape: confidence.shape().to_vec(),
      });
    }
    if coordinates.nrows() != confidence.nrows() {
      return Err(DecodeError::CountMismatch {
        coordinates: coordinates.nrows(),
        confidence: confidence.nrows(),
      });
    }

    let mut items = Vec::new();
    for (coords, scores) in coordinates.rows().into_iter().zip(confidence.rows()) {
      let Some((class_id, score)) = best_class(scores.iter().copied()) else {
        continue;
      };
      let Some(score) = accept_score(score, box_threshold) else {
        continue;
      };

      let bbox = center_to_corners(
        coords[0] * self.input_width,
        coords[1] * self.input_height,
        coords[2] * self.input_width,
        coords[3] * self.input_height,
      );
      if let Some(bbox) = bbox {
        items.push(DetectItem {
          class_id,
          score,
          bbox,
        });
      }
    }

    Ok(items)
  }
}

/// 去掉批次维度，得到二维视图
fn squeeze_batch(tensor: &ArrayD<f32>, expected: usize) -> Result<ArrayView2<'_, f32>, DecodeError> {
  let mismatch = || DecodeError::ShapeMismatch {
    expected,
    shape: tensor.shape().to_vec(),
  };

  let view = match tensor.ndim() {
    2 => tensor.view(),
    3 if tensor.shape()[0] == 1 => tensor.index_axis(Axis(0), 0),
    _ => return Err(mismatch()),
  };
  view.into_dimensionality::<Ix2>().map_err(|_| mismatch())
}

fn best_class(scores: impl Iterator<Item = f32>) -> Option<(u32, f32)> {
  let mut best: Option<(u32, f32)> = None;
  for (c, score) in scores.enumerate() {
    if score.is_nan() {
      continue;
    }
    if best.is_none_or(|(_, s)| score > s) {
      best = Some((c as u32, score));
    }
  }
  best
}

fn accept_score(score: f32, box_threshold: f32) -> Option<f32> {
  if !score.is_finite() {
    return None;
  }
  let score = score.clamp(0.0, 1.0);
  (score > 0.0 && score >= box_threshold).then_some(score)
}

fn center_to_corners(cx: f32, cy: f32, w: f32, h: f32) -> Option<[f32; 4]> {
  if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) || w <= 0.0 || h <= 0.0 {
    return None;
  }
  Some([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0])
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array2, Array3};

  fn anchor(cx: f32, cy: f32, w: f32, h: f32, tail: &[f32]) -> Vec<f32> {
    let mut row = vec![cx, cy, w, h];
    row.extend_from_slice(tail);
    row
  }

  #[test]
  fn decodes_v8_channel_major() {
    // [1, 4 + 2, 3]
    let anchors = [
      anchor(100.0, 100.0, 20.0, 40.0, &[0.9, 0.1]),
      anchor(300.0, 200.0, 50.0, 50.0, &[0.2, 0.6]),
      anchor(10.0, 10.0, 5.0, 5.0, &[0.05, 0.01]),
    ];
    let mut tensor = Array3::<f32>::zeros((1, 6, 3));
    for (n, row) in anchors.iter().enumerate() {
      for (f, v) in row.iter().enumerate() {
        tensor[[0, f, n]] = *v;
      }
    }

    let decoder = Decoder::new(ModelVersion::V8, 2, (640, 640));
    let items = decoder.decode(&RawOutput::Dense(tensor.into_dyn()), 0.25).unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[0].bbox, [90.0, 80.0, 110.0, 120.0]);
    assert_eq!(items[1].class_id, 1);
    assert!((items[1].score - 0.6).abs() < 1e-6);
  }

  #[test]
  fn decodes_v5_with_objectness() {
    // [1, 2, 5 + 1]
    let mut tensor = Array3::<f32>::zeros((1, 2, 6));
    for (f, v) in anchor(64.0, 64.0, 32.0, 32.0, &[0.8, 0.5]).iter().enumerate() {
      tensor[[0, 0, f]] = *v;
    }
    for (f, v) in anchor(200.0, 64.0, 32.0, 32.0, &[0.3, 0.5]).iter().enumerate() {
      tensor[[0, 1, f]] = *v;
    }

    let decoder = Decoder::new(ModelVersion::V5, 1, (640, 640));
    let items = decoder.decode(&RawOutput::Dense(tensor.into_dyn()), 0.2).unwrap();

    assert_eq!(items.len(), 1);
    assert!((items[0].score - 0.4).abs() < 1e-6);
  }

  #[test]
  fn decodes_transposed_v11() {
    // [1, N, 4 + C]，部分导出工具会转置输出
    let mut tensor = Array3::<f32>::zeros((1, 8, 5));
    for (f, v) in anchor(320.0, 320.0, 64.0, 64.0, &[0.75]).iter().enumerate() {
      tensor[[0, 3, f]] = *v;
    }

    let decoder = Decoder::new(ModelVersion::V11, 1, (640, 640));
    let items = decoder.decode(&RawOutput::Dense(tensor.into_dyn()), 0.5).unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].bbox, [288.0, 288.0, 352.0, 352.0]);
  }

  #[test]
  fn rejects_class_count_mismatch() {
    let tensor = Array3::<f32>::zeros((1, 84, 8400));
    let decoder = Decoder::new(ModelVersion::V8, 1, (640, 640));
    let err = decoder.decode(&RawOutput::Dense(tensor.into_dyn()), 0.5).unwrap_err();
    assert_eq!(
      err,
      DecodeError::ShapeMismatch {
        expected: 5,
        shape: vec![1, 84, 8400]
      }
    );
  }

  #[test]
  fn decodes_split_outputs() {
    let coordinates =
      Array2::from_shape_vec((2, 4), vec![0.5, 0.5, 0.1, 0.2, 0.25, 0.25, 0.1, 0.1]).unwrap();
    let confidence = Array2::from_shape_vec((2, 2), vec![0.1, 0.7, 0.3, f32::NAN]).unwrap();

    let decoder = Decoder::new(ModelVersion::V11, 2, (640, 480));
    let items = decoder
      .decode(
        &RawOutput::Split {
          coordinates: coordinates.into_dyn(),
          confidence: confidence.into_dyn(),
        },
        0.25,
      )
      .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 1);
    assert_eq!(items[0].bbox, [288.0, 192.0, 352.0, 288.0]);
    assert_eq!(items[1].class_id, 0);
  }

  #[test]
  fn skips_degenerate_and_non_finite() {
    let mut tensor = Array3::<f32>::zeros((1, 5, 3));
    let rows = [
      anchor(10.0, 10.0, 0.0, 10.0, &[0.9]),
      anchor(f32::NAN, 10.0, 10.0, 10.0, &[0.9]),
      anchor(10.0, 10.0, 10.0, 10.0, &[1.5]),
    ];
    for (n, row) in rows.iter().enumerate() {
      for (f, v) in row.iter().enumerate() {
        tensor[[0, f, n]] = *v;
      }
    }

    let decoder = Decoder::new(ModelVersion::V8, 1, (640, 640));
    let items = decoder.decode(&RawOutput::Dense(tensor.into_dyn()), 0.0).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].score, 1.0);
  }
}
