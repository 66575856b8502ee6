// 该文件是 coreml-detect 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use crate::model::DetectItem;

/// 计算两个边界框的 IoU
pub fn iou(a: &DetectItem, b: &DetectItem) -> f32 {
  let x1 = a.bbox[0].max(b.bbox[0]);
  let y1 = a.bbox[1].max(b.bbox[1]);
  let x2 = a.bbox[2].min(b.bbox[2]);
  let y2 = a.bbox[3].min(b.bbox[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.area() + b.area() - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别进行贪心非极大值抑制
///
/// 候选框按置信度降序处理；与已保留的同类框 IoU 大于 `iou_threshold` 的框被丢弃。
/// 置信度相同时保持输入顺序，保证结果可复现。
pub fn non_max_suppression(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

  let mut keep: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = keep
      .iter()
      .any(|k| k.class_id == item.class_id && iou(k, &item) > iou_threshold);
    if !suppressed {
      keep.push(item);
    }
  }
  keep
}
