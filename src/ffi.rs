// 该文件是 coreml-detect 项目的一部分。
// src/ffi.rs - C 接口
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

//! 基于进程级句柄表的 C 接口。
//!
//! ```c
//! uint64_t det = coreml_create("/models/coral.onnx", 1, 2, 2);
//! uint64_t img = coreml_image_new(width, height, rgb, width * height * 3);
//! CoreMLDetection out[16];
//! intptr_t n = coreml_detect(det, img, 0.45, 0.25, out, 16);
//! coreml_image_free(img);
//! coreml_destroy(det);
//! ```

use std::{
  ffi::CStr,
  os::raw::{c_char, c_double, c_float, c_int},
  panic::{AssertUnwindSafe, catch_unwind},
  slice,
};

use image::RgbImage;
use tracing::error;

use crate::{model::Detection, registry};

/// C 侧的检测结果
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreMLDetection {
  pub left: c_int,
  pub top: c_int,
  pub right: c_int,
  pub bottom: c_int,
  pub confidence: c_float,
  pub class_id: c_int,
}

impl From<&Detection> for CoreMLDetection {
  fn from(d: &Detection) -> Self {
    Self {
      left: d.left,
      top: d.top,
      right: d.right,
      bottom: d.bottom,
      confidence: d.confidence,
      class_id: d.class_id,
    }
  }
}

/// panic 不能越过 C 边界
pub(crate) fn guard<T>(name: &str, fallback: T, f: impl FnOnce() -> T) -> T {
  match catch_unwind(AssertUnwindSafe(f)) {
    Ok(value) => value,
    Err(_) => {
      error!("{} 发生 panic", name);
      fallback
    }
  }
}

/// 创建检测器，失败返回 0
///
/// # Safety
///
/// `model_path` 必须为 NULL 或指向以 NUL 结尾的字符串。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn coreml_create(
  model_path: *const c_char,
  num_classes: c_int,
  model_version: c_int,
  core_mask: c_int,
) -> u64 {
  if model_path.is_null() {
    error!("模型路径为 NULL");
    return 0;
  }
  let path = match unsafe { CStr::from_ptr(model_path) }.to_str() {
    Ok(s) => s.to_string(),
    Err(_) => {
      error!("模型路径不是有效的 UTF-8");
      return 0;
    }
  };

  guard("coreml_create", 0, || {
    registry::create(&path, num_classes, model_version, core_mask)
  })
}

/// 切换计算单元，返回 0 表示成功
#[unsafe(no_mangle)]
pub extern "C" fn coreml_set_core_mask(handle: u64, core_mask: c_int) -> c_int {
  guard("coreml_set_core_mask", registry::StatusCode::EngineFailure.into(), || {
    registry::set_core_mask(handle, core_mask)
  })
}

/// 运行检测，最多写入 `capacity` 个结果，返回结果总数
///
/// 返回值可能大于 `capacity`，此时调用方可用更大的缓冲区重试。
/// `capacity` 非零而 `out` 为 NULL 时返回 -1。
///
/// # Safety
///
/// `out` 必须为 NULL 或指向至少 `capacity` 个 `CoreMLDetection` 的可写内存。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn coreml_detect(
  handle: u64,
  image: u64,
  nms_threshold: c_double,
  box_threshold: c_double,
  out: *mut CoreMLDetection,
  capacity: usize,
) -> isize {
  if out.is_null() && capacity > 0 {
    error!("输出缓冲区为 NULL");
    return -1;
  }

  let detections = guard("coreml_detect", Vec::new(), || {
    registry::detect(handle, image, nms_threshold, box_threshold)
  });

  let written = detections.len().min(capacity);
  if written > 0 {
    let out = unsafe { slice::from_raw_parts_mut(out, written) };
    for (dst, src) in out.iter_mut().zip(&detections) {
      *dst = CoreMLDetection::from(src);
    }
  }
  detections.len() as isize
}

/// 释放检测器；句柄 0 与重复释放是安全的
#[unsafe(no_mangle)]
pub extern "C" fn coreml_destroy(handle: u64) {
  guard("coreml_destroy", (), || registry::destroy(handle))
}

/// 复制一幅紧密排列的 RGB8 图像并返回图像句柄，失败返回 0
///
/// # Safety
///
/// `data` 必须为 NULL 或指向至少 `len` 字节的可读内存。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn coreml_image_new(width: u32, height: u32, data: *const u8, len: usize) -> u64 {
  if data.is_null() {
    error!("图像数据为 NULL");
    return 0;
  }
  let Some(expected) = (width as usize)
    .checked_mul(height as usize)
    .and_then(|n| n.checked_mul(3))
  else {
    error!("图像尺寸溢出: {}x{}", width, height);
    return 0;
  };
  if len != expected {
    error!("图像数据长度不匹配: 期望 {}, 实际 {}", expected, len);
    return 0;
  }

  guard("coreml_image_new", 0, || {
    let bytes = unsafe { slice::from_raw_parts(data, len) }.to_vec();
    match RgbImage::from_raw(width, height, bytes) {
      Some(image) => registry::register_image(image),
      None => 0,
    }
  })
}

/// 释放图像句柄
#[unsafe(no_mangle)]
pub extern "C" fn coreml_image_free(image: u64) {
  guard("coreml_image_free", (), || {
    registry::release_image(image);
  })
}
