// 该文件是 coreml-detect 项目的一部分。
// src/frame.rs - 模型输入帧与 letterbox 预处理
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

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use thiserror::Error;
use tracing::debug;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("图像为空: {0}x{1}")]
  EmptyImage(u32, u32),
  #[error("模型输入尺寸无效: {0}x{1}")]
  InvalidInputSize(u32, u32),
}

/// 等比缩放并居中填充时使用的几何参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub source_width: u32,
  pub source_height: u32,
}

impl Letterbox {
  pub fn new(source: (u32, u32), target: (u32, u32)) -> Self {
    let (src_w, src_h) = source;
    let (dst_w, dst_h) = target;
    let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);

    let resized_width = ((src_w as f32 * scale).round() as u32).clamp(1, dst_w);
    let resized_height = ((src_h as f32 * scale).round() as u32).clamp(1, dst_h);

    Self {
      scale,
      pad_x: ((dst_w - resized_width) / 2) as f32,
      pad_y: ((dst_h - resized_height) / 2) as f32,
      resized_width,
      resized_height,
      source_width: src_w,
      source_height: src_h,
    }
  }

  /// 将模型输入坐标系下的框映射回原图，并裁剪到图像范围内
  pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
    let w = self.source_width as f32;
    let h = self.source_height as f32;
    [
      ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, w),
      ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, h),
      ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, w),
      ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, h),
    ]
  }
}

/// NCHW 布局、取值 [0, 1] 的 RGB 浮点输入帧
#[derive(Debug, Clone)]
pub struct NchwFrame {
  data: Array4<f32>,
  letterbox: Letterbox,
}

impl NchwFrame {
  /// 将图像 letterbox 到 `input_size`（宽, 高），填充区域为黑色
  pub fn from_image(image: &RgbImage, input_size: (u32, u32)) -> Result<Self, FrameError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(FrameError::EmptyImage(width, height));
    }
    let (input_w, input_h) = input_size;
    if input_w == 0 || input_h == 0 {
      return Err(FrameError::InvalidInputSize(input_w, input_h));
    }

    let letterbox = Letterbox::new((width, height), input_size);
    debug!(
      "预处理: {}x{} -> {}x{}, 缩放 {:.4}, 填充 ({}, {})",
      width,
      height,
      letterbox.resized_width,
      letterbox.resized_height,
      letterbox.scale,
      letterbox.pad_x,
      letterbox.pad_y
    );

    let resized = if (letterbox.resized_width, letterbox.resized_height) == (width, height) {
      image.clone()
    } else {
      image::imageops::resize(
        image,
        letterbox.resized_width,
        letterbox.resized_height,
        FilterType::Triangle,
      )
    };

    let mut data = Array4::<f32>::zeros((1, RGB_CHANNELS, input_h as usize, input_w as usize));
    let pad_x = letterbox.pad_x as usize;
    let pad_y = letterbox.pad_y as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
      let (row, col) = (pad_y + y as usize, pad_x + x as usize);
      for c in 0..RGB_CHANNELS {
        data[[0, c, row, col]] = pixel[c] as f32 / 255.0;
      }
    }

    Ok(Self { data, letterbox })
  }

  pub fn tensor(&self) -> &Array4<f32> {
    &self.data
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn width(&self) -> usize {
    self.data.shape()[3]
  }

  pub fn height(&self) -> usize {
    self.data.shape()[2]
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}
