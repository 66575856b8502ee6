// 该文件是 coreml-detect 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
  rect::Rect,
};

use crate::model::Detection;

const PALETTE_SIZE: usize = 20;
const SCORE_BAR_HEIGHT: u32 = 4;

/// 在图像上绘制边框与置信度条
pub struct Draw {
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();
    Self { colors }
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

impl Draw {
  pub fn color_of(&self, class_id: i32) -> Rgb<u8> {
    self.colors[class_id.unsigned_abs() as usize % self.colors.len()]
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
      if det.width() <= 0 || det.height() <= 0 {
        continue;
      }
      let color = self.color_of(det.class_id);
      let rect = Rect::at(det.left, det.top).of_size(det.width() as u32, det.height() as u32);
      draw_hollow_rect_mut(image, rect, color);

      // 加粗一层
      if det.width() > 2 && det.height() > 2 {
        let inner = Rect::at(det.left + 1, det.top + 1)
          .of_size(det.width() as u32 - 2, det.height() as u32 - 2);
        draw_hollow_rect_mut(image, inner, color);
      }

      // 边框上方的置信度条，长度与置信度成比例
      let bar_width = ((det.width() as f32) * det.confidence.clamp(0.0, 1.0)).round() as u32;
      if bar_width > 0 {
        let bar_y = (det.top - SCORE_BAR_HEIGHT as i32).max(0);
        let bar = Rect::at(det.left, bar_y).of_size(bar_width, SCORE_BAR_HEIGHT);
        draw_filled_rect_mut(image, bar, color);
      }
    }
  }

  pub fn draw_detection(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut image = image.clone();
    self.draw_detections(&mut image, detections);
    image
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn draws_box_outline_only() {
    let image = RgbImage::new(32, 32);
    let det = Detection {
      left: 8,
      top: 8,
      right: 24,
      bottom: 24,
      confidence: 0.5,
      class_id: 0,
    };
    let draw = Draw::default();
    let out = draw.draw_detection(&image, &[det]);

    let color = draw.color_of(0);
    assert_eq!(*out.get_pixel(8, 16), color);
    assert_eq!(*out.get_pixel(16, 16), Rgb([0, 0, 0]));
    // 置信度条在框的上方
    assert_eq!(*out.get_pixel(9, 5), color);
    assert_eq!(*out.get_pixel(20, 5), Rgb([0, 0, 0]));
  }
}
