// 该文件是 coreml-detect 项目的一部分。
// tests/common/mod.rs - 集成测试使用的脚本化推理后端
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

#![allow(dead_code)]

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use coreml_detect::{
  CoreMask, ModelSpec, ModelVersion, Registry,
  engine::{Engine, EngineError, EngineLoader},
  frame::NchwFrame,
  model::decode::RawOutput,
};
use image::{Rgb, RgbImage};
use ndarray::Array3;
use tempfile::NamedTempFile;

pub const INPUT_SIZE: (u32, u32) = (64, 64);
pub const NUM_CLASSES: usize = 2;

/// 模型输入坐标系下的固定候选框: cx, cy, w, h, class 0, class 1
pub const CANDIDATES: [[f32; 6]; 7] = [
  [16.0, 16.0, 12.0, 12.0, 0.95, 0.01],
  // 与第一个框高度重叠
  [17.0, 16.0, 12.0, 12.0, 0.85, 0.02],
  [48.0, 16.0, 10.0, 10.0, 0.05, 0.72],
  [16.0, 48.0, 14.0, 8.0, 0.55, 0.10],
  [48.0, 48.0, 8.0, 8.0, 0.03, 0.35],
  [40.0, 40.0, 6.0, 6.0, 0.15, 0.00],
  // 左侧越出模型输入
  [2.0, 30.0, 10.0, 10.0, 0.00, 0.92],
];

/// 输入为纯色时没有任何候选框，否则总是返回 [`CANDIDATES`]
pub struct ScriptedEngine {
  core_mask: CoreMask,
  busy: Arc<AtomicBool>,
  overlaps: Arc<AtomicUsize>,
  calls: Arc<AtomicUsize>,
  delay: Duration,
}

impl Engine for ScriptedEngine {
  fn input_size(&self) -> (u32, u32) {
    INPUT_SIZE
  }

  fn infer(&mut self, input: &NchwFrame) -> Result<RawOutput, EngineError> {
    if self.busy.swap(true, Ordering::SeqCst) {
      self.overlaps.fetch_add(1, Ordering::SeqCst);
    }
    self.calls.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      thread::sleep(self.delay);
    }

    let tensor = input.tensor();
    let first = tensor.iter().next().copied().unwrap_or_default();
    let uniform = tensor.iter().all(|v| *v == first);

    // V11 布局: [1, 4 + C, N]
    let mut out = Array3::<f32>::zeros((1, 4 + NUM_CLASSES, CANDIDATES.len()));
    if !uniform {
      for (n, row) in CANDIDATES.iter().enumerate() {
        for (f, value) in row.iter().enumerate() {
          out[[0, f, n]] = *value;
        }
      }
    }

    self.busy.store(false, Ordering::SeqCst);
    Ok(RawOutput::Dense(out.into_dyn()))
  }

  fn set_core_mask(&mut self, core_mask: CoreMask) -> Result<(), EngineError> {
    self.core_mask = core_mask;
    Ok(())
  }
}

/// 模型文件不存在时加载失败
#[derive(Default, Clone)]
pub struct ScriptedLoader {
  pub overlaps: Arc<AtomicUsize>,
  pub calls: Arc<AtomicUsize>,
  pub delay: Duration,
}

impl EngineLoader for ScriptedLoader {
  fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
    if !spec.path.is_file() {
      return Err(EngineError::ModelNotFound(spec.path.clone()));
    }
    Ok(Box::new(ScriptedEngine {
      core_mask: spec.core_mask,
      busy: Arc::new(AtomicBool::new(false)),
      overlaps: self.overlaps.clone(),
      calls: self.calls.clone(),
      delay: self.delay,
    }))
  }
}

pub struct Fixture {
  pub registry: Registry,
  pub loader: ScriptedLoader,
  pub model: NamedTempFile,
}

impl Fixture {
  pub fn new() -> anyhow::Result<Self> {
    Self::with_loader(ScriptedLoader::default())
  }

  pub fn with_loader(loader: ScriptedLoader) -> anyhow::Result<Self> {
    let model = tempfile::Builder::new().suffix(".onnx").tempfile()?;
    Ok(Self {
      registry: Registry::new(Box::new(loader.clone())),
      loader,
      model,
    })
  }

  pub fn model_path(&self) -> String {
    self.model.path().display().to_string()
  }

  pub fn create(&self) -> u64 {
    self.registry.create(
      &self.model_path(),
      NUM_CLASSES as i32,
      ModelVersion::V11.ordinal(),
      CoreMask::All.ordinal(),
    )
  }
}

/// 非纯色的测试图像
pub fn gradient_image(width: u32, height: u32) -> RgbImage {
  RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
}

fn put_varint(mut value: u64, out: &mut Vec<u8>) {
  loop {
    let byte = (value & 0x7f) as u8;
    value >>= 7;
    if value == 0 {
      out.push(byte);
      return;
    }
    out.push(byte | 0x80);
  }
}

fn put_uint(field: u64, value: u64, out: &mut Vec<u8>) {
  put_varint(field << 3, out);
  put_varint(value, out);
}

fn put_bytes(field: u64, bytes: &[u8], out: &mut Vec<u8>) {
  put_varint((field << 3) | 2, out);
  put_varint(bytes.len() as u64, out);
  out.extend_from_slice(bytes);
}

/// 输入维度：固定值或具名的动态维度
pub enum Dim {
  Fixed(u64),
  Named(&'static str),
}

fn value_info(name: &str, dims: &[Dim]) -> Vec<u8> {
  let mut shape = Vec::new();
  for dim in dims {
    let mut d = Vec::new();
    match dim {
      Dim::Fixed(v) => put_uint(1, *v, &mut d),
      Dim::Named(n) => put_bytes(2, n.as_bytes(), &mut d),
    }
    put_bytes(1, &d, &mut shape);
  }
  let mut tensor = Vec::new();
  // elem_type = FLOAT
  put_uint(1, 1, &mut tensor);
  put_bytes(2, &shape, &mut tensor);
  let mut ty = Vec::new();
  put_bytes(1, &tensor, &mut ty);

  let mut info = Vec::new();
  put_bytes(1, name.as_bytes(), &mut info);
  put_bytes(2, &ty, &mut info);
  info
}

/// 单个 Identity 节点的 ONNX 模型，输入形状为 `[1, 3, height, width]`
pub fn identity_model(height: Dim, width: Dim) -> Vec<u8> {
  let dims = [Dim::Fixed(1), Dim::Fixed(3), height, width];

  let mut node = Vec::new();
  put_bytes(1, b"images", &mut node);
  put_bytes(2, b"output0", &mut node);
  put_bytes(4, b"Identity", &mut node);

  let mut graph = Vec::new();
  put_bytes(1, &node, &mut graph);
  put_bytes(2, b"identity", &mut graph);
  put_bytes(11, &value_info("images", &dims), &mut graph);
  put_bytes(12, &value_info("output0", &dims), &mut graph);

  let mut opset = Vec::new();
  put_uint(2, 13, &mut opset);

  let mut model = Vec::new();
  put_uint(1, 8, &mut model);
  put_bytes(7, &graph, &mut model);
  put_bytes(8, &opset, &mut model);
  model
}

/// 把模型写入临时 `.onnx` 文件
pub fn write_model(bytes: &[u8]) -> anyhow::Result<NamedTempFile> {
  let mut file = tempfile::Builder::new().suffix(".onnx").tempfile()?;
  std::io::Write::write_all(&mut file, bytes)?;
  Ok(file)
}
