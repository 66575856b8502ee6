// 该文件是 coreml-detect 项目的一部分。
// src/registry.rs - 检测器与图像句柄表
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

//! 宿主侧只持有数值句柄。句柄 0 永远不会被分配，作为失败标记；
//! 所有错误都在这里被记录并转换为句柄 0、状态码或空结果，不会越过接口边界。

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::{
    Arc, LazyLock, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicU64, Ordering},
  },
};

use image::RgbImage;
use tracing::{debug, error, warn};

use crate::{
  detector::Detector,
  engine::{EngineLoader, default_loader},
  model::{CoreMask, Detection, ModelSpec, ModelVersion},
};

/// `set_core_mask` 的返回码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
  Ok = 0,
  InvalidHandle = -1,
  InvalidCoreMask = -2,
  EngineFailure = -3,
}

impl From<StatusCode> for i32 {
  fn from(code: StatusCode) -> Self {
    code as i32
  }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
  lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 检测器句柄表
pub struct Registry {
  loader: Box<dyn EngineLoader>,
  detectors: RwLock<HashMap<u64, Arc<Detector>>>,
  next_handle: AtomicU64,
}

impl Default for Registry {
  fn default() -> Self {
    Self::new(default_loader())
  }
}

impl Registry {
  pub fn new(loader: Box<dyn EngineLoader>) -> Self {
    Self {
      loader,
      detectors: RwLock::new(HashMap::new()),
      next_handle: AtomicU64::new(1),
    }
  }

  /// 加载模型并返回句柄，失败返回 0
  pub fn create(&self, model_path: &str, num_classes: i32, model_version: i32, core_mask: i32) -> u64 {
    if model_path.is_empty() {
      error!("模型路径为空");
      return 0;
    }
    let Ok(num_classes) = usize::try_from(num_classes) else {
      error!("类别数量无效: {}", num_classes);
      return 0;
    };
    let Some(version) = ModelVersion::from_ordinal(model_version) else {
      error!("未知的模型版本: {}", model_version);
      return 0;
    };
    let Some(core_mask) = CoreMask::from_ordinal(core_mask) else {
      error!("未知的计算单元: {}", core_mask);
      return 0;
    };

    let spec = ModelSpec {
      path: PathBuf::from(model_path),
      num_classes,
      version,
      core_mask,
    };
    self.create_from_spec(spec)
  }

  pub fn create_from_spec(&self, spec: ModelSpec) -> u64 {
    let path = spec.path.display().to_string();
    match Detector::load(spec, self.loader.as_ref()) {
      Ok(detector) => self.insert(detector),
      Err(e) => {
        error!("创建检测器失败 ({}): {}", path, e);
        0
      }
    }
  }

  /// 登记一个已构造的检测器
  pub fn insert(&self, detector: Detector) -> u64 {
    let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
    write(&self.detectors).insert(handle, Arc::new(detector));
    debug!("分配检测器句柄: {}", handle);
    handle
  }

  pub fn get(&self, handle: u64) -> Option<Arc<Detector>> {
    if handle == 0 {
      return None;
    }
    read(&self.detectors).get(&handle).cloned()
  }

  pub fn set_core_mask(&self, handle: u64, core_mask: i32) -> i32 {
    let Some(detector) = self.get(handle) else {
      warn!("设置计算单元: 无效句柄 {}", handle);
      return StatusCode::InvalidHandle.into();
    };
    let Some(core_mask) = CoreMask::from_ordinal(core_mask) else {
      warn!("设置计算单元: 未知的计算单元 {}", core_mask);
      return StatusCode::InvalidCoreMask.into();
    };

    match detector.set_core_mask(core_mask) {
      Ok(()) => StatusCode::Ok.into(),
      Err(e) => {
        error!("切换计算单元失败 (句柄 {}): {}", handle, e);
        StatusCode::EngineFailure.into()
      }
    }
  }

  /// 在图像上运行检测；任何无效输入都得到空结果
  pub fn detect(&self, handle: u64, image: &RgbImage, nms_threshold: f64, box_threshold: f64) -> Vec<Detection> {
    let Some(detector) = self.get(handle) else {
      warn!("检测: 无效句柄 {}", handle);
      return Vec::new();
    };

    match detector.detect(image, nms_threshold, box_threshold) {
      Ok(detections) => detections,
      Err(e) => {
        warn!("检测失败 (句柄 {}): {}", handle, e);
        Vec::new()
      }
    }
  }

  /// 按图像句柄运行检测
  pub fn detect_frame(
    &self,
    handle: u64,
    frames: &FrameStore,
    image: u64,
    nms_threshold: f64,
    box_threshold: f64,
  ) -> Vec<Detection> {
    let Some(image) = frames.get(image) else {
      warn!("检测: 无效图像句柄 {}", image);
      return Vec::new();
    };
    self.detect(handle, &image, nms_threshold, box_threshold)
  }

  /// 释放句柄；句柄 0、未知句柄和重复释放都是空操作
  pub fn destroy(&self, handle: u64) {
    if handle == 0 {
      debug!("释放句柄 0, 忽略");
      return;
    }
    match write(&self.detectors).remove(&handle) {
      Some(_) => debug!("释放检测器句柄: {}", handle),
      None => warn!("释放未知句柄: {}", handle),
    }
  }

  pub fn len(&self) -> usize {
    read(&self.detectors).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 图像句柄表，对应宿主侧持有的解码图像
#[derive(Default)]
pub struct FrameStore {
  images: RwLock<HashMap<u64, Arc<RgbImage>>>,
  next_handle: AtomicU64,
}

impl FrameStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, image: RgbImage) -> u64 {
    let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
    write(&self.images).insert(handle, Arc::new(image));
    handle
  }

  pub fn get(&self, handle: u64) -> Option<Arc<RgbImage>> {
    if handle == 0 {
      return None;
    }
    read(&self.images).get(&handle).cloned()
  }

  pub fn release(&self, handle: u64) -> bool {
    if handle == 0 {
      return false;
    }
    write(&self.images).remove(&handle).is_some()
  }

  pub fn len(&self) -> usize {
    read(&self.images).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static FRAMES: LazyLock<FrameStore> = LazyLock::new(FrameStore::new);

/// 为进程级句柄表指定推理后端
///
/// 只在第一次使用句柄表之前生效；之后调用返回 `false` 且不改变已有的后端。
pub fn install_loader(loader: Box<dyn EngineLoader>) -> bool {
  let mut installed = false;
  REGISTRY.get_or_init(|| {
    installed = true;
    Registry::new(loader)
  });
  if !installed {
    warn!("句柄表已初始化, 忽略新的推理后端");
  }
  installed
}

/// 进程级检测器句柄表
pub fn registry() -> &'static Registry {
  REGISTRY.get_or_init(Registry::default)
}

/// 进程级图像句柄表
pub fn frames() -> &'static FrameStore {
  &FRAMES
}

pub fn create(model_path: &str, num_classes: i32, model_version: i32, core_mask: i32) -> u64 {
  registry().create(model_path, num_classes, model_version, core_mask)
}

pub fn set_core_mask(handle: u64, core_mask: i32) -> i32 {
  registry().set_core_mask(handle, core_mask)
}

pub fn detect(handle: u64, image: u64, nms_threshold: f64, box_threshold: f64) -> Vec<Detection> {
  registry().detect_frame(handle, frames(), image, nms_threshold, box_threshold)
}

pub fn destroy(handle: u64) {
  registry().destroy(handle)
}

pub fn register_image(image: RgbImage) -> u64 {
  frames().register(image)
}

pub fn release_image(handle: u64) -> bool {
  frames().release(handle)
}
