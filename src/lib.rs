// 该文件是 coreml-detect 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod detector;
pub mod engine;
pub mod ffi;
pub mod frame;
pub mod input;
#[cfg(feature = "jni")]
pub mod jvm;
pub mod model;
pub mod output;
pub mod registry;
pub mod task;

pub use self::detector::{DetectError, Detector};
pub use self::model::{CoreMask, Detection, ModelSpec, ModelVersion};
pub use self::registry::{FrameStore, Registry, StatusCode};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 解码 URL 路径中的百分号转义
pub(crate) fn decode_url_path(url: &url::Url) -> String {
  let path = url.path();
  match urlencoding::decode(path) {
    Ok(decoded) => decoded.into_owned(),
    Err(_) => path.to_string(),
  }
}
