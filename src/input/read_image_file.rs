// 该文件是 coreml-detect 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decode_url_path};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("目录中没有图像文件: {0}")]
  NoImages(PathBuf),
}

/// 从单个图像文件或目录中读取图像
///
/// `image:///path/to/coral.jpeg` 读取一个文件；路径为目录时按文件名顺序读取其中的图像。
pub struct ImageFileInput {
  paths: std::vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(url.scheme().to_string()));
    }

    Self::open(decode_url_path(url))
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let paths = if path.is_dir() {
      let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image_file(p))
        .collect();
      paths.sort();
      if paths.is_empty() {
        return Err(ImageFileInputError::NoImages(path.to_path_buf()));
      }
      paths
    } else {
      if !path.is_file() {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string()).into());
      }
      vec![path.to_path_buf()]
    };

    debug!("图像输入: {} 个文件", paths.len());
    Ok(Self {
      paths: paths.into_iter(),
    })
  }

  /// 读取下一幅图像，统一转为 RGB8
  pub fn read(path: &Path) -> Result<RgbImage, ImageFileInputError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.to_rgb8())
  }
}

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

impl Iterator for ImageFileInput {
  type Item = Result<(PathBuf, RgbImage), ImageFileInputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.paths.next()?;
    Some(Self::read(&path).map(|image| (path, image)))
  }
}
