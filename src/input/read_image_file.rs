// 该文件是 Tuzhi （图志） 项目的一部分。
// src/input/read_image_file.rs - 从磁盘读取截图
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbaImage};
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_file_path,
  input::{CaptureError, ScreenCapture},
};

/// 每次截图都重新读取文件，外部程序可以在两次触发之间替换它
pub struct ImageFileInput {
  path: PathBuf,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        found: url.scheme().to_string(),
      });
    }
    if url.path().is_empty() {
      return Err(CaptureError::EmptyPath);
    }

    Ok(ImageFileInput {
      path: url_file_path(url),
    })
  }
}

impl ImageFileInput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl ScreenCapture for ImageFileInput {
  fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
    let reader = ImageReader::open(&self.path)
      .and_then(|r| r.with_guessed_format())
      .map_err(|source| CaptureError::Open {
        path: self.path.clone(),
        source,
      })?;
    let image = reader.decode().map_err(|source| CaptureError::Decode {
      path: self.path.clone(),
      source,
    })?;
    debug!(
      "读取截图 {}: {}x{}",
      self.path.display(),
      image.width(),
      image.height()
    );
    Ok(image.to_rgba8())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  #[test]
  fn test_capture_rereads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shot.png");
    let mut input = ImageFileInput::new(&path);

    assert!(matches!(input.capture(), Err(CaptureError::Open { .. })));

    RgbaImage::from_pixel(2, 2, Rgba([10, 0, 0, 255]))
      .save(&path)
      .unwrap();
    assert_eq!(input.capture().unwrap().get_pixel(0, 0)[0], 10);

    RgbaImage::from_pixel(2, 2, Rgba([20, 0, 0, 255]))
      .save(&path)
      .unwrap();
    assert_eq!(input.capture().unwrap().get_pixel(0, 0)[0], 20);
  }

  #[test]
  fn test_undecodable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shot.png");
    std::fs::write(&path, b"garbage").unwrap();
    let mut input = ImageFileInput::new(&path);
    assert!(matches!(input.capture(), Err(CaptureError::Decode { .. })));
  }

  #[test]
  fn test_from_url() {
    let url = Url::parse("image:screenshot.png").unwrap();
    let input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.path(), Path::new("screenshot.png"));

    let url = Url::parse("screen:").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(CaptureError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn test_from_url_with_space_and_cjk_dir() {
    let dir = tempfile::tempdir().unwrap();
    let shot_dir = dir.path().join("地图 截图");
    std::fs::create_dir_all(&shot_dir).unwrap();
    let path = shot_dir.join("shot.png");
    RgbaImage::from_pixel(2, 2, Rgba([30, 0, 0, 255]))
      .save(&path)
      .unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.path(), path.as_path());
    assert_eq!(input.capture().unwrap().get_pixel(0, 0)[0], 30);
  }
}
