// 该文件是 Tuzhi （图志） 项目的一部分。
// src/input.rs - 截图来源
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

use std::path::PathBuf;

use image::RgbaImage;
use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme};

mod read_image_file;
pub use self::read_image_file::ImageFileInput;

#[cfg(feature = "x11")]
mod x11_screen;
#[cfg(feature = "x11")]
pub use self::x11_screen::X11ScreenCapture;

/// 每次调用返回一张完整截图
pub trait ScreenCapture {
  fn capture(&mut self) -> Result<RgbaImage, CaptureError>;
}

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch { expected: String, found: String },
  #[error("不支持的截图来源: {0}")]
  UnsupportedScheme(String),
  #[error("截图路径为空")]
  EmptyPath,
  #[error("无法读取截图 {path}: {source}")]
  Open {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法解码截图 {path}: {source}")]
  Decode {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("X11 截屏失败: {0}")]
  Display(String),
  #[error("不支持的屏幕像素格式: depth {depth}, bpp {bits_per_pixel}")]
  PixelFormat { depth: u8, bits_per_pixel: u8 },
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "x11")]
  Screen(X11ScreenCapture),
}

impl FromUrl for InputWrapper {
  type Error = CaptureError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "x11")]
    {
      if url.scheme() == X11ScreenCapture::SCHEME {
        let input = X11ScreenCapture::from_url(url)?;
        return Ok(InputWrapper::Screen(input));
      }
    }
    if url.scheme() == ImageFileInput::SCHEME {
      let input = ImageFileInput::from_url(url)?;
      return Ok(InputWrapper::ReadImageFile(input));
    }
    Err(CaptureError::UnsupportedScheme(url.scheme().to_string()))
  }
}

impl ScreenCapture for InputWrapper {
  fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
    match self {
      InputWrapper::ReadImageFile(input) => input.capture(),
      #[cfg(feature = "x11")]
      InputWrapper::Screen(input) => input.capture(),
    }
  }
}
