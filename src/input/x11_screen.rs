// 该文件是 Tuzhi （图志） 项目的一部分。
// src/input/x11_screen.rs - X11 根窗口截屏
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

use image::RgbaImage;
use tracing::{debug, info};
use url::Url;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat, ImageOrder, Window};
use x11rb::rust_connection::RustConnection;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{CaptureError, ScreenCapture},
};

fn display_error<E: std::fmt::Display>(err: E) -> CaptureError {
  CaptureError::Display(err.to_string())
}

/// `screen:` 或 `screen:?display=:1`
pub struct X11ScreenCapture {
  conn: RustConnection,
  root: Window,
  width: u16,
  height: u16,
  bits_per_pixel: u8,
  lsb_first: bool,
}

impl FromUrlWithScheme for X11ScreenCapture {
  const SCHEME: &'static str = "screen";
}

impl FromUrl for X11ScreenCapture {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CaptureError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        found: url.scheme().to_string(),
      });
    }
    let display = url
      .query_pairs()
      .find(|(k, _)| k == "display")
      .map(|(_, v)| v.into_owned());
    Self::connect(display.as_deref())
  }
}

impl X11ScreenCapture {
  pub fn connect(display: Option<&str>) -> Result<Self, CaptureError> {
    let (conn, screen_num) = x11rb::connect(display).map_err(display_error)?;

    let setup = conn.setup();
    let screen = &setup.roots[screen_num];
    let depth = screen.root_depth;
    let bits_per_pixel = setup
      .pixmap_formats
      .iter()
      .find(|f| f.depth == depth)
      .map(|f| f.bits_per_pixel)
      .unwrap_or(0);
    if bits_per_pixel != 32 {
      return Err(CaptureError::PixelFormat {
        depth,
        bits_per_pixel,
      });
    }

    let root = screen.root;
    let width = screen.width_in_pixels;
    let height = screen.height_in_pixels;
    let lsb_first = setup.image_byte_order == ImageOrder::LSB_FIRST;
    info!("连接 X11 屏幕 {}: {}x{}, depth {}", screen_num, width, height, depth);

    Ok(Self {
      conn,
      root,
      width,
      height,
      bits_per_pixel,
      lsb_first,
    })
  }

  pub fn size(&self) -> (u32, u32) {
    (self.width as u32, self.height as u32)
  }
}

/// 32 位 ZPixmap 像素转 RGBA，alpha 固定为 255
fn zpixmap_to_rgba(data: &[u8], width: u32, height: u32, lsb_first: bool) -> Option<RgbaImage> {
  let expected = (width as usize) * (height as usize) * 4;
  if data.len() < expected {
    return None;
  }
  let mut rgba = Vec::with_capacity(expected);
  for px in data[..expected].chunks_exact(4) {
    let (r, g, b) = if lsb_first {
      (px[2], px[1], px[0])
    } else {
      (px[1], px[2], px[3])
    };
    rgba.extend_from_slice(&[r, g, b, 255]);
  }
  RgbaImage::from_raw(width, height, rgba)
}

impl ScreenCapture for X11ScreenCapture {
  fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
    let reply = self
      .conn
      .get_image(
        ImageFormat::Z_PIXMAP,
        self.root,
        0,
        0,
        self.width,
        self.height,
        !0,
      )
      .map_err(display_error)?
      .reply()
      .map_err(display_error)?;

    debug!(
      "截屏 {}x{}, {} 字节, bpp {}",
      self.width,
      self.height,
      reply.data.len(),
      self.bits_per_pixel
    );

    let (width, height) = self.size();
    zpixmap_to_rgba(&reply.data, width, height, self.lsb_first).ok_or(
      CaptureError::PixelFormat {
        depth: reply.depth,
        bits_per_pixel: self.bits_per_pixel,
      },
    )
  }
}
