// 该文件是 Tuzhi （图志） 项目的一部分。
// src/overlay/x11.rs - X11 叠加窗口
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

//! 32 位 ARGB 无边框置顶窗口，鼠标穿透。透明需要合成器支持。

use image::RgbaImage;
use tracing::{debug, info, warn};
use x11rb::atom_manager;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::shape::{self, ConnectionExt as _};
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::overlay::{OverlaySurface, PlatformError, SurfaceConfig};

atom_manager! {
  pub AtomCollection: AtomCollectionCookie {
    _NET_WM_WINDOW_TYPE,
    _NET_WM_WINDOW_TYPE_DOCK,
    _NET_WM_STATE,
    _NET_WM_STATE_ABOVE,
    _NET_WM_STATE_SKIP_TASKBAR,
    _NET_WM_STATE_SKIP_PAGER,
    _NET_WM_WINDOW_OPACITY,
    ATOM,
    CARDINAL,
  }
}

fn other<E: std::fmt::Display>(err: E) -> PlatformError {
  PlatformError::Other(err.to_string())
}

/// PutImage 请求头长度
const PUT_IMAGE_HEADER_BYTES: usize = 24;

/// RGBA 转预乘 BGRA；键色像素 alpha 置 0
fn to_bgra_keyed(image: &RgbaImage, key: [u8; 3]) -> Vec<u8> {
  let mut data = Vec::with_capacity(image.as_raw().len());
  for px in image.pixels() {
    let [r, g, b, a] = px.0;
    if [r, g, b] == key {
      data.extend_from_slice(&[0, 0, 0, 0]);
      continue;
    }
    let premul = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
    data.extend_from_slice(&[premul(b), premul(g), premul(r), a]);
  }
  data
}

/// 每个 PutImage 请求最多能带的行数
fn rows_per_request(max_request_bytes: usize, width: u32) -> u32 {
  let row_bytes = (width as usize * 4).max(1);
  let rows = max_request_bytes.saturating_sub(PUT_IMAGE_HEADER_BYTES) / row_bytes;
  rows.max(1) as u32
}

pub struct X11Overlay {
  conn: RustConnection,
  window: Window,
  gc: Gcontext,
  atoms: AtomCollection,
  depth: u8,
  width: u32,
  height: u32,
  key_color: [u8; 3],
  // 最近一帧 BGRA，Expose 时重绘
  frame: Vec<u8>,
  running: bool,
}

impl X11Overlay {
  fn find_argb_visual(screen: &Screen) -> Option<(Visualid, u8)> {
    for depth in &screen.allowed_depths {
      if depth.depth == 32 {
        for visual in &depth.visuals {
          if visual.class == VisualClass::TRUE_COLOR {
            return Some((visual.visual_id, depth.depth));
          }
        }
      }
    }
    None
  }

  pub fn new(config: SurfaceConfig) -> Result<Self, PlatformError> {
    let (conn, screen_num) =
      x11rb::connect(None).map_err(|e| PlatformError::ConnectionFailed(e.to_string()))?;

    let atoms = AtomCollection::new(&conn)
      .map_err(other)?
      .reply()
      .map_err(other)?;

    let setup = conn.setup();
    let screen = &setup.roots[screen_num];
    let root = screen.root;

    conn
      .shape_query_version()
      .map_err(|_| PlatformError::UnsupportedFeature("Shape 扩展".into()))?
      .reply()
      .map_err(|_| PlatformError::UnsupportedFeature("Shape 扩展".into()))?;

    let (visual, depth) = Self::find_argb_visual(screen)
      .ok_or_else(|| PlatformError::UnsupportedFeature("32 位 ARGB visual".into()))?;

    let colormap = conn.generate_id().map_err(other)?;
    conn
      .create_colormap(ColormapAlloc::NONE, colormap, root, visual)
      .map_err(other)?;

    let window = conn.generate_id().map_err(other)?;
    let win_aux = CreateWindowAux::new()
      .background_pixel(0)
      .border_pixel(0)
      .colormap(colormap)
      .event_mask(EventMask::EXPOSURE | EventMask::STRUCTURE_NOTIFY)
      .override_redirect(1);

    conn
      .create_window(
        depth,
        window,
        root,
        config.x as i16,
        config.y as i16,
        config.width as u16,
        config.height as u16,
        0,
        WindowClass::INPUT_OUTPUT,
        visual,
        &win_aux,
      )
      .map_err(other)?;

    let gc = conn.generate_id().map_err(other)?;
    conn
      .create_gc(gc, window, &CreateGCAux::new())
      .map_err(other)?;

    let overlay = Self {
      conn,
      window,
      gc,
      atoms,
      depth,
      width: config.width,
      height: config.height,
      key_color: config.key_color,
      frame: vec![0u8; (config.width * config.height * 4) as usize],
      running: true,
    };

    overlay.setup_window_hints()?;
    overlay.set_click_through()?;

    overlay.conn.map_window(window).map_err(other)?;
    overlay.conn.flush().map_err(other)?;

    info!(
      "叠加窗口已创建: ({}, {}) {}x{}",
      config.x, config.y, config.width, config.height
    );
    Ok(overlay)
  }

  fn setup_window_hints(&self) -> Result<(), PlatformError> {
    self
      .conn
      .change_property32(
        PropMode::REPLACE,
        self.window,
        self.atoms._NET_WM_WINDOW_TYPE,
        self.atoms.ATOM,
        &[self.atoms._NET_WM_WINDOW_TYPE_DOCK],
      )
      .map_err(other)?;

    self
      .conn
      .change_property32(
        PropMode::REPLACE,
        self.window,
        self.atoms._NET_WM_STATE,
        self.atoms.ATOM,
        &[
          self.atoms._NET_WM_STATE_ABOVE,
          self.atoms._NET_WM_STATE_SKIP_TASKBAR,
          self.atoms._NET_WM_STATE_SKIP_PAGER,
        ],
      )
      .map_err(other)?;

    Ok(())
  }

  /// 空输入区域，点击穿透到游戏
  fn set_click_through(&self) -> Result<(), PlatformError> {
    self
      .conn
      .shape_rectangles(
        shape::SO::SET,
        shape::SK::INPUT,
        ClipOrdering::UNSORTED,
        self.window,
        0,
        0,
        &[],
      )
      .map_err(other)?;
    Ok(())
  }

  fn resize(&mut self, width: u32, height: u32) -> Result<(), PlatformError> {
    warn!(
      "叠加图尺寸 {}x{} 与窗口 {}x{} 不一致，调整窗口",
      width, height, self.width, self.height
    );
    self
      .conn
      .configure_window(
        self.window,
        &ConfigureWindowAux::new().width(width).height(height),
      )
      .map_err(other)?;
    self.width = width;
    self.height = height;
    Ok(())
  }

  fn redraw(&self) -> Result<(), PlatformError> {
    if self.width == 0 || self.height == 0 {
      return Ok(());
    }
    let rows = rows_per_request(self.conn.maximum_request_bytes(), self.width);
    let row_bytes = self.width as usize * 4;

    let mut y = 0;
    while y < self.height {
      let band = rows.min(self.height - y);
      let start = y as usize * row_bytes;
      let end = start + band as usize * row_bytes;
      self
        .conn
        .put_image(
          ImageFormat::Z_PIXMAP,
          self.window,
          self.gc,
          self.width as u16,
          band as u16,
          0,
          y as i16,
          0,
          self.depth,
          &self.frame[start..end],
        )
        .map_err(other)?;
      y += band;
    }
    self.conn.flush().map_err(other)?;
    Ok(())
  }
}

impl OverlaySurface for X11Overlay {
  fn show_image(&mut self, image: &RgbaImage) -> Result<(), PlatformError> {
    if image.dimensions() != (self.width, self.height) {
      self.resize(image.width(), image.height())?;
    }
    self.frame = to_bgra_keyed(image, self.key_color);
    self.redraw()
  }

  fn set_opacity(&mut self, opacity: f32) -> Result<(), PlatformError> {
    let value = (opacity.clamp(0.0, 1.0) as f64 * u32::MAX as f64).round() as u32;
    self
      .conn
      .change_property32(
        PropMode::REPLACE,
        self.window,
        self.atoms._NET_WM_WINDOW_OPACITY,
        self.atoms.CARDINAL,
        &[value],
      )
      .map_err(other)?;
    self.conn.flush().map_err(other)?;
    debug!("窗口不透明度: {:#010x}", value);
    Ok(())
  }

  fn poll_events(&mut self) -> bool {
    loop {
      match self.conn.poll_for_event() {
        Ok(Some(x11rb::protocol::Event::Expose(e))) if e.count == 0 => {
          if let Err(e) = self.redraw() {
            warn!("重绘叠加窗口失败: {}", e);
          }
        }
        Ok(Some(x11rb::protocol::Event::DestroyNotify(e))) if e.window == self.window => {
          self.running = false;
        }
        Ok(Some(_)) => {}
        Ok(None) => break,
        Err(e) => {
          warn!("X11 连接中断: {}", e);
          self.running = false;
          break;
        }
      }
    }
    self.running
  }
}

impl Drop for X11Overlay {
  fn drop(&mut self) {
    let _ = self.conn.destroy_window(self.window);
    let _ = self.conn.free_gc(self.gc);
    let _ = self.conn.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  #[test]
  fn test_key_color_becomes_transparent() {
    let image = RgbaImage::from_fn(2, 1, |x, _| {
      if x == 0 {
        Rgba([0, 255, 0, 255])
      } else {
        Rgba([10, 20, 30, 255])
      }
    });
    let data = to_bgra_keyed(&image, [0, 255, 0]);
    assert_eq!(data, vec![0, 0, 0, 0, 30, 20, 10, 255]);
  }

  #[test]
  fn test_rows_per_request() {
    assert_eq!(rows_per_request(24 + 4 * 100 * 10, 100), 10);
    assert_eq!(rows_per_request(16, 100), 1);
  }
}
