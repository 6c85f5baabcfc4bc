// 该文件是 Tuzhi （图志） 项目的一部分。
// src/overlay.rs - 实时叠加窗口的状态机
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

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage, imageops};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  grid::MapGrid,
  input::{CaptureError, ScreenCapture},
  output::{OverlayImage, Render},
  pipeline::PredictionGrid,
};

#[cfg(feature = "x11")]
pub mod x11;

/// 默认刷新间隔
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum PlatformError {
  #[error("无法连接显示服务器: {0}")]
  ConnectionFailed(String),
  #[error("显示服务器缺少功能: {0}")]
  UnsupportedFeature(String),
  #[error("窗口系统错误: {0}")]
  Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
  Visible,
  Hidden,
  /// 终止状态，`run` 在此返回
  Closed,
}

/// 按键线程、工作线程与渲染循环之间共享的标志
#[derive(Debug, Clone)]
pub struct PresenterControl {
  visible: Arc<AtomicBool>,
  close_requested: Arc<AtomicBool>,
  capturing: Arc<AtomicBool>,
  cleared: Arc<AtomicBool>,
}

impl Default for PresenterControl {
  fn default() -> Self {
    Self::new()
  }
}

impl PresenterControl {
  pub fn new() -> Self {
    Self {
      visible: Arc::new(AtomicBool::new(true)),
      close_requested: Arc::new(AtomicBool::new(false)),
      capturing: Arc::new(AtomicBool::new(false)),
      cleared: Arc::new(AtomicBool::new(false)),
    }
  }

  /// 返回切换后的可见性
  pub fn toggle_visibility(&self) -> bool {
    !self.visible.fetch_xor(true, Ordering::AcqRel)
  }

  pub fn is_visible(&self) -> bool {
    self.visible.load(Ordering::Acquire)
  }

  pub fn request_close(&self) {
    self.close_requested.store(true, Ordering::Release);
  }

  pub fn is_close_requested(&self) -> bool {
    self.close_requested.load(Ordering::Acquire)
  }

  /// 截图期间窗口保持全透明，守卫丢弃后恢复
  pub fn begin_capture(&self) -> CaptureGuard {
    self.cleared.store(false, Ordering::Release);
    self.capturing.store(true, Ordering::Release);
    CaptureGuard {
      control: self.clone(),
    }
  }

  pub fn is_capturing(&self) -> bool {
    self.capturing.load(Ordering::Acquire)
  }

  /// 渲染循环已把窗口设为全透明
  pub fn is_cleared_for_capture(&self) -> bool {
    self.cleared.load(Ordering::Acquire)
  }

  fn end_capture(&self) {
    self.capturing.store(false, Ordering::Release);
    self.cleared.store(false, Ordering::Release);
  }
}

#[derive(Debug)]
pub struct CaptureGuard {
  control: PresenterControl,
}

impl Drop for CaptureGuard {
  fn drop(&mut self) {
    self.control.end_capture();
  }
}

/// 截图前隐藏叠加窗口，避免上一轮的图标进入本轮截图
pub struct HideOverlayCapture<C> {
  inner: C,
  control: PresenterControl,
  settle: Duration,
  timeout: Duration,
}

impl<C> HideOverlayCapture<C> {
  /// `refresh` 为渲染循环的刷新间隔，截图前额外等待一个间隔让窗口管理器重绘
  pub fn new(inner: C, control: PresenterControl, refresh: Duration) -> Self {
    Self {
      inner,
      control,
      settle: refresh,
      timeout: (refresh * 10).max(Duration::from_millis(500)),
    }
  }

  fn wait_cleared(&self) {
    let deadline = Instant::now() + self.timeout;
    let step = (self.settle / 2).max(Duration::from_millis(1));
    while !self.control.is_cleared_for_capture() {
      if self.control.is_close_requested() {
        return;
      }
      if Instant::now() >= deadline {
        warn!("叠加窗口未能及时隐藏，截图中可能包含图标");
        return;
      }
      std::thread::sleep(step);
    }
    std::thread::sleep(self.settle);
  }
}

impl<C: ScreenCapture> ScreenCapture for HideOverlayCapture<C> {
  fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
    let _guard = self.control.begin_capture();
    self.wait_cleared();
    self.inner.capture()
  }
}

/// 单槽邮箱，新图覆盖尚未显示的旧图
#[derive(Debug, Clone, Default)]
pub struct OverlaySlot {
  latest: Arc<Mutex<Option<OverlayImage>>>,
}

impl OverlaySlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put(&self, overlay: OverlayImage) {
    let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
    if latest.replace(overlay).is_some() {
      debug!("上一张叠加图尚未显示，已被覆盖");
    }
  }

  pub fn take(&self) -> Option<OverlayImage> {
    self.latest.lock().unwrap_or_else(|e| e.into_inner()).take()
  }
}

impl Render<OverlayImage, PredictionGrid> for OverlaySlot {
  type Error = Infallible;

  fn render_result(
    &self,
    frame: &OverlayImage,
    _result: &PredictionGrid,
  ) -> Result<(), Self::Error> {
    self.put(frame.clone());
    Ok(())
  }
}

/// 叠加窗口的平台后端
pub trait OverlaySurface {
  /// 显示已经压平到键色上的不透明图像，键色像素透出下方画面
  fn show_image(&mut self, image: &RgbaImage) -> Result<(), PlatformError>;

  /// 0.0 完全透明，1.0 完全不透明
  fn set_opacity(&mut self, opacity: f32) -> Result<(), PlatformError>;

  /// 处理窗口事件；窗口已被销毁或连接断开时返回 false
  fn poll_events(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceConfig {
  pub x: i32,
  pub y: i32,
  pub width: u32,
  pub height: u32,
  pub key_color: [u8; 3],
}

impl SurfaceConfig {
  /// 窗口覆盖地图区域
  pub fn for_grid(grid: &MapGrid, key_color: [u8; 3]) -> Self {
    let region = grid.region();
    Self {
      x: region.origin_x as i32,
      y: region.origin_y as i32,
      width: region.size,
      height: region.size,
      key_color,
    }
  }
}

/// 把带 alpha 的叠加图合成到不透明的键色底上
pub fn flatten_onto_key(image: &RgbaImage, key: [u8; 3]) -> RgbaImage {
  let mut flat = RgbaImage::from_pixel(
    image.width(),
    image.height(),
    Rgba([key[0], key[1], key[2], 255]),
  );
  imageops::overlay(&mut flat, image, 0, 0);
  flat
}

pub struct OverlayPresenter<S> {
  surface: S,
  control: PresenterControl,
  slot: OverlaySlot,
  key_color: [u8; 3],
  state: PresenterState,
  applied_opacity: Option<f32>,
}

impl<S: OverlaySurface> OverlayPresenter<S> {
  pub fn new(surface: S, control: PresenterControl, slot: OverlaySlot, key_color: [u8; 3]) -> Self {
    Self {
      surface,
      control,
      slot,
      key_color,
      state: PresenterState::Visible,
      applied_opacity: None,
    }
  }

  pub fn state(&self) -> PresenterState {
    self.state
  }

  pub fn surface(&self) -> &S {
    &self.surface
  }

  /// 替换显示内容，窗口本身保持不变
  pub fn update_image(&mut self, overlay: &OverlayImage) -> Result<(), PlatformError> {
    let flat = flatten_onto_key(overlay.as_image(), self.key_color);
    self.surface.show_image(&flat)
  }

  /// 一次轮询：处理事件、取最新叠加图、按可见性和截图状态设置不透明度
  pub fn tick(&mut self) -> Result<PresenterState, PlatformError> {
    if self.state == PresenterState::Closed {
      return Ok(PresenterState::Closed);
    }

    if !self.surface.poll_events() {
      info!("叠加窗口已被关闭");
      self.state = PresenterState::Closed;
      return Ok(self.state);
    }
    if self.control.is_close_requested() {
      info!("收到退出请求，关闭叠加窗口");
      self.state = PresenterState::Closed;
      return Ok(self.state);
    }

    if let Some(overlay) = self.slot.take() {
      match self.update_image(&overlay) {
        Ok(()) => debug!("叠加图已更新: {}x{}", overlay.width(), overlay.height()),
        Err(e) => error!("叠加图显示失败: {}", e),
      }
    }

    let capturing = self.control.is_capturing();
    let state = if self.control.is_visible() {
      PresenterState::Visible
    } else {
      PresenterState::Hidden
    };
    let opacity = if state == PresenterState::Visible && !capturing {
      1.0
    } else {
      0.0
    };
    if self.applied_opacity != Some(opacity) {
      self.surface.set_opacity(opacity)?;
      self.applied_opacity = Some(opacity);
      debug!("叠加窗口状态: {:?}, 不透明度 {}", state, opacity);
    }
    self.control.cleared.store(capturing, Ordering::Release);
    self.state = state;
    Ok(state)
  }

  /// 以固定间隔轮询直到进入 `Closed`
  pub fn run(mut self, interval: Duration) -> S {
    loop {
      match self.tick() {
        Ok(PresenterState::Closed) => break,
        Ok(_) => {}
        Err(e) => error!("叠加窗口刷新失败: {}", e),
      }
      std::thread::sleep(interval);
    }
    self.surface
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grid::MapRegion;

  #[derive(Debug, Default)]
  struct RecordingSurface {
    shown: Vec<RgbaImage>,
    opacity: Vec<f32>,
    alive: bool,
    fail_show: bool,
  }

  impl RecordingSurface {
    fn alive() -> Self {
      Self {
        alive: true,
        ..Default::default()
      }
    }

    fn current_opacity(&self) -> Option<f32> {
      self.opacity.last().copied()
    }
  }

  impl OverlaySurface for RecordingSurface {
    fn show_image(&mut self, image: &RgbaImage) -> Result<(), PlatformError> {
      if self.fail_show {
        return Err(PlatformError::Other("put_image".to_string()));
      }
      self.shown.push(image.clone());
      Ok(())
    }

    fn set_opacity(&mut self, opacity: f32) -> Result<(), PlatformError> {
      self.opacity.push(opacity);
      Ok(())
    }

    fn poll_events(&mut self) -> bool {
      self.alive
    }
  }

  fn presenter() -> (OverlayPresenter<RecordingSurface>, PresenterControl, OverlaySlot) {
    let control = PresenterControl::new();
    let slot = OverlaySlot::new();
    let presenter = OverlayPresenter::new(
      RecordingSurface::alive(),
      control.clone(),
      slot.clone(),
      [0, 255, 0],
    );
    (presenter, control, slot)
  }

  #[test]
  fn test_visibility_toggle_scenario() {
    let (mut presenter, control, _) = presenter();
    assert_eq!(presenter.state(), PresenterState::Visible);
    assert_eq!(presenter.tick().unwrap(), PresenterState::Visible);
    assert_eq!(presenter.surface().current_opacity(), Some(1.0));

    assert!(!control.toggle_visibility());
    assert_eq!(presenter.tick().unwrap(), PresenterState::Hidden);
    assert_eq!(presenter.surface().current_opacity(), Some(0.0));

    assert!(control.toggle_visibility());
    assert_eq!(presenter.tick().unwrap(), PresenterState::Visible);
    assert_eq!(presenter.surface().current_opacity(), Some(1.0));
  }

  #[test]
  fn test_opacity_only_applied_on_change() {
    let (mut presenter, _, _) = presenter();
    for _ in 0..5 {
      presenter.tick().unwrap();
    }
    assert_eq!(presenter.surface().opacity, vec![1.0]);
  }

  #[test]
  fn test_latest_overlay_wins() {
    let (mut presenter, _, slot) = presenter();
    let first = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]));
    let second = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 255, 255]));
    let grid = MapGrid::new(MapRegion::new(0, 0, 2), 1).unwrap();
    let predictions = PredictionGrid::from_row_major(
      1,
      vec![crate::model::Prediction {
        label: "x".to_string(),
        confidence: 1.0,
      }],
    )
    .unwrap();
    let compositor = crate::output::Compositor::new(grid, crate::output::IconSet::new());
    let to_overlay = |image: &RgbaImage| {
      compositor.composite(
        &predictions,
        crate::output::Background::from_capture(image, &grid).unwrap(),
      )
    };

    slot
      .render_result(&to_overlay(&first), &predictions)
      .unwrap();
    slot
      .render_result(&to_overlay(&second), &predictions)
      .unwrap();
    presenter.tick().unwrap();
    presenter.tick().unwrap();

    assert_eq!(presenter.surface().shown.len(), 1);
    assert_eq!(presenter.surface().shown[0].get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
  }

  #[test]
  fn test_close_request_reaches_closed() {
    let (mut presenter, control, _) = presenter();
    presenter.tick().unwrap();
    control.request_close();
    assert_eq!(presenter.tick().unwrap(), PresenterState::Closed);
    assert_eq!(presenter.tick().unwrap(), PresenterState::Closed);

    let surface = presenter.run(Duration::from_millis(1));
    assert_eq!(surface.opacity, vec![1.0]);
  }

  #[test]
  fn test_destroyed_surface_closes() {
    let control = PresenterControl::new();
    let presenter = OverlayPresenter::new(
      RecordingSurface::default(),
      control,
      OverlaySlot::new(),
      [0, 255, 0],
    );
    let surface = presenter.run(Duration::from_millis(1));
    assert!(surface.opacity.is_empty());
  }

  #[test]
  fn test_flatten_onto_key() {
    let image = RgbaImage::from_fn(3, 1, |x, _| match x {
      0 => Rgba([200, 10, 10, 0]),
      1 => Rgba([200, 10, 10, 255]),
      _ => Rgba([255, 0, 0, 128]),
    });
    let flat = flatten_onto_key(&image, [0, 255, 0]);
    assert_eq!(flat.get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
    assert_eq!(flat.get_pixel(1, 0), &Rgba([200, 10, 10, 255]));

    let half = flat.get_pixel(2, 0);
    assert!(half[0].abs_diff(128) <= 1);
    assert!(half[1].abs_diff(127) <= 1);
    assert_eq!((half[2], half[3]), (0, 255));
  }

  fn one_tile_overlay(color: Rgba<u8>) -> (OverlayImage, PredictionGrid) {
    let grid = MapGrid::new(MapRegion::new(0, 0, 2), 1).unwrap();
    let predictions = PredictionGrid::from_row_major(
      1,
      vec![crate::model::Prediction {
        label: "x".to_string(),
        confidence: 1.0,
      }],
    )
    .unwrap();
    let compositor = crate::output::Compositor::new(grid, crate::output::IconSet::new());
    let overlay = compositor.composite(
      &predictions,
      crate::output::Background::from_capture(&RgbaImage::from_pixel(2, 2, color), &grid).unwrap(),
    );
    (overlay, predictions)
  }

  #[test]
  fn test_show_failure_still_applies_visibility() {
    let control = PresenterControl::new();
    let slot = OverlaySlot::new();
    let surface = RecordingSurface {
      alive: true,
      fail_show: true,
      ..Default::default()
    };
    let mut presenter = OverlayPresenter::new(surface, control.clone(), slot.clone(), [0, 255, 0]);

    let (overlay, _) = one_tile_overlay(Rgba([255, 0, 0, 255]));
    slot.put(overlay);
    control.toggle_visibility();
    assert_eq!(presenter.tick().unwrap(), PresenterState::Hidden);
    assert_eq!(presenter.surface().current_opacity(), Some(0.0));
    assert!(presenter.surface().shown.is_empty());
  }

  #[test]
  fn test_capture_forces_transparent_window() {
    let (mut presenter, control, _) = presenter();
    presenter.tick().unwrap();
    assert_eq!(presenter.surface().current_opacity(), Some(1.0));

    let guard = control.begin_capture();
    assert!(!control.is_cleared_for_capture());
    assert_eq!(presenter.tick().unwrap(), PresenterState::Visible);
    assert_eq!(presenter.surface().current_opacity(), Some(0.0));
    assert!(control.is_cleared_for_capture());

    drop(guard);
    assert!(!control.is_capturing());
    presenter.tick().unwrap();
    assert_eq!(presenter.surface().current_opacity(), Some(1.0));
    assert!(!control.is_cleared_for_capture());

    // 用户隐藏的窗口在截图结束后仍保持隐藏
    control.toggle_visibility();
    let guard = control.begin_capture();
    presenter.tick().unwrap();
    drop(guard);
    assert_eq!(presenter.tick().unwrap(), PresenterState::Hidden);
    assert_eq!(presenter.surface().opacity, vec![1.0, 0.0, 1.0, 0.0]);
  }

  /// 不透明度写入共享状态，供另一线程上的截图读取
  struct SharedOpacitySurface {
    opacity: Arc<Mutex<Option<f32>>>,
  }

  impl OverlaySurface for SharedOpacitySurface {
    fn show_image(&mut self, _image: &RgbaImage) -> Result<(), PlatformError> {
      Ok(())
    }

    fn set_opacity(&mut self, opacity: f32) -> Result<(), PlatformError> {
      *self.opacity.lock().unwrap() = Some(opacity);
      Ok(())
    }

    fn poll_events(&mut self) -> bool {
      true
    }
  }

  /// 截图时记下窗口当前的不透明度
  struct OpacityWitnessCapture {
    opacity: Arc<Mutex<Option<f32>>>,
    seen: Vec<Option<f32>>,
  }

  impl ScreenCapture for OpacityWitnessCapture {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
      self.seen.push(*self.opacity.lock().unwrap());
      Ok(RgbaImage::new(2, 2))
    }
  }

  #[test]
  fn test_hide_overlay_capture_sees_transparent_window() {
    let control = PresenterControl::new();
    let opacity = Arc::new(Mutex::new(None));
    let presenter = OverlayPresenter::new(
      SharedOpacitySurface {
        opacity: opacity.clone(),
      },
      control.clone(),
      OverlaySlot::new(),
      [0, 255, 0],
    );
    let refresh = Duration::from_millis(2);
    let handle = std::thread::spawn(move || presenter.run(refresh));

    let mut capture = HideOverlayCapture::new(
      OpacityWitnessCapture {
        opacity: opacity.clone(),
        seen: Vec::new(),
      },
      control.clone(),
      refresh,
    );
    for _ in 0..2 {
      capture.capture().unwrap();
      let deadline = Instant::now() + Duration::from_secs(5);
      while *opacity.lock().unwrap() != Some(1.0) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
      }
      assert_eq!(*opacity.lock().unwrap(), Some(1.0));
    }

    control.request_close();
    handle.join().unwrap();
    assert_eq!(capture.inner.seen, vec![Some(0.0), Some(0.0)]);
  }

  #[test]
  fn test_surface_config_covers_region() {
    let grid = MapGrid::new(MapRegion::new(627, 207, 665), 5).unwrap();
    let config = SurfaceConfig::for_grid(&grid, [0, 255, 0]);
    assert_eq!((config.x, config.y), (627, 207));
    assert_eq!((config.width, config.height), (665, 665));
  }
}
