// 该文件是 Tuzhi （图志） 项目的一部分。
// src/output.rs - 图标叠加合成与输出
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

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::{ImageReader, Rgba, RgbaImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{grid::MapGrid, pipeline::PredictionGrid};

pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 未配置的输出什么也不做
impl<Frame, Output, R: Render<Frame, Output>> Render<Frame, Output> for Option<R> {
  type Error = R::Error;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    match self {
      Some(render) => render.render_result(frame, result),
      None => Ok(()),
    }
  }
}

/// 同一结果依次交给两个输出；第一个失败时第二个仍会执行
pub struct Tee<A, B> {
  first: A,
  second: B,
}

impl<A, B> Tee<A, B> {
  pub fn new(first: A, second: B) -> Self {
    Self { first, second }
  }
}

impl<Frame, Output, A, B> Render<Frame, Output> for Tee<A, B>
where
  A: Render<Frame, Output>,
  B: Render<Frame, Output>,
  A::Error: std::error::Error + Send + Sync + 'static,
  B::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = TeeError;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error> {
    let first = self.first.render_result(frame, result);
    let second = self.second.render_result(frame, result);
    first.map_err(|e| TeeError(Box::new(e)))?;
    second.map_err(|e| TeeError(Box::new(e)))?;
    Ok(())
  }
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct TeeError(Box<dyn std::error::Error + Send + Sync>);

#[cfg(feature = "draw_labels")]
pub mod draw;

mod save_image_file;
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

/// 图标文件名后缀：`{label}_overlay.png`
pub const ICON_SUFFIX: &str = "_overlay.png";

#[derive(Error, Debug)]
pub enum ComposeError {
  #[error("图标目录不存在: {0}")]
  IconDirMissing(PathBuf),
  #[error("无法读取图标目录 {path}: {source}")]
  IconDirIo {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("地图区域 [{left}, {top}, {right}, {bottom}] 超出截图范围 {width}x{height}")]
  RegionOutOfBounds {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
    width: u32,
    height: u32,
  },
}

/// 类别名到图标的映射；缺少图标的类别不绘制
#[derive(Debug, Clone, Default)]
pub struct IconSet {
  icons: HashMap<String, RgbaImage>,
}

impl IconSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, label: impl Into<String>, icon: RgbaImage) {
    self.icons.insert(label.into(), icon);
  }

  /// 扫描目录中的 `{label}_overlay.png`，无法解码的图标跳过
  pub fn load_dir(dir: &Path) -> Result<Self, ComposeError> {
    if !dir.is_dir() {
      return Err(ComposeError::IconDirMissing(dir.to_path_buf()));
    }

    let io_error = |source| ComposeError::IconDirIo {
      path: dir.to_path_buf(),
      source,
    };

    let mut set = Self::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
      let path = entry.map_err(io_error)?.path();
      let Some(label) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(ICON_SUFFIX))
      else {
        continue;
      };
      if label.is_empty() {
        continue;
      }

      match ImageReader::open(&path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => match reader.decode() {
          Ok(icon) => {
            debug!("加载图标 {}: {}x{}", label, icon.width(), icon.height());
            set.insert(label, icon.to_rgba8());
          }
          Err(e) => warn!("跳过无法解码的图标 {}: {}", path.display(), e),
        },
        Err(e) => warn!("跳过无法打开的图标 {}: {}", path.display(), e),
      }
    }

    info!("从 {} 加载了 {} 个图标", dir.display(), set.len());
    Ok(set)
  }

  pub fn get(&self, label: &str) -> Option<&RgbaImage> {
    self.icons.get(label)
  }

  pub fn contains(&self, label: &str) -> bool {
    self.icons.contains_key(label)
  }

  pub fn len(&self) -> usize {
    self.icons.len()
  }

  pub fn is_empty(&self) -> bool {
    self.icons.is_empty()
  }
}

/// 合成结果，尺寸等于地图区域
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayImage {
  image: RgbaImage,
}

impl OverlayImage {
  pub fn as_image(&self) -> &RgbaImage {
    &self.image
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}

/// 合成底图，只能由下面两个构造函数得到，保证尺寸为 size x size
#[derive(Debug, Clone)]
pub struct Background {
  image: RgbaImage,
}

impl Background {
  /// 实时叠加：全透明画布，颜色取透明键色
  pub fn transparent(grid: &MapGrid, key: [u8; 3]) -> Self {
    let size = grid.region().size;
    Self {
      image: RgbaImage::from_pixel(size, size, Rgba([key[0], key[1], key[2], 0])),
    }
  }

  /// 静态导出：截图中的真实地图像素
  pub fn from_capture(capture: &RgbaImage, grid: &MapGrid) -> Result<Self, ComposeError> {
    let b = grid.region_bounds();
    let (width, height) = capture.dimensions();
    if !b.fits_within(width, height) {
      return Err(ComposeError::RegionOutOfBounds {
        left: b.left,
        top: b.top,
        right: b.right,
        bottom: b.bottom,
        width,
        height,
      });
    }
    Ok(Self {
      image: image::imageops::crop_imm(capture, b.left, b.top, b.width(), b.height()).to_image(),
    })
  }

  pub fn as_image(&self) -> &RgbaImage {
    &self.image
  }
}

/// 编排器为每轮选择底图的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundMode {
  MapPixels,
  Transparent { key: [u8; 3] },
}

impl BackgroundMode {
  pub fn prepare(&self, capture: &RgbaImage, grid: &MapGrid) -> Result<Background, ComposeError> {
    match self {
      BackgroundMode::MapPixels => Background::from_capture(capture, grid),
      BackgroundMode::Transparent { key } => Ok(Background::transparent(grid, *key)),
    }
  }
}

/// 以 mask 为权重逐通道混合（含 alpha 通道），mask 为 0 时保持底图
fn paste_masked(canvas: &mut RgbaImage, icon: &RgbaImage, x: u32, y: u32) {
  for (ix, iy, pixel) in icon.enumerate_pixels() {
    let (cx, cy) = (x + ix, y + iy);
    if cx >= canvas.width() || cy >= canvas.height() {
      continue;
    }
    let mask = pixel[3] as u32;
    if mask == 0 {
      continue;
    }
    let dst = canvas.get_pixel_mut(cx, cy);
    for c in 0..4 {
      let blended = (pixel[c] as u32 * mask + dst[c] as u32 * (255 - mask) + 127) / 255;
      dst[c] = blended as u8;
    }
  }
}

pub struct Compositor {
  grid: MapGrid,
  icons: HashMap<String, RgbaImage>,
}

impl Compositor {
  /// 图标在构造时统一缩放到 tile_size x tile_size
  pub fn new(grid: MapGrid, icons: IconSet) -> Self {
    let tile_size = grid.tile_size();
    let icons = icons
      .icons
      .into_iter()
      .map(|(label, icon)| {
        let resized =
          image::imageops::resize(&icon, tile_size, tile_size, FilterType::CatmullRom);
        (label, resized)
      })
      .collect();
    Self { grid, icons }
  }

  pub fn grid(&self) -> &MapGrid {
    &self.grid
  }

  /// 在底图上按预测结果贴图标，每次都产生全新的图像
  pub fn composite(&self, predictions: &PredictionGrid, background: Background) -> OverlayImage {
    let mut canvas = background.image;
    for coord in self.grid.coords() {
      let Some(prediction) = predictions.get(coord) else {
        continue;
      };
      let Some(icon) = self.icons.get(&prediction.label) else {
        continue;
      };
      let b = self.grid.local_tile_bounds(coord);
      paste_masked(&mut canvas, icon, b.left, b.top);
    }
    OverlayImage { image: canvas }
  }
}
