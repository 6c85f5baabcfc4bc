// 该文件是 Tuzhi （图志） 项目的一部分。
// src/output/draw.rs - 在标注地图上绘制分类标签
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

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use thiserror::Error;

use crate::{grid::MapGrid, pipeline::PredictionGrid};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_TEXT_HEIGHT: u32 = 16;
const LABEL_CHAR_WIDTH: f32 = 7.5; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 1;
const LABEL_BACKGROUND: [u8; 4] = [0, 0, 0, 160];
const LABEL_TEXT_COLOR: [u8; 4] = [255, 255, 255, 255];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {path}: {source}")]
  FontIo {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法解析字体文件 {0}")]
  InvalidFont(PathBuf),
}

pub struct Draw {
  font: FontVec,
  font_size: f32,
  label_text_height: u32,
  label_char_width: f32,
  grid: MapGrid,
}

impl Draw {
  pub fn from_font_file(path: &Path, grid: MapGrid) -> Result<Self, DrawError> {
    let data = std::fs::read(path).map_err(|source| DrawError::FontIo {
      path: path.to_path_buf(),
      source,
    })?;
    let font =
      FontVec::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.to_path_buf()))?;

    Ok(Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      grid,
    })
  }

  /// 在每个图块左上角写 `label 87.3%`，坐标相对于地图区域
  pub fn draw_predictions_on_image(&self, image: &mut RgbaImage, result: &PredictionGrid) {
    let scale = PxScale::from(self.font_size);

    for (coord, prediction) in result.iter() {
      let b = self.grid.local_tile_bounds(coord);
      if b.left >= image.width() || b.top >= image.height() {
        continue;
      }

      let label = format!("{} {:.1}%", prediction.label, prediction.confidence * 100.0);

      // 背景条不超出图块和图像
      let text_width = (label.chars().count() as f32 * self.label_char_width) as u32;
      let label_width = text_width
        .min(b.width())
        .min(image.width() - b.left);
      let label_height = self
        .label_text_height
        .min(b.height())
        .min(image.height() - b.top);
      if label_width == 0 || label_height == 0 {
        continue;
      }

      let rect = imageproc::rect::Rect::at(b.left as i32, b.top as i32)
        .of_size(label_width, label_height);
      draw_filled_rect_mut(image, rect, Rgba(LABEL_BACKGROUND));

      draw_text_mut(
        image,
        Rgba(LABEL_TEXT_COLOR),
        b.left as i32,
        b.top as i32 + LABEL_TEXT_VERTICAL_PADDING,
        scale,
        &self.font,
        &label,
      );
    }
  }
}
