// 该文件是 Tuzhi （图志） 项目的一部分。
// src/pipeline.rs - 地图切分与逐块分类
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
use tracing::debug;

use crate::{
  grid::{MapGrid, TileBounds, TileCoord},
  model::{ClassifyError, Model, Prediction},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("图块 {coord} 的边界 {bounds} 超出截图范围 {width}x{height}")]
  Crop {
    coord: TileCoord,
    bounds: TileBounds,
    width: u32,
    height: u32,
  },
  #[error("图块 {coord} 分类失败: {source}")]
  Classify {
    coord: TileCoord,
    source: ClassifyError,
  },
  #[error("无法写入图块 {path}: {source}")]
  TileWrite {
    path: PathBuf,
    source: image::ImageError,
  },
}

impl PipelineError {
  pub fn coord(&self) -> Option<TileCoord> {
    match self {
      PipelineError::Crop { coord, .. } | PipelineError::Classify { coord, .. } => Some(*coord),
      PipelineError::TileWrite { .. } => None,
    }
  }
}

/// dimension x dimension 的完整预测网格，行优先存储
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionGrid {
  dimension: u32,
  cells: Box<[Prediction]>,
}

impl PredictionGrid {
  /// `cells` 必须按行优先给出恰好 dimension² 个预测，dimension 不能为 0
  pub fn from_row_major(dimension: u32, cells: Vec<Prediction>) -> Option<Self> {
    if dimension == 0 || cells.len() != (dimension as usize) * (dimension as usize) {
      return None;
    }
    Some(Self {
      dimension,
      cells: cells.into_boxed_slice(),
    })
  }

  pub fn dimension(&self) -> u32 {
    self.dimension
  }

  pub fn len(&self) -> usize {
    self.cells.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cells.is_empty()
  }

  pub fn get(&self, coord: TileCoord) -> Option<&Prediction> {
    if coord.row >= self.dimension || coord.col >= self.dimension {
      return None;
    }
    self
      .cells
      .get((coord.row as usize) * (self.dimension as usize) + coord.col as usize)
  }

  pub fn iter(&self) -> impl Iterator<Item = (TileCoord, &Prediction)> {
    let dimension = self.dimension;
    self.cells.iter().enumerate().map(move |(i, p)| {
      let i = i as u32;
      (TileCoord::new(i / dimension, i % dimension), p)
    })
  }

  /// 逐行的标签表
  pub fn labels(&self) -> Vec<Vec<&str>> {
    self
      .cells
      .chunks(self.dimension as usize)
      .map(|row| row.iter().map(|p| p.label.as_str()).collect())
      .collect()
  }
}

pub struct TilePipeline {
  grid: MapGrid,
  tile_dir: Option<PathBuf>,
}

impl TilePipeline {
  pub fn new(grid: MapGrid) -> Self {
    Self {
      grid,
      tile_dir: None,
    }
  }

  /// 分类前把每个图块写入该目录，文件名 `tile_{row}_{col}.png`
  pub fn with_tile_dir(mut self, tile_dir: Option<PathBuf>) -> Self {
    self.tile_dir = tile_dir;
    self
  }

  pub fn grid(&self) -> &MapGrid {
    &self.grid
  }

  /// 所有图块都必须落在截图内，否则整轮失败
  pub fn check_bounds(&self, map_image: &RgbaImage) -> Result<(), PipelineError> {
    let (width, height) = map_image.dimensions();
    for coord in self.grid.coords() {
      let bounds = self.grid.tile_bounds(coord);
      if !bounds.fits_within(width, height) {
        return Err(PipelineError::Crop {
          coord,
          bounds,
          width,
          height,
        });
      }
    }
    Ok(())
  }

  pub fn crop_tile(&self, map_image: &RgbaImage, coord: TileCoord) -> RgbaImage {
    let b = self.grid.tile_bounds(coord);
    image::imageops::crop_imm(map_image, b.left, b.top, b.width(), b.height()).to_image()
  }

  /// 行优先逐块裁剪并分类
  pub fn classify_grid<M>(
    &self,
    map_image: &RgbaImage,
    model: &mut M,
  ) -> Result<PredictionGrid, PipelineError>
  where
    M: Model<Input = RgbaImage, Output = Prediction, Error = ClassifyError>,
  {
    self.check_bounds(map_image)?;

    if let Some(dir) = &self.tile_dir {
      std::fs::create_dir_all(dir).map_err(|e| PipelineError::TileWrite {
        path: dir.clone(),
        source: image::ImageError::IoError(e),
      })?;
    }

    let mut cells = Vec::with_capacity(self.grid.tile_count());
    for coord in self.grid.coords() {
      let tile = self.crop_tile(map_image, coord);

      if let Some(dir) = &self.tile_dir {
        let path = dir.join(format!("tile_{}_{}.png", coord.row, coord.col));
        tile
          .save(&path)
          .map_err(|source| PipelineError::TileWrite { path, source })?;
      }

      let prediction = model
        .infer(&tile)
        .map_err(|source| PipelineError::Classify { coord, source })?;
      debug!(
        "图块 {} -> {} ({:.4})",
        coord, prediction.label, prediction.confidence
      );
      cells.push(prediction);
    }

    Ok(PredictionGrid {
      dimension: self.grid.dimension(),
      cells: cells.into_boxed_slice(),
    })
  }
}
