// 该文件是 Tuzhi （图志） 项目的一部分。
// src/grid.rs - 地图区域与网格几何
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

use std::fmt;

use thiserror::Error;
use tracing::warn;

/// 截图中地图所在的正方形区域（源图像像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegion {
  pub origin_x: u32,
  pub origin_y: u32,
  pub size: u32,
}

impl MapRegion {
  pub fn new(origin_x: u32, origin_y: u32, size: u32) -> Self {
    Self {
      origin_x,
      origin_y,
      size,
    }
  }
}

/// 网格中的一个单元 (row, col)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
  pub row: u32,
  pub col: u32,
}

impl TileCoord {
  pub fn new(row: u32, col: u32) -> Self {
    Self { row, col }
  }
}

impl fmt::Display for TileCoord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({},{})", self.row, self.col)
  }
}

/// 单元边界 [left, right) x [top, bottom)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
  pub left: u32,
  pub top: u32,
  pub right: u32,
  pub bottom: u32,
}

impl TileBounds {
  pub fn width(&self) -> u32 {
    self.right - self.left
  }

  pub fn height(&self) -> u32 {
    self.bottom - self.top
  }

  /// 边界是否完全落在 width x height 的图像内
  pub fn fits_within(&self, width: u32, height: u32) -> bool {
    self.right <= width && self.bottom <= height
  }
}

impl fmt::Display for TileBounds {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}, {}, {}, {}]",
      self.left, self.top, self.right, self.bottom
    )
  }
}

/// 计算单元在源图像坐标系中的边界。
///
/// `tile_size = region.size / dimension`，余数像素不属于任何单元。
pub fn tile_bounds(region: &MapRegion, dimension: u32, row: u32, col: u32) -> TileBounds {
  let tile_size = region.size / dimension;
  let left = region.origin_x + col * tile_size;
  let top = region.origin_y + row * tile_size;
  TileBounds {
    left,
    top,
    right: left + tile_size,
    bottom: top + tile_size,
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GridError {
  #[error("网格维度必须大于 0")]
  ZeroDimension,
  #[error("地图区域尺寸必须大于 0")]
  ZeroRegion,
  #[error("网格维度 {dimension} 超过地图尺寸 {size}")]
  DimensionTooLarge { dimension: u32, size: u32 },
  #[error("地图区域 ({origin_x}, {origin_y}) 边长 {size} 超出坐标范围")]
  RegionOverflow {
    origin_x: u32,
    origin_y: u32,
    size: u32,
  },
}

/// 地图区域加网格维度，启动时确定，运行期间不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapGrid {
  region: MapRegion,
  dimension: u32,
}

impl MapGrid {
  pub fn new(region: MapRegion, dimension: u32) -> Result<Self, GridError> {
    if dimension == 0 {
      return Err(GridError::ZeroDimension);
    }
    if region.size == 0 {
      return Err(GridError::ZeroRegion);
    }
    if dimension > region.size {
      return Err(GridError::DimensionTooLarge {
        dimension,
        size: region.size,
      });
    }
    if region.origin_x.checked_add(region.size).is_none()
      || region.origin_y.checked_add(region.size).is_none()
    {
      return Err(GridError::RegionOverflow {
        origin_x: region.origin_x,
        origin_y: region.origin_y,
        size: region.size,
      });
    }

    let remainder = region.size % dimension;
    if remainder != 0 {
      warn!(
        "地图尺寸 {} 不能被网格维度 {} 整除，右侧与底部 {} 像素不在网格内",
        region.size, dimension, remainder
      );
    }

    Ok(Self { region, dimension })
  }

  pub fn region(&self) -> &MapRegion {
    &self.region
  }

  pub fn dimension(&self) -> u32 {
    self.dimension
  }

  pub fn tile_size(&self) -> u32 {
    self.region.size / self.dimension
  }

  pub fn tile_count(&self) -> usize {
    (self.dimension as usize) * (self.dimension as usize)
  }

  /// 源截图坐标系中的单元边界（用于裁剪）
  pub fn tile_bounds(&self, coord: TileCoord) -> TileBounds {
    tile_bounds(&self.region, self.dimension, coord.row, coord.col)
  }

  /// 以地图左上角为原点的单元边界（用于贴图标）
  pub fn local_tile_bounds(&self, coord: TileCoord) -> TileBounds {
    let local = MapRegion::new(0, 0, self.region.size);
    tile_bounds(&local, self.dimension, coord.row, coord.col)
  }

  /// 整个地图区域在源截图中的边界
  pub fn region_bounds(&self) -> TileBounds {
    TileBounds {
      left: self.region.origin_x,
      top: self.region.origin_y,
      right: self.region.origin_x + self.region.size,
      bottom: self.region.origin_y + self.region.size,
    }
  }

  /// 行优先遍历所有单元
  pub fn coords(&self) -> impl Iterator<Item = TileCoord> + use<> {
    let dimension = self.dimension;
    (0..dimension).flat_map(move |row| (0..dimension).map(move |col| TileCoord::new(row, col)))
  }

  pub fn index_of(&self, coord: TileCoord) -> usize {
    (coord.row as usize) * (self.dimension as usize) + coord.col as usize
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn test_tile_bounds_corners() {
    let region = MapRegion::new(627, 207, 20);
    assert_eq!(
      tile_bounds(&region, 4, 0, 0),
      TileBounds {
        left: 627,
        top: 207,
        right: 632,
        bottom: 212
      }
    );
    assert_eq!(
      tile_bounds(&region, 4, 3, 3),
      TileBounds {
        left: 642,
        top: 222,
        right: 647,
        bottom: 227
      }
    );
  }

  #[test]
  fn test_local_bounds_drop_origin() {
    let grid = MapGrid::new(MapRegion::new(100, 50, 20), 4).unwrap();
    let coord = TileCoord::new(2, 1);
    let abs = grid.tile_bounds(coord);
    let local = grid.local_tile_bounds(coord);
    assert_eq!(abs.left - local.left, 100);
    assert_eq!(abs.top - local.top, 50);
    assert_eq!(abs.width(), local.width());
  }

  #[test]
  fn test_remainder_is_excluded() {
    let grid = MapGrid::new(MapRegion::new(0, 0, 22), 4).unwrap();
    assert_eq!(grid.tile_size(), 5);
    let last = grid.tile_bounds(TileCoord::new(3, 3));
    assert_eq!((last.right, last.bottom), (20, 20));
  }

  #[test]
  fn test_invalid_grids() {
    let region = MapRegion::new(0, 0, 10);
    assert_eq!(MapGrid::new(region, 0), Err(GridError::ZeroDimension));
    assert_eq!(
      MapGrid::new(MapRegion::new(0, 0, 0), 3),
      Err(GridError::ZeroRegion)
    );
    assert_eq!(
      MapGrid::new(region, 11),
      Err(GridError::DimensionTooLarge {
        dimension: 11,
        size: 10
      })
    );
    assert_eq!(
      MapGrid::new(MapRegion::new(4_294_967_000, 0, 665), 5),
      Err(GridError::RegionOverflow {
        origin_x: 4_294_967_000,
        origin_y: 0,
        size: 665
      })
    );
    assert!(matches!(
      MapGrid::new(MapRegion::new(0, u32::MAX, 1), 1),
      Err(GridError::RegionOverflow { .. })
    ));

    let edge = MapGrid::new(MapRegion::new(u32::MAX - 10, 0, 10), 2).unwrap();
    assert_eq!(edge.region_bounds().right, u32::MAX);
    assert_eq!(edge.tile_bounds(TileCoord::new(1, 1)).right, u32::MAX);
  }

  #[test]
  fn test_coords_row_major() {
    let grid = MapGrid::new(MapRegion::new(0, 0, 9), 3).unwrap();
    let coords: Vec<_> = grid.coords().collect();
    assert_eq!(coords.len(), 9);
    assert_eq!(coords[0], TileCoord::new(0, 0));
    assert_eq!(coords[1], TileCoord::new(0, 1));
    assert_eq!(coords[3], TileCoord::new(1, 0));
    for (i, c) in coords.iter().enumerate() {
      assert_eq!(grid.index_of(*c), i);
    }
  }

  proptest! {
    #[test]
    fn prop_tiles_cover_region_exactly(
      origin_x in 0u32..2000,
      origin_y in 0u32..2000,
      dimension in 1u32..12,
      tile in 1u32..40,
    ) {
      let size = dimension * tile;
      let grid = MapGrid::new(MapRegion::new(origin_x, origin_y, size), dimension).unwrap();
      let mut covered = vec![0u8; (size * size) as usize];
      for coord in grid.coords() {
        let b = grid.tile_bounds(coord);
        prop_assert_eq!(b, grid.tile_bounds(coord));
        for y in b.top..b.bottom {
          for x in b.left..b.right {
            let idx = ((y - origin_y) * size + (x - origin_x)) as usize;
            covered[idx] += 1;
          }
        }
      }
      prop_assert!(covered.iter().all(|&n| n == 1));
    }
  }
}
