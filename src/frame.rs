// 该文件是 Tuzhi （图志） 项目的一部分。
// src/frame.rs - 归一化 NCHW 输入张量
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

use image::{RgbImage, RgbaImage, buffer::ConvertBuffer, imageops::FilterType};

const RGB_CHANNELS: usize = 3;

/// 训练时使用的归一化参数：(x / 255 - mean) / std
pub const NORMALIZE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const NORMALIZE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// 批大小为 1 的 RGB NCHW 浮点张量，边长在运行期确定
#[derive(Debug, Clone)]
pub struct NchwTensor {
  size: usize,
  data: Box<[f32]>,
}

impl NchwTensor {
  pub fn zeros(size: usize) -> Self {
    Self {
      size,
      data: vec![0.0f32; RGB_CHANNELS * size * size].into_boxed_slice(),
    }
  }

  /// 丢弃 alpha 通道，缩放到 size x size 并归一化
  pub fn from_rgba(image: &RgbaImage, size: u32) -> Self {
    let rgb: RgbImage = image.convert();
    let resized = image::imageops::resize(&rgb, size, size, FilterType::Triangle);
    let mut tensor = Self::zeros(size as usize);

    let plane = tensor.size * tensor.size;
    let width = tensor.size;
    let slice = tensor.as_mut();

    for (x, y, pixel) in resized.enumerate_pixels() {
      let offset = (y as usize) * width + (x as usize);
      for c in 0..RGB_CHANNELS {
        let value = pixel[c] as f32 / 255.0;
        slice[c * plane + offset] = (value - NORMALIZE_MEAN[c]) / NORMALIZE_STD[c];
      }
    }
    tensor
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// [1, 3, size, size]
  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.size, self.size]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }
}

impl AsMut<[f32]> for NchwTensor {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}
