// 该文件是 Tuzhi （图志） 项目的一部分。
// src/output/save_image_file.rs - 保存标注地图
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

use image::RgbaImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_file_path,
  output::{OverlayImage, Render},
  pipeline::PredictionGrid,
};

#[cfg(feature = "draw_labels")]
use crate::output::draw::Draw;

pub struct SaveImageFileOutput {
  path: PathBuf,
  record: bool,
  #[cfg(feature = "draw_labels")]
  draw: Option<Draw>,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("输出路径为空")]
  EmptyPath,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  /// `image:annotated_map.png`，附加 `?record` 时同时写出 `.txt` 预测记录
  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    if uri.path().is_empty() {
      return Err(SaveImageFileError::EmptyPath);
    }

    Ok(SaveImageFileOutput {
      path: url_file_path(uri),
      record: uri.query_pairs().any(|(k, _)| k == "record"),
      #[cfg(feature = "draw_labels")]
      draw: None,
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  #[cfg(feature = "draw_labels")]
  pub fn with_draw(mut self, draw: Option<Draw>) -> Self {
    self.draw = draw;
    self
  }

  #[cfg(feature = "draw_labels")]
  fn captioned(&self, frame: &OverlayImage, result: &PredictionGrid) -> Option<RgbaImage> {
    self.draw.as_ref().map(|draw| {
      let mut image = frame.as_image().clone();
      draw.draw_predictions_on_image(&mut image, result);
      image
    })
  }

  #[cfg(not(feature = "draw_labels"))]
  fn captioned(&self, _frame: &OverlayImage, _result: &PredictionGrid) -> Option<RgbaImage> {
    None
  }

  fn save_image(&self, image: &RgbaImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    info!("标注地图已保存到: {}", self.path.display());

    Ok(())
  }

  /// 每行一个图块: `row, col, label, confidence`
  fn save_record(&self, result: &PredictionGrid) -> Result<(), SaveImageFileError> {
    let records: Vec<String> = result
      .iter()
      .map(|(coord, p)| format!("{}, {}, {}, {:.4}", coord.row, coord.col, p.label, p.confidence))
      .collect();
    std::fs::write(self.path.with_extension("txt"), records.join("\n"))
      .map_err(SaveImageFileError::IoError)
  }
}

impl Render<OverlayImage, PredictionGrid> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &OverlayImage,
    result: &PredictionGrid,
  ) -> Result<(), Self::Error> {
    let captioned = self.captioned(frame, result);
    self.save_image(captioned.as_ref().unwrap_or(frame.as_image()))?;
    if self.record {
      self.save_record(result)?;
    }
    Ok(())
  }
}
