// 该文件是 Tuzhi （图志） 项目的一部分。
// src/model.rs - 图块分类模型
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
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::NchwTensor;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 原始前向计算：输入归一化张量，输出未归一化的 logits
pub trait Backbone {
  fn forward(&mut self, input: &NchwTensor) -> Result<Vec<f32>, ClassifyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
  pub label: String,
  pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型路径必须使用 {expected} 方案, 实际为 {found}")]
  SchemeMismatch { expected: String, found: String },
  #[error("模型文件不存在: {0}")]
  MissingModel(PathBuf),
  #[error("无法读取类别清单 {path}: {source}")]
  ManifestIo {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("类别清单格式错误 {path}: {source}")]
  ManifestFormat {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("类别清单为空")]
  EmptyClassList,
  #[error("模型输入尺寸必须大于 0")]
  InvalidInputSize,
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出宽度 {outputs} 与类别数 {classes} 不一致")]
  ShapeMismatch { classes: usize, outputs: usize },
}

#[derive(Error, Debug)]
pub enum ClassifyError {
  #[error("图块尺寸无效: {width}x{height}")]
  Decode { width: u32, height: u32 },
  #[error("推理错误: {0}")]
  Inference(String),
}

impl ClassifyError {
  /// 图块本身无法处理（而非推理后端故障）
  pub fn is_decode(&self) -> bool {
    !matches!(self, ClassifyError::Inference(_))
  }
}

#[derive(Debug, Deserialize)]
struct ClassManifest {
  classes: Vec<String>,
}

/// 有序类别表，下标即模型输出下标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassList {
  names: Box<[String]>,
}

impl ClassList {
  pub fn new(names: Vec<String>) -> Result<Self, ModelLoadError> {
    if names.is_empty() {
      return Err(ModelLoadError::EmptyClassList);
    }
    Ok(Self {
      names: names.into_boxed_slice(),
    })
  }

  /// 读取 `{ "classes": [...] }` 格式的类别清单
  pub fn from_manifest(path: &Path) -> Result<Self, ModelLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ModelLoadError::ManifestIo {
      path: path.to_path_buf(),
      source,
    })?;
    let manifest: ClassManifest =
      serde_json::from_str(&text).map_err(|source| ModelLoadError::ManifestFormat {
        path: path.to_path_buf(),
        source,
      })?;
    debug!("类别清单 {}: {:?}", path.display(), manifest.classes);
    Self::new(manifest.classes)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn name(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  pub fn contains(&self, label: &str) -> bool {
    self.names.iter().any(|n| n == label)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }
}

/// 数值稳定的 softmax，遇到非有限值返回 None
pub fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
  if logits.is_empty() || logits.iter().any(|v| !v.is_finite()) {
    return None;
  }
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  Some(exps.into_iter().map(|e| e / sum).collect())
}

/// 加载一次、之后反复使用的图块分类器
pub struct TileClassifier<B> {
  backbone: B,
  classes: ClassList,
  input_size: u32,
}

impl<B: Backbone> TileClassifier<B> {
  /// 用全零张量做一次前向，校验输出宽度与类别数一致
  pub fn new(mut backbone: B, classes: ClassList, input_size: u32) -> Result<Self, ModelLoadError> {
    if input_size == 0 {
      return Err(ModelLoadError::InvalidInputSize);
    }

    let warmup = NchwTensor::zeros(input_size as usize);
    let logits = backbone
      .forward(&warmup)
      .map_err(|e| ModelLoadError::Backend(e.to_string()))?;
    if logits.len() != classes.len() {
      return Err(ModelLoadError::ShapeMismatch {
        classes: classes.len(),
        outputs: logits.len(),
      });
    }

    info!(
      "分类器就绪: {} 个类别, 输入尺寸 {}x{}",
      classes.len(),
      input_size,
      input_size
    );

    Ok(Self {
      backbone,
      classes,
      input_size,
    })
  }

  pub fn classes(&self) -> &ClassList {
    &self.classes
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  pub fn classify(&mut self, tile: &RgbaImage) -> Result<Prediction, ClassifyError> {
    let (width, height) = tile.dimensions();
    if width == 0 || height == 0 {
      return Err(ClassifyError::Decode { width, height });
    }

    let tensor = NchwTensor::from_rgba(tile, self.input_size);
    let logits = self.backbone.forward(&tensor)?;
    if logits.len() != self.classes.len() {
      return Err(ClassifyError::Inference(format!(
        "输出宽度 {} 与类别数 {} 不一致",
        logits.len(),
        self.classes.len()
      )));
    }

    let probs = softmax(&logits)
      .ok_or_else(|| ClassifyError::Inference("模型输出包含非有限值".to_string()))?;
    let (index, confidence) = probs
      .iter()
      .copied()
      .enumerate()
      .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
        if p > best.1 { (i, p) } else { best }
      });

    let label = self
      .classes
      .name(index)
      .ok_or_else(|| ClassifyError::Inference(format!("类别下标越界: {}", index)))?;

    Ok(Prediction {
      label: label.to_string(),
      confidence: confidence.clamp(0.0, 1.0),
    })
  }
}

impl<B: Backbone> Model for TileClassifier<B> {
  type Input = RgbaImage;
  type Output = Prediction;
  type Error = ClassifyError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.classify(input)
  }
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxBackbone, OnnxBackboneBuilder};

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  /// 按红色通道均值给出 logits：偏红判为第 0 类，否则第 1 类
  struct RedBackbone {
    width: usize,
  }

  impl Backbone for RedBackbone {
    fn forward(&mut self, input: &NchwTensor) -> Result<Vec<f32>, ClassifyError> {
      let plane = input.size() * input.size();
      let red = input.as_slice()[..plane].iter().sum::<f32>() / plane as f32;
      let mut logits = vec![0.0; self.width];
      logits[0] = red * 4.0;
      if self.width > 1 {
        logits[1] = -red * 4.0;
      }
      Ok(logits)
    }
  }

  fn classes(names: &[&str]) -> ClassList {
    ClassList::new(names.iter().map(|s| s.to_string()).collect()).unwrap()
  }

  #[test]
  fn test_softmax_is_distribution() {
    let probs = softmax(&[1.0, 2.0, 3.0]).unwrap();
    let sum: f32 = probs.iter().sum();
    assert!((sum - 1.0).abs() < 1e-5);
    assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    assert!(softmax(&[f32::NAN, 1.0]).is_none());
    assert!(softmax(&[]).is_none());
  }

  #[test]
  fn test_softmax_large_logits() {
    let probs = softmax(&[1000.0, 0.0]).unwrap();
    assert!((probs[0] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn test_classify_picks_argmax() {
    let backbone = RedBackbone { width: 2 };
    let mut classifier = TileClassifier::new(backbone, classes(&["shrine", "empty"]), 8).unwrap();

    let red = RgbaImage::from_pixel(30, 30, Rgba([255, 0, 0, 255]));
    let prediction = classifier.classify(&red).unwrap();
    assert_eq!(prediction.label, "shrine");
    assert!(prediction.confidence > 0.5 && prediction.confidence <= 1.0);

    let dark = RgbaImage::from_pixel(3, 90, Rgba([0, 0, 0, 255]));
    let prediction = classifier.infer(&dark).unwrap();
    assert_eq!(prediction.label, "empty");
    assert!(classifier.classes().contains(&prediction.label));
  }

  #[test]
  fn test_shape_mismatch_at_load() {
    let backbone = RedBackbone { width: 3 };
    let err = TileClassifier::new(backbone, classes(&["a", "b"]), 8)
      .err()
      .unwrap();
    assert!(matches!(
      err,
      ModelLoadError::ShapeMismatch {
        classes: 2,
        outputs: 3
      }
    ));
  }

  #[test]
  fn test_zero_input_size_rejected() {
    let backbone = RedBackbone { width: 2 };
    let err = TileClassifier::new(backbone, classes(&["a", "b"]), 0)
      .err()
      .unwrap();
    assert!(matches!(err, ModelLoadError::InvalidInputSize));
  }

  #[test]
  fn test_empty_tile_is_decode_error() {
    let backbone = RedBackbone { width: 2 };
    let mut classifier = TileClassifier::new(backbone, classes(&["a", "b"]), 8).unwrap();
    let err = classifier.classify(&RgbaImage::new(0, 4)).unwrap_err();
    assert!(err.is_decode());
  }

  #[test]
  fn test_manifest_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.json");
    std::fs::write(&path, r#"{ "classes": ["chest", "shrine", "empty"] }"#).unwrap();
    let list = ClassList::from_manifest(&path).unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.name(1), Some("shrine"));
    assert_eq!(list.iter().collect::<Vec<_>>(), vec!["chest", "shrine", "empty"]);

    std::fs::write(&path, r#"{ "classes": [] }"#).unwrap();
    assert!(matches!(
      ClassList::from_manifest(&path),
      Err(ModelLoadError::EmptyClassList)
    ));

    std::fs::write(&path, "classes = 1").unwrap();
    assert!(matches!(
      ClassList::from_manifest(&path),
      Err(ModelLoadError::ManifestFormat { .. })
    ));
  }
}
