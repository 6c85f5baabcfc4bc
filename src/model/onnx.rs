// 该文件是 Tuzhi （图志） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use ort::session::{Session, builder::GraphOptimizationLevel};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_file_path,
  frame::NchwTensor,
  model::{Backbone, ClassList, ClassifyError, ModelLoadError, TileClassifier},
};

fn backend_error<E: std::fmt::Display>(err: E) -> ModelLoadError {
  ModelLoadError::Backend(err.to_string())
}

fn inference_error<E: std::fmt::Display>(err: E) -> ClassifyError {
  ClassifyError::Inference(err.to_string())
}

pub struct OnnxBackbone {
  session: Session,
}

pub struct OnnxBackboneBuilder {
  model_path: PathBuf,
  classes_path: Option<PathBuf>,
  threads: usize,
}

impl FromUrlWithScheme for OnnxBackboneBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxBackboneBuilder {
  type Error = ModelLoadError;

  /// `onnx:models/main.onnx` 或 `onnx:///abs/main.onnx?classes=/abs/classes.json`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        found: url.scheme().to_string(),
      });
    }

    let classes_path = url
      .query_pairs()
      .find(|(k, _)| k == "classes")
      .map(|(_, v)| PathBuf::from(v.as_ref()));

    Ok(OnnxBackboneBuilder {
      model_path: url_file_path(url),
      classes_path,
      threads: 1,
    })
  }
}

impl OnnxBackboneBuilder {
  pub fn threads(mut self, threads: usize) -> Self {
    self.threads = threads.max(1);
    self
  }

  /// 命令行显式指定的类别清单优先于 URL 中的 `classes` 参数
  pub fn classes(mut self, path: Option<PathBuf>) -> Self {
    if path.is_some() {
      self.classes_path = path;
    }
    self
  }

  /// 未指定时使用与模型同名的 `.json` 文件
  pub fn classes_path(&self) -> PathBuf {
    self
      .classes_path
      .clone()
      .unwrap_or_else(|| self.model_path.with_extension("json"))
  }

  pub fn build(self) -> Result<OnnxBackbone, ModelLoadError> {
    if !self.model_path.is_file() {
      return Err(ModelLoadError::MissingModel(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let session = Session::builder()
      .map_err(backend_error)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(backend_error)?
      .with_intra_threads(self.threads)
      .map_err(backend_error)?
      .commit_from_file(&self.model_path)
      .map_err(backend_error)?;
    debug!("ONNX 会话已创建, 线程数: {}", self.threads);

    Ok(OnnxBackbone { session })
  }

  /// 读取类别清单、创建会话，并校验输出宽度
  pub fn build_classifier(
    self,
    input_size: u32,
  ) -> Result<TileClassifier<OnnxBackbone>, ModelLoadError> {
    let classes = ClassList::from_manifest(&self.classes_path())?;
    let backbone = self.build()?;
    TileClassifier::new(backbone, classes, input_size)
  }
}

impl Backbone for OnnxBackbone {
  fn forward(&mut self, input: &NchwTensor) -> Result<Vec<f32>, ClassifyError> {
    let shape = input.shape();
    let input_value =
      ort::value::Value::from_array((shape.as_slice(), input.as_slice().to_vec().into_boxed_slice()))
        .map_err(inference_error)?;

    let outputs = self
      .session
      .run(ort::inputs![input_value])
      .map_err(inference_error)?;

    let (_, logits) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(inference_error)?;
    Ok(logits.to_vec())
  }
}
