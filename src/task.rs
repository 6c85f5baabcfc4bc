// 该文件是 Tuzhi （图志） 项目的一部分。
// src/task.rs - 截图、分类、合成的编排
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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use image::RgbaImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  grid::TileCoord,
  input::{CaptureError, ScreenCapture},
  model::{ClassifyError, Model, Prediction},
  output::{BackgroundMode, ComposeError, Compositor, OverlayImage, Render},
  pipeline::{PipelineError, PredictionGrid, TilePipeline},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 一轮失败时的阶段和原因
#[derive(Error, Debug)]
pub enum CycleError {
  #[error("截图阶段失败: {0}")]
  Capture(#[from] CaptureError),
  #[error("无法保存截图 {path}: {source}")]
  CaptureDump {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("分类阶段失败: {0}")]
  Pipeline(#[from] PipelineError),
  #[error("合成阶段失败: {0}")]
  Compose(#[from] ComposeError),
  #[error("输出阶段失败: {0}")]
  Render(Box<dyn std::error::Error + Send + Sync>),
}

impl CycleError {
  pub fn stage(&self) -> &'static str {
    match self {
      CycleError::Capture(_) | CycleError::CaptureDump { .. } => "capture",
      CycleError::Pipeline(PipelineError::Crop { .. }) => "crop",
      CycleError::Pipeline(_) => "classify",
      CycleError::Compose(_) => "compose",
      CycleError::Render(_) => "render",
    }
  }

  pub fn coord(&self) -> Option<TileCoord> {
    match self {
      CycleError::Pipeline(e) => e.coord(),
      _ => None,
    }
  }
}

#[derive(Debug)]
pub struct CycleReport {
  pub predictions: PredictionGrid,
  pub capture_time: Duration,
  pub classify_time: Duration,
  pub total_time: Duration,
}

/// 一轮完整的 截图 -> 分类 -> 合成 -> 输出
pub struct Annotator {
  pipeline: TilePipeline,
  compositor: Compositor,
  background: BackgroundMode,
  capture_dump: Option<PathBuf>,
}

impl Annotator {
  pub fn new(pipeline: TilePipeline, compositor: Compositor, background: BackgroundMode) -> Self {
    Self {
      pipeline,
      compositor,
      background,
      capture_dump: None,
    }
  }

  /// 每轮把原始截图覆盖写入该文件
  pub fn with_capture_dump(mut self, path: Option<PathBuf>) -> Self {
    self.capture_dump = path;
    self
  }

  fn dump_capture(&self, shot: &RgbaImage) -> Result<(), CycleError> {
    let Some(path) = &self.capture_dump else {
      return Ok(());
    };
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|e| CycleError::CaptureDump {
        path: path.clone(),
        source: image::ImageError::IoError(e),
      })?;
    }
    shot.save(path).map_err(|source| CycleError::CaptureDump {
      path: path.clone(),
      source,
    })?;
    debug!("截图已保存到: {}", path.display());
    Ok(())
  }

  pub fn run_cycle<C, M, O>(
    &self,
    capture: &mut C,
    model: &mut M,
    output: &O,
  ) -> Result<CycleReport, CycleError>
  where
    C: ScreenCapture,
    M: Model<Input = RgbaImage, Output = Prediction, Error = ClassifyError>,
    O: Render<OverlayImage, PredictionGrid>,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    let start = Instant::now();
    let shot = capture.capture()?;
    let capture_time = start.elapsed();
    debug!("截图完成: {}x{}, 耗时 {:.2?}", shot.width(), shot.height(), capture_time);
    self.dump_capture(&shot)?;

    let predictions = self.pipeline.classify_grid(&shot, model)?;
    let classify_time = start.elapsed() - capture_time;
    for (coord, p) in predictions.iter() {
      info!(
        "({},{}) {} ({:.1}%)",
        coord.row,
        coord.col,
        p.label,
        p.confidence * 100.0
      );
    }

    let background = self.background.prepare(&shot, self.compositor.grid())?;
    let overlay = self.compositor.composite(&predictions, background);
    output
      .render_result(&overlay, &predictions)
      .map_err(|e| CycleError::Render(Box::new(e)))?;

    let total_time = start.elapsed();
    info!(
      "本轮完成: 分类耗时 {:.2?}, 总耗时 {:.2?}",
      classify_time, total_time
    );
    Ok(CycleReport {
      predictions,
      capture_time,
      classify_time,
      total_time,
    })
  }
}

/// 同一时刻最多一轮在进行
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
  busy: Arc<AtomicBool>,
}

impl SingleFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// 已有一轮在进行时返回 None
  pub fn try_acquire(&self) -> Option<FlightToken> {
    self
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| FlightToken {
        busy: self.busy.clone(),
      })
  }

  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::Acquire)
  }
}

/// 丢弃时释放 `SingleFlight`
#[derive(Debug)]
pub struct FlightToken {
  busy: Arc<AtomicBool>,
}

impl Drop for FlightToken {
  fn drop(&mut self) {
    self.busy.store(false, Ordering::Release);
  }
}

/// 进程级退出标志，退出键和 Ctrl-C 共用
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
  flag: Arc<AtomicBool>,
}

impl Shutdown {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn trigger(&self) {
    self.flag.store(true, Ordering::Release);
  }

  pub fn is_triggered(&self) -> bool {
    self.flag.load(Ordering::Acquire)
  }
}

/// 只跑一轮，失败即返回错误
pub struct OneShotTask {
  annotator: Annotator,
}

impl OneShotTask {
  pub fn new(annotator: Annotator) -> Self {
    Self { annotator }
  }
}

impl<C, M, O> Task<C, M, O> for OneShotTask
where
  C: ScreenCapture,
  M: Model<Input = RgbaImage, Output = Prediction, Error = ClassifyError>,
  O: Render<OverlayImage, PredictionGrid>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = CycleError;

  fn run_task(self, mut input: C, mut model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let report = self.annotator.run_cycle(&mut input, &mut model, &output)?;
    info!(
      "任务完成: {} 个图块, 截图耗时 {:.2?}",
      report.predictions.len(),
      report.capture_time
    );
    Ok(())
  }
}

/// 每收到一个触发令牌跑一轮；单轮失败只记录日志，通道关闭后返回
pub struct TriggeredTask {
  annotator: Annotator,
  requests: Receiver<FlightToken>,
}

impl TriggeredTask {
  pub fn new(annotator: Annotator, requests: Receiver<FlightToken>) -> Self {
    Self {
      annotator,
      requests,
    }
  }
}

impl<C, M, O> Task<C, M, O> for TriggeredTask
where
  C: ScreenCapture,
  M: Model<Input = RgbaImage, Output = Prediction, Error = ClassifyError>,
  O: Render<OverlayImage, PredictionGrid>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: C, mut model: M, output: O) -> Result<(), Self::Error> {
    info!("等待触发...");
    let (mut succeeded, mut failed) = (0usize, 0usize);
    for token in self.requests.iter() {
      match self.annotator.run_cycle(&mut input, &mut model, &output) {
        Ok(_) => succeeded += 1,
        Err(e) => {
          failed += 1;
          match e.coord() {
            Some(coord) => error!("本轮中止 [{}] 图块 {}: {}", e.stage(), coord, e),
            None => error!("本轮中止 [{}]: {}", e.stage(), e),
          }
        }
      }
      drop(token);
    }
    if failed > 0 {
      warn!("共 {} 轮失败", failed);
    }
    info!("触发通道已关闭，共完成 {} 轮", succeeded);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    grid::{MapGrid, MapRegion},
    output::IconSet,
  };
  use image::Rgba;
  use std::cell::RefCell;
  use std::convert::Infallible;
  use std::rc::Rc;
  use std::sync::mpsc;

  struct StubCapture {
    shots: Vec<Result<RgbaImage, CaptureError>>,
  }

  impl ScreenCapture for StubCapture {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
      if self.shots.is_empty() {
        return Err(CaptureError::EmptyPath);
      }
      self.shots.remove(0)
    }
  }

  /// 红色分量大于 128 判为 chest
  struct RedModel;

  impl Model for RedModel {
    type Input = RgbaImage;
    type Output = Prediction;
    type Error = ClassifyError;

    fn infer(&mut self, input: &RgbaImage) -> Result<Prediction, ClassifyError> {
      let label = if input.get_pixel(0, 0)[0] > 128 {
        "chest"
      } else {
        "empty"
      };
      Ok(Prediction {
        label: label.to_string(),
        confidence: 0.8,
      })
    }
  }

  #[derive(Clone, Default)]
  struct Collect {
    overlays: Rc<RefCell<Vec<OverlayImage>>>,
  }

  impl Render<OverlayImage, PredictionGrid> for Collect {
    type Error = Infallible;

    fn render_result(&self, frame: &OverlayImage, _: &PredictionGrid) -> Result<(), Infallible> {
      self.overlays.borrow_mut().push(frame.clone());
      Ok(())
    }
  }

  fn annotator(background: BackgroundMode) -> Annotator {
    let grid = MapGrid::new(MapRegion::new(2, 2, 8), 2).unwrap();
    let mut icons = IconSet::new();
    icons.insert("chest", RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])));
    Annotator::new(TilePipeline::new(grid), Compositor::new(grid, icons), background)
  }

  fn shot() -> RgbaImage {
    // 左上图块为红色，其余为黑色
    RgbaImage::from_fn(12, 12, |x, y| {
      if (2..6).contains(&x) && (2..6).contains(&y) {
        Rgba([255, 0, 0, 255])
      } else {
        Rgba([0, 0, 0, 255])
      }
    })
  }

  #[test]
  fn test_cycle_live_background() {
    let annotator = annotator(BackgroundMode::Transparent { key: [0, 255, 0] });
    let mut capture = StubCapture {
      shots: vec![Ok(shot())],
    };
    let output = Collect::default();

    let report = annotator
      .run_cycle(&mut capture, &mut RedModel, &output)
      .unwrap();
    assert_eq!(report.predictions.labels(), vec![vec!["chest", "empty"], vec!["empty", "empty"]]);

    let overlays = output.overlays.borrow();
    let image = overlays[0].as_image();
    assert_eq!(image.dimensions(), (8, 8));
    assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
    assert_eq!(image.get_pixel(5, 5), &Rgba([0, 255, 0, 0]));
  }

  #[test]
  fn test_cycle_errors_are_stage_tagged() {
    let annotator = annotator(BackgroundMode::MapPixels);
    let output = Collect::default();

    let mut capture = StubCapture { shots: vec![] };
    let err = annotator
      .run_cycle(&mut capture, &mut RedModel, &output)
      .unwrap_err();
    assert_eq!(err.stage(), "capture");

    let mut capture = StubCapture {
      shots: vec![Ok(RgbaImage::new(6, 6))],
    };
    let err = annotator
      .run_cycle(&mut capture, &mut RedModel, &output)
      .unwrap_err();
    assert_eq!(err.stage(), "crop");
    assert_eq!(err.coord(), Some(TileCoord::new(0, 1)));
    assert!(output.overlays.borrow().is_empty());
  }

  #[test]
  fn test_single_flight_rejects_while_busy() {
    let flight = SingleFlight::new();
    let token = flight.try_acquire().unwrap();
    assert!(flight.is_busy());
    assert!(flight.try_acquire().is_none());
    drop(token);
    assert!(!flight.is_busy());
    assert!(flight.try_acquire().is_some());
  }

  #[test]
  fn test_triggered_task_survives_failed_cycle() {
    let annotator = annotator(BackgroundMode::MapPixels);
    let (first, second) = (SingleFlight::new(), SingleFlight::new());
    let (tx, rx) = mpsc::channel();
    tx.send(first.try_acquire().unwrap()).unwrap();
    tx.send(second.try_acquire().unwrap()).unwrap();
    drop(tx);

    let output = Collect::default();
    let capture = StubCapture {
      shots: vec![Err(CaptureError::EmptyPath), Ok(shot())],
    };
    TriggeredTask::new(annotator, rx)
      .run_task(capture, RedModel, output.clone())
      .unwrap();

    assert_eq!(output.overlays.borrow().len(), 1);
    assert!(!first.is_busy());
    assert!(!second.is_busy());
  }

  #[test]
  fn test_cycle_dumps_raw_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump").join("map_capture.png");
    let dumping = annotator(BackgroundMode::MapPixels).with_capture_dump(Some(path.clone()));
    let mut capture = StubCapture {
      shots: vec![Ok(shot())],
    };
    dumping
      .run_cycle(&mut capture, &mut RedModel, &Collect::default())
      .unwrap();
    assert_eq!(image::open(&path).unwrap().to_rgba8(), shot());

    let unwritable =
      annotator(BackgroundMode::MapPixels).with_capture_dump(Some(dir.path().to_path_buf()));
    let mut capture = StubCapture {
      shots: vec![Ok(shot())],
    };
    let err = unwritable
      .run_cycle(&mut capture, &mut RedModel, &Collect::default())
      .unwrap_err();
    assert!(matches!(err, CycleError::CaptureDump { .. }));
    assert_eq!(err.stage(), "capture");
  }
}
