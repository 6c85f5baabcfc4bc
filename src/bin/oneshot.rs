// 该文件是 Tuzhi （图志） 项目的一部分。
// src/bin/oneshot.rs - 截图一次并导出标注地图
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tuzhi::{
  FromUrl,
  args::{OutputArgs, PipelineArgs},
  input::InputWrapper,
  model::OnnxBackboneBuilder,
  output::BackgroundMode,
  task::{OneShotTask, Task},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub pipeline: PipelineArgs,

  #[command(flatten)]
  pub output: OutputArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  args.pipeline.log_summary();

  let grid = args.pipeline.map_grid()?;
  let annotator = args.pipeline.annotator(grid, BackgroundMode::MapPixels)?;
  let model = OnnxBackboneBuilder::from_url(&args.pipeline.model)?
    .threads(args.pipeline.threads)
    .classes(args.pipeline.classes.clone())
    .build_classifier(args.pipeline.input_size)?;
  let capture = InputWrapper::from_url(&args.pipeline.capture)?;
  let output = args.output.save_image_output(grid)?;

  let now = std::time::Instant::now();
  OneShotTask::new(annotator).run_task(capture, model, output)?;
  info!("完成，耗时: {:.2?}", now.elapsed());

  Ok(())
}
