// 该文件是 Tuzhi （图志） 项目的一部分。
// src/bin/annotate.rs - 按热键截图并导出标注地图
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

use std::sync::mpsc;
use std::thread;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;

use tuzhi::{
  FromUrl,
  args::{KeyArgs, OutputArgs, PipelineArgs},
  hotkey::{HotkeyDispatcher, X11KeyPoller},
  input::InputWrapper,
  model::OnnxBackboneBuilder,
  output::BackgroundMode,
  task::{Shutdown, SingleFlight, Task, TriggeredTask},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub pipeline: PipelineArgs,

  #[command(flatten)]
  pub output: OutputArgs,

  #[command(flatten)]
  pub keys: KeyArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  args.pipeline.log_summary();

  // 启动阶段的错误直接退出，不会进入监听
  let grid = args.pipeline.map_grid()?;
  let annotator = args.pipeline.annotator(grid, BackgroundMode::MapPixels)?;
  let model = OnnxBackboneBuilder::from_url(&args.pipeline.model)?
    .threads(args.pipeline.threads)
    .classes(args.pipeline.classes.clone())
    .build_classifier(args.pipeline.input_size)?;
  let capture = InputWrapper::from_url(&args.pipeline.capture)?;
  let output = args.output.save_image_output(grid)?;
  let bindings = args.keys.bindings(false)?;
  let poller = X11KeyPoller::new(&bindings)?;

  let shutdown = Shutdown::new();
  {
    let shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      shutdown.trigger();
    })?;
  }

  let (tx, rx) = mpsc::channel();
  let worker = thread::spawn(move || TriggeredTask::new(annotator, rx).run_task(capture, model, output));

  info!(
    "按 {} 截图标注，按 {} 退出",
    args.keys.generate_key, args.keys.quit_key
  );
  let dispatcher = HotkeyDispatcher::new(SingleFlight::new(), tx, None, shutdown.clone());
  let polled = poller.run(args.keys.poll_interval(), &dispatcher, &shutdown);
  drop(dispatcher);

  worker.join().map_err(|_| anyhow!("工作线程异常退出"))??;
  polled?;

  info!("退出");
  Ok(())
}
