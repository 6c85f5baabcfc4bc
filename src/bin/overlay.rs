// 该文件是 Tuzhi （图志） 项目的一部分。
// src/bin/overlay.rs - 在游戏地图上实时叠加图标
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
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{error, info};
use url::Url;

use tuzhi::{
  FromUrl,
  args::{KeyArgs, PipelineArgs, parse_key_color},
  hotkey::{HotkeyDispatcher, X11KeyPoller},
  input::InputWrapper,
  model::OnnxBackboneBuilder,
  output::{BackgroundMode, SaveImageFileOutput, Tee},
  overlay::{
    HideOverlayCapture, OverlayPresenter, OverlaySlot, PresenterControl, SurfaceConfig,
    x11::X11Overlay,
  },
  task::{Shutdown, SingleFlight, Task, TriggeredTask},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub pipeline: PipelineArgs,

  #[command(flatten)]
  pub keys: KeyArgs,

  /// 透明键色，图标中不要使用这个颜色
  #[arg(long, default_value = "00FF00", value_name = "RRGGBB", value_parser = parse_key_color)]
  pub key_color: [u8; 3],

  /// 叠加窗口刷新间隔（毫秒）
  #[arg(long, default_value = "50", value_name = "MS")]
  pub refresh_ms: u64,

  /// 每轮同时保存叠加图，例如 image:final_overlay.png
  #[arg(long, value_name = "OUTPUT")]
  pub save_overlay: Option<Url>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  args.pipeline.log_summary();

  let grid = args.pipeline.map_grid()?;
  let key = args.key_color;
  let annotator = args
    .pipeline
    .annotator(grid, BackgroundMode::Transparent { key })?;
  let model = OnnxBackboneBuilder::from_url(&args.pipeline.model)?
    .threads(args.pipeline.threads)
    .classes(args.pipeline.classes.clone())
    .build_classifier(args.pipeline.input_size)?;
  let capture = InputWrapper::from_url(&args.pipeline.capture)?;
  let save_overlay = args
    .save_overlay
    .as_ref()
    .map(SaveImageFileOutput::from_url)
    .transpose()?;
  let bindings = args.keys.bindings(true)?;
  let poller = X11KeyPoller::new(&bindings)?;
  let surface = X11Overlay::new(SurfaceConfig::for_grid(&grid, args.key_color))?;
  let refresh = Duration::from_millis(args.refresh_ms.max(1));

  let control = PresenterControl::new();
  let slot = OverlaySlot::new();
  let shutdown = Shutdown::new();
  {
    let shutdown = shutdown.clone();
    let control = control.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      shutdown.trigger();
      control.request_close();
    })?;
  }

  let (tx, rx) = mpsc::channel();
  let worker = {
    let capture = HideOverlayCapture::new(capture, control.clone(), refresh);
    let output = Tee::new(slot.clone(), save_overlay);
    thread::spawn(move || TriggeredTask::new(annotator, rx).run_task(capture, model, output))
  };

  let listener = {
    let dispatcher =
      HotkeyDispatcher::new(SingleFlight::new(), tx, Some(control.clone()), shutdown.clone());
    let control = control.clone();
    let shutdown = shutdown.clone();
    let interval = args.keys.poll_interval();
    thread::spawn(move || {
      if let Err(e) = poller.run(interval, &dispatcher, &shutdown) {
        error!("热键监听失败: {}", e);
      }
      control.request_close();
    })
  };

  info!(
    "按 {} 生成叠加，按 {} 显示/隐藏，按 {} 退出",
    args.keys.generate_key, args.keys.toggle_key, args.keys.quit_key
  );
  let presenter = OverlayPresenter::new(surface, control, slot, key);
  // 返回的窗口在此销毁
  drop(presenter.run(refresh));

  // 窗口被外部关闭时也要让监听线程退出
  shutdown.trigger();
  listener.join().map_err(|_| anyhow!("热键线程异常退出"))?;
  worker.join().map_err(|_| anyhow!("工作线程异常退出"))??;

  info!("退出");
  Ok(())
}
