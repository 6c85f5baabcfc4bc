// 该文件是 Tuzhi （图志） 项目的一部分。
// src/args.rs - 各个程序共用的命令行参数
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
use std::time::Duration;

use clap::Args;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  grid::{GridError, MapGrid, MapRegion},
  hotkey::{HotkeyError, Key, KeyBindings},
  output::{BackgroundMode, ComposeError, Compositor, IconSet, SaveImageFileOutput},
  pipeline::TilePipeline,
  task::Annotator,
};

/// 截图、模型、网格相关参数
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
  /// 模型 URL，例如 onnx:models/main.onnx
  #[arg(long, value_name = "MODEL", default_value = "onnx:models/main.onnx")]
  pub model: Url,

  /// 类别清单 JSON，默认与模型同名
  #[arg(long, value_name = "FILE")]
  pub classes: Option<PathBuf>,

  /// 图标目录，文件名为 {label}_overlay.png
  #[arg(long, value_name = "DIR", default_value = "overlays")]
  pub icons: PathBuf,

  /// 分类前把图块写入该目录
  #[arg(long, value_name = "DIR")]
  pub tile_dir: Option<PathBuf>,

  /// 每轮把原始截图写入该文件，例如 map_capture.png
  #[arg(long, value_name = "FILE")]
  pub capture_dump: Option<PathBuf>,

  /// 模型输入边长
  #[arg(long, default_value = "133", value_name = "PX")]
  pub input_size: u32,

  /// 地图区域左上角 x
  #[arg(long, default_value = "627", value_name = "PX")]
  pub map_x: u32,

  /// 地图区域左上角 y
  #[arg(long, default_value = "207", value_name = "PX")]
  pub map_y: u32,

  /// 地图区域边长
  #[arg(long, default_value = "665", value_name = "PX")]
  pub map_size: u32,

  /// 网格维度
  #[arg(long, default_value = "5", value_name = "N")]
  pub grid: u32,

  /// 推理线程数
  #[arg(long, default_value = "1", value_name = "N")]
  pub threads: usize,

  /// 截图来源: screen: 或 image:<path>
  #[arg(long, value_name = "SOURCE", default_value = "screen:")]
  pub capture: Url,
}

impl PipelineArgs {
  pub fn map_grid(&self) -> Result<MapGrid, GridError> {
    MapGrid::new(
      MapRegion::new(self.map_x, self.map_y, self.map_size),
      self.grid,
    )
  }

  pub fn tile_pipeline(&self, grid: MapGrid) -> TilePipeline {
    TilePipeline::new(grid).with_tile_dir(self.tile_dir.clone())
  }

  pub fn icon_set(&self) -> Result<IconSet, ComposeError> {
    IconSet::load_dir(&self.icons)
  }

  /// 读取图标目录并组装一轮流程
  pub fn annotator(
    &self,
    grid: MapGrid,
    background: BackgroundMode,
  ) -> Result<Annotator, ComposeError> {
    let compositor = Compositor::new(grid, self.icon_set()?);
    Ok(
      Annotator::new(self.tile_pipeline(grid), compositor, background)
        .with_capture_dump(self.capture_dump.clone()),
    )
  }

  pub fn log_summary(&self) {
    info!("模型: {}", self.model);
    info!("截图来源: {}", self.capture);
    info!("图标目录: {}", self.icons.display());
    info!(
      "地图区域: ({}, {}) 边长 {}, 网格 {}x{}",
      self.map_x, self.map_y, self.map_size, self.grid, self.grid
    );
  }
}

/// 热键参数
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
  /// 截图并标注
  #[arg(long, default_value = "F9", value_name = "KEY")]
  pub generate_key: Key,

  /// 显示/隐藏叠加窗口
  #[arg(long, default_value = "m", value_name = "KEY")]
  pub toggle_key: Key,

  /// 退出
  #[arg(long, default_value = "]", value_name = "KEY")]
  pub quit_key: Key,

  /// 按键轮询间隔（毫秒）
  #[arg(long, default_value = "20", value_name = "MS")]
  pub poll_ms: u64,
}

impl KeyArgs {
  pub fn bindings(&self, with_toggle: bool) -> Result<KeyBindings, HotkeyError> {
    KeyBindings::new(
      self.generate_key,
      with_toggle.then_some(self.toggle_key),
      self.quit_key,
    )
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_ms.max(1))
  }
}

/// 静态导出参数
#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
  /// 输出 URL，附加 ?record 同时写出预测记录
  #[arg(long, value_name = "OUTPUT", default_value = "image:annotated_map.png")]
  pub output: Url,

  /// 在导出图上标注类别和置信度所用的字体
  #[arg(long, value_name = "TTF")]
  pub label_font: Option<PathBuf>,
}

impl OutputArgs {
  pub fn save_image_output(&self, grid: MapGrid) -> anyhow::Result<SaveImageFileOutput> {
    let output = SaveImageFileOutput::from_url(&self.output)?;
    info!("输出路径: {}", output.path().display());

    #[cfg(feature = "draw_labels")]
    let output = match &self.label_font {
      Some(path) => output.with_draw(Some(crate::output::draw::Draw::from_font_file(path, grid)?)),
      None => output,
    };
    #[cfg(not(feature = "draw_labels"))]
    {
      let _ = grid;
      if self.label_font.is_some() {
        tracing::warn!("未启用 draw_labels 功能，忽略 --label-font");
      }
    }
    Ok(output)
  }
}

/// 解析 `RRGGBB` 或 `#RRGGBB`
pub fn parse_key_color(s: &str) -> Result<[u8; 3], String> {
  let hex = s.strip_prefix('#').unwrap_or(s);
  if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(format!("颜色格式应为 RRGGBB: {s}"));
  }
  let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string());
  Ok([channel(0)?, channel(2)?, channel(4)?])
}
